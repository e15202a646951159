use std::sync::Arc;

use expensa_core::engine::{EngineSettings, WorkflowEngine};
use expensa_core::notify::TracingNotifier;
use expensa_core::scheduler::{SchedulerSettings, SlaScheduler};
use expensa_db::{connect_with_config, migrations, SqlDirectory, SqlWorkflowStore};

use crate::commands::{prepare, CommandResult, EXIT_DATABASE, EXIT_OPERATION};

/// One SLA sweep. Notices go to the log; the webhook stays with the server.
pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("tick") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_OPERATION))?;

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(SqlWorkflowStore::new(pool.clone())),
            Arc::new(SqlDirectory::new(pool.clone())),
            Arc::new(TracingNotifier),
            EngineSettings::from(&config.engine),
        ));
        let report =
            SlaScheduler::new(engine, SchedulerSettings::from(&config.scheduler)).tick().await;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(report)
    });

    match result {
        Ok(report) => {
            let details = serde_json::to_value(report).ok();
            if report.failures > 0 {
                CommandResult::failure_with(
                    "tick",
                    "sla_tick",
                    format!("{} report(s) failed during the sweep", report.failures),
                    EXIT_OPERATION,
                    details,
                )
            } else {
                CommandResult::success_with("tick", "sla sweep completed", details)
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("tick", error_class, message, exit_code)
        }
    }
}
