use std::sync::Arc;

use expensa_core::config::{AppConfig, ConfigError, LoadOptions};
use expensa_core::engine::{EngineSettings, WorkflowEngine};
use expensa_core::notify::NotifyError;
use expensa_core::scheduler::{SchedulerSettings, SlaScheduler};
use expensa_db::{connect_with_config, migrations, DbPool, SqlDirectory, SqlWorkflowStore};
use thiserror::Error;
use tracing::info;

use crate::notifier::notifier_from_config;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<SlaScheduler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("escalation notifier setup failed: {0}")]
    Notifier(#[source] NotifyError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        migrations = migrations::known_migrations(),
        "database migrations applied"
    );

    let notifier = notifier_from_config(&config.notifications).map_err(BootstrapError::Notifier)?;
    let engine = Arc::new(WorkflowEngine::new(
        Arc::new(SqlWorkflowStore::new(db_pool.clone())),
        Arc::new(SqlDirectory::new(db_pool.clone())),
        notifier,
        EngineSettings::from(&config.engine),
    ));
    let scheduler =
        Arc::new(SlaScheduler::new(engine.clone(), SchedulerSettings::from(&config.scheduler)));

    info!(
        event_name = "system.bootstrap.engine_ready",
        correlation_id = "bootstrap",
        webhook = config.notifications.webhook_url.is_some(),
        scheduler_enabled = config.scheduler.enabled,
        "workflow engine wired"
    );

    Ok(Application { config, db_pool, engine, scheduler })
}
