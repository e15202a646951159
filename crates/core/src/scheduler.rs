//! Periodic SLA sweep: escalation notices and auto-approval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::HistoryView;
use crate::config::SchedulerConfig;
use crate::domain::report::ReportWorkflowState;
use crate::engine::{SlaFiring, WorkflowEngine};
use crate::errors::{ApplicationError, DomainError};
use crate::store::ReviewCursor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub batch_size: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            batch_size: config.batch_size,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub scanned: usize,
    pub escalations: usize,
    pub auto_approvals: usize,
    pub overdue: usize,
    pub failures: usize,
}

pub struct SlaScheduler {
    engine: Arc<WorkflowEngine>,
    settings: SchedulerSettings,
}

impl SlaScheduler {
    pub fn new(engine: Arc<WorkflowEngine>, settings: SchedulerSettings) -> Self {
        Self { engine, settings }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(self.engine.now()).await
    }

    /// One sweep over every in-review report as of `now`, read in pages of
    /// `batch_size`. A failing report is counted and logged; the sweep
    /// carries on with the rest.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let page_size = self.settings.batch_size.max(1);
        let mut cursor: Option<ReviewCursor> = None;

        loop {
            let states = match self
                .engine
                .store()
                .list_in_review_states(cursor.as_ref(), page_size)
                .await
            {
                Ok(states) => states,
                Err(error) => {
                    error!(
                        event_name = "workflow.sla.tick_failed",
                        scanned = report.scanned,
                        error = %error,
                        "could not load reports awaiting review"
                    );
                    report.failures += 1;
                    break;
                }
            };

            for state in &states {
                report.scanned += 1;
                if let Err(error) = self.process(state, now, &mut report).await {
                    report.failures += 1;
                    warn!(
                        event_name = "workflow.sla.report_failed",
                        report_id = %state.report_id,
                        step_number = state.current_step,
                        error = %error,
                        "sla processing failed; will retry next tick"
                    );
                }
            }

            match states.last() {
                Some(last) if states.len() >= page_size as usize => {
                    cursor = Some(ReviewCursor::after(last));
                }
                _ => break,
            }
        }

        info!(
            event_name = "workflow.sla.tick_completed",
            scanned = report.scanned,
            escalations = report.escalations,
            auto_approvals = report.auto_approvals,
            overdue = report.overdue,
            failures = report.failures,
            "sla tick completed"
        );
        report
    }

    async fn process(
        &self,
        state: &ReportWorkflowState,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), ApplicationError> {
        let workflow = self.engine.bound_workflow(state).await?;
        let step = workflow.step(state.current_step).ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "report {} points at missing step {}",
                state.report_id, state.current_step
            ))
        })?;

        if now > step.sla_deadline(state.step_started_at)? {
            report.overdue += 1;
            debug!(
                event_name = "workflow.sla.overdue",
                report_id = %state.report_id,
                step_number = step.step_number,
                "step is past its sla"
            );
        }

        let Some(policy) = step.active_escalation() else {
            return Ok(());
        };

        let elapsed = now - state.step_started_at;
        let history = self.engine.store().list_history(&state.report_id).await?;
        let fired = HistoryView::new(&history).fired_marks(state.step_instance);
        let mut first_error = None;

        for mark in policy.marks() {
            if elapsed < hours(mark) || fired.contains(&mark) {
                continue;
            }
            match self.engine.fire_escalation(&state.report_id, state.step_instance, mark, now).await {
                Ok(SlaFiring::Fired(_)) => report.escalations += 1,
                Ok(SlaFiring::AlreadyFired | SlaFiring::Inert) => {}
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(after) = policy.auto_approve_after_hours {
            if elapsed >= hours(after) {
                match self
                    .engine
                    .fire_auto_approval(&state.report_id, state.step_instance, after, now)
                    .await
                {
                    Ok(SlaFiring::Fired(_)) => report.auto_approvals += 1,
                    Ok(SlaFiring::AlreadyFired | SlaFiring::Inert) => {}
                    Err(error) => {
                        first_error.get_or_insert(error);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Ticks on a fixed interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut timer = interval(self.settings.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event_name = "workflow.sla.scheduler_started",
            tick_interval_secs = self.settings.tick_interval.as_secs(),
            batch_size = self.settings.batch_size,
            "sla scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(event_name = "workflow.sla.scheduler_stopped", "sla scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn hours(value: u32) -> chrono::Duration {
    chrono::Duration::hours(i64::from(value))
}
