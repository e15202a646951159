use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::actor::ActorId;
use crate::domain::report::ReportId;
use crate::domain::workflow::WorkflowId;

/// Payload sent when a step crosses an escalation mark.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationNotice {
    pub report_id: ReportId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub step_number: u32,
    pub step_name: String,
    pub step_instance: u32,
    pub mark_hours: u32,
    /// Empty when the escalation target could not be resolved.
    pub recipients: Vec<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved_reason: Option<String>,
    pub sla_deadline: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notifier misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), NotifyError>;
}

/// Writes notices to the log and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl EscalationNotifier for TracingNotifier {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), NotifyError> {
        info!(
            event_name = "workflow.sla.notice",
            report_id = %notice.report_id,
            workflow_id = %notice.workflow_id,
            step_number = notice.step_number,
            mark_hours = notice.mark_hours,
            recipients = notice.recipients.len(),
            "escalation notice"
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<EscalationNotice>>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<EscalationNotice> {
        match self.notices.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EscalationNotifier for RecordingNotifier {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), NotifyError> {
        match self.notices.lock() {
            Ok(mut guard) => guard.push(notice.clone()),
            Err(poisoned) => poisoned.into_inner().push(notice.clone()),
        }
        Ok(())
    }
}
