use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::actor::ActorId;
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};
use crate::predicate::PredicateContext;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub String);

impl ReportId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InReview,
    Approved,
    Rejected,
    Returned,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three report fields workflow selection looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub amount: Decimal,
    pub category: String,
    pub department: String,
}

/// The report as it looked when it was submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSnapshot {
    pub report_id: ReportId,
    pub submitter_id: ActorId,
    pub amount: Decimal,
    pub category: String,
    pub department: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl ReportSnapshot {
    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            amount: self.amount,
            category: self.category.clone(),
            department: self.department.clone(),
        }
    }

    /// Custom attributes sit beside the built-in fields; built-ins win on
    /// name clashes.
    pub fn predicate_context(&self) -> PredicateContext {
        let mut context = PredicateContext::new();
        for (key, value) in &self.attributes {
            context.insert(key.clone(), value.clone());
        }
        context.insert_decimal("amount", self.amount);
        context.insert("category", Value::String(self.category.clone()));
        context.insert("department", Value::String(self.department.clone()));
        context.insert("submitterId", Value::String(self.submitter_id.to_string()));
        context
    }
}

/// Per-report position in its bound workflow version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportWorkflowState {
    pub report_id: ReportId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub current_step: u32,
    pub status: WorkflowStatus,
    /// Bumped every time a step is (re)entered.
    pub step_instance: u32,
    pub step_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stalled_reason: Option<String>,
    pub report: ReportSnapshot,
    /// Optimistic concurrency token.
    pub revision: u64,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportWorkflowState {
    pub fn pending(
        report: ReportSnapshot,
        workflow: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            report_id: report.report_id.clone(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            current_step: workflow.first_step_number().unwrap_or_default(),
            status: WorkflowStatus::Pending,
            step_instance: 0,
            step_started_at: now,
            stalled_reason: None,
            report,
            revision: 1,
            submitted_at: now,
            updated_at: now,
        }
    }
}
