use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::domain::actor::ActorId;
use crate::domain::report::{ReportId, ReportSnapshot};
use crate::domain::workflow::{ReturnPolicy, WorkflowDefinition, WorkflowId, WorkflowStep};
use crate::targets::{StaticDirectory, StepTarget};

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).single().unwrap_or_else(Utc::now)
}

pub(crate) fn hours_after_base(hours: i64) -> DateTime<Utc> {
    base_time() + Duration::hours(hours)
}

pub(crate) fn report(id: &str, amount: i64) -> ReportSnapshot {
    ReportSnapshot {
        report_id: ReportId::new(id),
        submitter_id: ActorId::new("emp-1"),
        amount: Decimal::new(amount, 0),
        category: "travel".to_owned(),
        department: "engineering".to_owned(),
        attributes: BTreeMap::new(),
    }
}

/// Manager (24h) then finance (48h).
pub(crate) fn two_step_workflow(id: &str, created_at: DateTime<Utc>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId::new(id),
        name: format!("{id} approvals"),
        version: 1,
        is_active: true,
        conditions: None,
        steps: vec![
            WorkflowStep::new(1, "Manager", StepTarget::Relationship("manager".to_owned()), 24),
            WorkflowStep::new(2, "Finance", StepTarget::Role("finance".to_owned()), 48),
        ],
        on_return_policy: ReturnPolicy::HardRestart,
        created_at,
        updated_at: created_at,
    }
}

pub(crate) fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_relationship("emp-1", "manager", "mgr-1")
        .with_relationship("mgr-1", "manager", "dir-1")
        .with_role_member("finance", "fin-1")
        .with_role_member("finance-leads", "lead-1")
        .with_role_member("director", "dir-1")
}
