//! Append-only approval history.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::{Actor, ActorId};
use crate::domain::report::ReportId;
use crate::domain::workflow::WorkflowStep;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryEntryId(pub String);

impl HistoryEntryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Approve,
    Reject,
    Return,
    Escalate,
    AutoApprove,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Return => "return",
            Self::Escalate => "escalate",
            Self::AutoApprove => "auto_approve",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "return" => Some(Self::Return),
            "escalate" => Some(Self::Escalate),
            "auto_approve" => Some(Self::AutoApprove),
            _ => None,
        }
    }

    /// Actions the scheduler emits; at most one per key.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Escalate | Self::AutoApprove)
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness key for scheduler-emitted entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryKey {
    pub report_id: ReportId,
    pub step_instance: u32,
    pub action: HistoryAction,
    pub mark: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalHistoryEntry {
    pub id: HistoryEntryId,
    pub report_id: ReportId,
    pub step_number: u32,
    pub step_name: String,
    pub step_instance: u32,
    /// Empty for system and scheduler actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,
    pub action: HistoryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_mark: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_deadline: Option<DateTime<Utc>>,
    pub was_escalated: bool,
}

impl ApprovalHistoryEntry {
    pub fn new(
        report_id: ReportId,
        step: &WorkflowStep,
        step_instance: u32,
        action: HistoryAction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HistoryEntryId::generate(),
            report_id,
            step_number: step.step_number,
            step_name: step.name.clone(),
            step_instance,
            actor_id: None,
            actor_email: None,
            action,
            comment: None,
            rejection_category: None,
            notify_mark: None,
            created_at,
            sla_deadline: None,
            was_escalated: false,
        }
    }

    pub fn with_actor(mut self, actor: &Actor) -> Self {
        self.actor_id = Some(actor.id.clone());
        self.actor_email = actor.email.clone();
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|comment| !comment.trim().is_empty());
        self
    }

    pub fn with_rejection_category(mut self, category: Option<String>) -> Self {
        self.rejection_category = category;
        self
    }

    pub fn with_notify_mark(mut self, mark: u32) -> Self {
        self.notify_mark = Some(mark);
        self
    }

    pub fn with_sla_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.sla_deadline = Some(deadline);
        self
    }

    pub fn escalated(mut self, was_escalated: bool) -> Self {
        self.was_escalated = was_escalated;
        self
    }

    pub fn idempotency_key(&self) -> Option<HistoryKey> {
        if !self.action.is_scheduled() {
            return None;
        }
        Some(HistoryKey {
            report_id: self.report_id.clone(),
            step_instance: self.step_instance,
            action: self.action,
            mark: self.notify_mark.unwrap_or_default(),
        })
    }
}

/// Read-side queries over one report's ordered history.
pub struct HistoryView<'a> {
    entries: &'a [ApprovalHistoryEntry],
}

impl<'a> HistoryView<'a> {
    pub fn new(entries: &'a [ApprovalHistoryEntry]) -> Self {
        Self { entries }
    }

    pub fn for_instance(
        &self,
        step_instance: u32,
    ) -> impl Iterator<Item = &'a ApprovalHistoryEntry> + '_ {
        self.entries.iter().filter(move |entry| entry.step_instance == step_instance)
    }

    pub fn fired_marks(&self, step_instance: u32) -> BTreeSet<u32> {
        self.for_instance(step_instance)
            .filter(|entry| entry.action == HistoryAction::Escalate)
            .filter_map(|entry| entry.notify_mark)
            .collect()
    }

    pub fn was_escalated(&self, step_instance: u32) -> bool {
        self.for_instance(step_instance).any(|entry| entry.action == HistoryAction::Escalate)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ApprovalHistoryEntry, HistoryAction, HistoryView};
    use crate::domain::actor::Actor;
    use crate::domain::report::ReportId;
    use crate::domain::workflow::WorkflowStep;
    use crate::targets::StepTarget;

    fn step() -> WorkflowStep {
        WorkflowStep::new(1, "Manager", StepTarget::Relationship("manager".to_owned()), 24)
    }

    fn entry(instance: u32, action: HistoryAction) -> ApprovalHistoryEntry {
        ApprovalHistoryEntry::new(ReportId::new("R-1"), &step(), instance, action, Utc::now())
    }

    #[test]
    fn only_scheduled_actions_carry_idempotency_keys() {
        let approve = entry(1, HistoryAction::Approve).with_actor(&Actor::new("mgr-1"));
        assert!(approve.idempotency_key().is_none());

        let escalate = entry(1, HistoryAction::Escalate).with_notify_mark(24);
        let key = escalate.idempotency_key().expect("escalation key");
        assert_eq!(key.mark, 24);
        assert_eq!(key.step_instance, 1);

        let auto = entry(2, HistoryAction::AutoApprove).with_notify_mark(48);
        assert_eq!(auto.idempotency_key().expect("auto key").action, HistoryAction::AutoApprove);
    }

    #[test]
    fn view_scopes_marks_to_the_step_instance() {
        let entries = vec![
            entry(1, HistoryAction::Escalate).with_notify_mark(12),
            entry(1, HistoryAction::Return).with_actor(&Actor::new("mgr-1")),
            entry(2, HistoryAction::Escalate).with_notify_mark(24),
        ];
        let view = HistoryView::new(&entries);

        assert_eq!(view.fired_marks(1).into_iter().collect::<Vec<_>>(), vec![12]);
        assert_eq!(view.fired_marks(2).into_iter().collect::<Vec<_>>(), vec![24]);
        assert!(view.was_escalated(2));
        assert!(!view.was_escalated(3));
    }

    #[test]
    fn blank_comments_are_dropped() {
        let entry = entry(1, HistoryAction::Approve).with_comment(Some("   ".to_owned()));
        assert!(entry.comment.is_none());
    }

    #[test]
    fn action_encoding_round_trips() {
        for action in [
            HistoryAction::Approve,
            HistoryAction::Reject,
            HistoryAction::Return,
            HistoryAction::Escalate,
            HistoryAction::AutoApprove,
        ] {
            assert_eq!(HistoryAction::parse(action.as_str()), Some(action));
        }
    }
}
