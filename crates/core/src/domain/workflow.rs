use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::report::SelectionCriteria;
use crate::errors::DomainError;
use crate::predicate::Predicate;
use crate::targets::{normalize_key, StepTarget, TargetSpec};

/// Longest SLA or escalation window a step may declare: ten years of hours.
pub const MAX_WINDOW_HOURS: u32 = 87_660;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("WF-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnPolicy {
    #[default]
    HardRestart,
    SoftRestart,
}

impl ReturnPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HardRestart => "hard_restart",
            Self::SoftRestart => "soft_restart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hard_restart" => Some(Self::HardRestart),
            "soft_restart" => Some(Self::SoftRestart),
            _ => None,
        }
    }
}

/// Selection conditions. An absent field matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub departments: Vec<String>,
}

impl WorkflowConditions {
    pub fn matches(&self, criteria: &SelectionCriteria) -> bool {
        if self.amount_min.is_some_and(|min| criteria.amount < min) {
            return false;
        }
        if self.amount_max.is_some_and(|max| criteria.amount > max) {
            return false;
        }
        if !self.categories.is_empty() && !contains_key(&self.categories, &criteria.category) {
            return false;
        }
        if !self.departments.is_empty() && !contains_key(&self.departments, &criteria.department) {
            return false;
        }
        true
    }

    /// Number of populated condition fields.
    pub fn specificity(&self) -> usize {
        usize::from(self.amount_min.is_some())
            + usize::from(self.amount_max.is_some())
            + usize::from(!self.categories.is_empty())
            + usize::from(!self.departments.is_empty())
    }

    fn validate(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.amount_min, self.amount_max) {
            if min > max {
                return Err(format!("amountMin {min} exceeds amountMax {max}"));
            }
        }
        if self.categories.iter().chain(&self.departments).any(|value| value.trim().is_empty()) {
            return Err("condition sets must not contain blank entries".to_owned());
        }
        Ok(())
    }
}

fn contains_key(candidates: &[String], value: &str) -> bool {
    let key = normalize_key(value);
    candidates.iter().any(|candidate| normalize_key(candidate) == key)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub enabled: bool,
    /// Falls back to the step's own target when absent.
    pub target: Option<StepTarget>,
    pub notify_at_hours: Vec<u32>,
    pub auto_approve_after_hours: Option<u32>,
}

impl EscalationPolicy {
    /// Notification marks in firing order, without duplicates.
    pub fn marks(&self) -> Vec<u32> {
        self.notify_at_hours.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(target) = &self.target {
            target.validate()?;
        }
        if self.notify_at_hours.contains(&0) {
            return Err("escalation notifyAtHours entries must be positive".to_owned());
        }
        if self.notify_at_hours.iter().any(|hours| *hours > MAX_WINDOW_HOURS) {
            return Err(format!(
                "escalation notifyAtHours entries may not exceed {MAX_WINDOW_HOURS}"
            ));
        }
        match self.auto_approve_after_hours {
            Some(0) => {
                return Err("escalation autoApproveAfterHours must be positive".to_owned());
            }
            Some(hours) if hours > MAX_WINDOW_HOURS => {
                return Err(format!(
                    "escalation autoApproveAfterHours may not exceed {MAX_WINDOW_HOURS}"
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscalationSpec {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(flatten)]
    target: Option<TargetSpec>,
    #[serde(default)]
    notify_at_hours: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auto_approve_after_hours: Option<u32>,
}

fn enabled_by_default() -> bool {
    true
}

impl Serialize for EscalationPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EscalationSpec {
            enabled: self.enabled,
            target: self.target.clone().map(TargetSpec::from),
            notify_at_hours: self.notify_at_hours.clone(),
            auto_approve_after_hours: self.auto_approve_after_hours,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EscalationPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spec = EscalationSpec::deserialize(deserializer)?;
        let target =
            spec.target.map(StepTarget::try_from).transpose().map_err(serde::de::Error::custom)?;
        Ok(Self {
            enabled: spec.enabled,
            target,
            notify_at_hours: spec.notify_at_hours,
            auto_approve_after_hours: spec.auto_approve_after_hours,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub step_number: u32,
    pub name: String,
    #[serde(flatten)]
    pub target: StepTarget,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_if: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<Predicate>,
    pub sla_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
}

impl WorkflowStep {
    pub fn new(
        step_number: u32,
        name: impl Into<String>,
        target: StepTarget,
        sla_hours: u32,
    ) -> Self {
        Self {
            step_number,
            name: name.into(),
            target,
            required: false,
            required_if: None,
            skip_if: None,
            sla_hours,
            escalation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_required_if(mut self, predicate: Predicate) -> Self {
        self.required_if = Some(predicate);
        self
    }

    pub fn with_skip_if(mut self, predicate: Predicate) -> Self {
        self.skip_if = Some(predicate);
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationPolicy) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn sla_deadline(&self, started_at: DateTime<Utc>) -> Result<DateTime<Utc>, DomainError> {
        started_at
            .checked_add_signed(chrono::Duration::hours(i64::from(self.sla_hours)))
            .ok_or_else(|| {
                DomainError::InvariantViolation(format!(
                    "step {} sla of {}h overflows the calendar",
                    self.step_number, self.sla_hours
                ))
            })
    }

    /// The escalation block, if it is switched on.
    pub fn active_escalation(&self) -> Option<&EscalationPolicy> {
        self.escalation.as_ref().filter(|policy| policy.enabled)
    }

    fn validate(&self) -> Result<(), String> {
        let label = format!("step {}", self.step_number);
        if self.step_number == 0 {
            return Err("step numbers start at 1".to_owned());
        }
        if self.name.trim().is_empty() {
            return Err(format!("{label} needs a name"));
        }
        if self.sla_hours == 0 {
            return Err(format!("{label} slaHours must be positive"));
        }
        if self.sla_hours > MAX_WINDOW_HOURS {
            return Err(format!("{label} slaHours may not exceed {MAX_WINDOW_HOURS}"));
        }
        self.target.validate().map_err(|error| format!("{label}: {error}"))?;
        for predicate in self.required_if.iter().chain(&self.skip_if) {
            predicate.validate().map_err(|error| format!("{label}: {error}"))?;
        }
        if let Some(escalation) = &self.escalation {
            escalation.validate().map_err(|error| format!("{label}: {error}"))?;
        }
        Ok(())
    }
}

/// One immutable version of a workflow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<WorkflowConditions>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub on_return_policy: ReturnPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::Validation("workflow name is required".to_owned()));
        }
        if self.version == 0 {
            return Err(DomainError::Validation("workflow versions start at 1".to_owned()));
        }
        if self.steps.is_empty() {
            return Err(DomainError::Validation("workflow needs at least one step".to_owned()));
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            step.validate().map_err(DomainError::Validation)?;
            if !seen.insert(step.step_number) {
                return Err(DomainError::Validation(format!(
                    "step number {} appears more than once",
                    step.step_number
                )));
            }
        }

        if let Some(conditions) = &self.conditions {
            conditions.validate().map_err(DomainError::Validation)?;
        }
        Ok(())
    }

    pub fn matches(&self, criteria: &SelectionCriteria) -> bool {
        self.conditions.as_ref().map_or(true, |conditions| conditions.matches(criteria))
    }

    pub fn specificity(&self) -> usize {
        self.conditions.as_ref().map_or(0, WorkflowConditions::specificity)
    }

    pub fn step(&self, step_number: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }

    pub fn first_step_number(&self) -> Option<u32> {
        self.steps.iter().map(|step| step.step_number).min()
    }

    pub fn next_step_after(&self, step_number: u32) -> Option<u32> {
        self.steps.iter().map(|step| step.step_number).filter(|n| *n > step_number).min()
    }

    /// Steps in evaluation order.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.step_number);
        steps
    }
}

/// Body of a workflow create request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDraft {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: Option<WorkflowConditions>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub on_return_policy: ReturnPolicy,
}

impl WorkflowDraft {
    pub fn into_definition(self, id: WorkflowId, now: DateTime<Utc>) -> WorkflowDefinition {
        let mut steps = self.steps;
        steps.sort_by_key(|step| step.step_number);
        WorkflowDefinition {
            id,
            name: self.name.trim().to_owned(),
            version: 1,
            is_active: self.is_active,
            conditions: self.conditions,
            steps,
            on_return_policy: self.on_return_policy,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of a workflow update request. Absent fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub conditions: Option<WorkflowConditions>,
    #[serde(default)]
    pub steps: Option<Vec<WorkflowStep>>,
    #[serde(default)]
    pub on_return_policy: Option<ReturnPolicy>,
}

impl WorkflowPatch {
    /// Produces the next version; the current one is left untouched.
    pub fn apply(self, current: &WorkflowDefinition, now: DateTime<Utc>) -> WorkflowDefinition {
        let mut steps = self.steps.unwrap_or_else(|| current.steps.clone());
        steps.sort_by_key(|step| step.step_number);
        WorkflowDefinition {
            id: current.id.clone(),
            name: self.name.map_or_else(|| current.name.clone(), |name| name.trim().to_owned()),
            version: current.version + 1,
            is_active: self.is_active.unwrap_or(current.is_active),
            conditions: self.conditions.or_else(|| current.conditions.clone()),
            steps,
            on_return_policy: self.on_return_policy.unwrap_or(current.on_return_policy),
            created_at: current.created_at,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{
        EscalationPolicy, ReturnPolicy, WorkflowConditions, WorkflowDraft, WorkflowId,
        WorkflowPatch, WorkflowStep, MAX_WINDOW_HOURS,
    };
    use crate::domain::report::SelectionCriteria;
    use crate::errors::DomainError;
    use crate::targets::StepTarget;

    fn criteria(amount: i64, category: &str, department: &str) -> SelectionCriteria {
        SelectionCriteria {
            amount: Decimal::new(amount, 0),
            category: category.to_owned(),
            department: department.to_owned(),
        }
    }

    fn draft() -> WorkflowDraft {
        serde_json::from_value(json!({
            "name": "Travel over 1k",
            "conditions": { "amountMin": 1000, "categories": ["travel"] },
            "steps": [
                {
                    "stepNumber": 20,
                    "name": "Finance",
                    "targetType": "role",
                    "targetValue": "finance",
                    "slaHours": 48,
                    "escalation": {
                        "enabled": true,
                        "targetType": "role",
                        "targetValue": "finance-leads",
                        "notifyAtHours": [36, 24],
                        "autoApproveAfterHours": 72
                    }
                },
                {
                    "stepNumber": 10,
                    "name": "Manager",
                    "targetType": "relationship",
                    "targetValue": "manager",
                    "required": true,
                    "slaHours": 24
                }
            ],
            "onReturnPolicy": "soft_restart"
        }))
        .expect("draft parses")
    }

    #[test]
    fn draft_parses_wire_shape_and_orders_steps() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("timestamp");
        let workflow = draft().into_definition(WorkflowId::new("WF-1"), now);

        assert!(workflow.is_active);
        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.on_return_policy, ReturnPolicy::SoftRestart);
        assert_eq!(workflow.steps[0].step_number, 10);
        assert_eq!(workflow.first_step_number(), Some(10));
        assert_eq!(workflow.next_step_after(10), Some(20));
        assert_eq!(workflow.next_step_after(20), None);

        let escalation = workflow.steps[1].escalation.clone().expect("escalation");
        assert_eq!(escalation.target, Some(StepTarget::Role("finance-leads".to_owned())));
        assert_eq!(escalation.marks(), vec![24, 36]);
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn conditions_match_ranges_and_sets() {
        let conditions = WorkflowConditions {
            amount_min: Some(Decimal::new(1000, 0)),
            amount_max: Some(Decimal::new(5000, 0)),
            categories: vec!["Travel".to_owned()],
            departments: Vec::new(),
        };

        assert!(conditions.matches(&criteria(1000, "travel", "sales")));
        assert!(conditions.matches(&criteria(5000, "TRAVEL", "eng")));
        assert!(!conditions.matches(&criteria(999, "travel", "sales")));
        assert!(!conditions.matches(&criteria(5001, "travel", "sales")));
        assert!(!conditions.matches(&criteria(2000, "meals", "sales")));
        assert_eq!(conditions.specificity(), 3);
        assert_eq!(WorkflowConditions::default().specificity(), 0);
    }

    #[test]
    fn validation_rejects_duplicate_step_numbers() {
        let now = Utc::now();
        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.steps[1].step_number = 10;

        let error = workflow.validate().expect_err("duplicate step");
        assert!(matches!(error, DomainError::Validation(message) if message.contains("more than once")));
    }

    #[test]
    fn validation_caps_sla_and_escalation_windows() {
        let now = Utc::now();
        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.steps[0].sla_hours = MAX_WINDOW_HOURS;
        assert!(workflow.validate().is_ok());

        workflow.steps[0].sla_hours = 4_000_000_000;
        let error = workflow.validate().expect_err("sla too long");
        let DomainError::Validation(message) = error else {
            panic!("expected a validation error");
        };
        assert!(message.contains("slaHours"));

        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        if let Some(policy) = workflow.steps[1].escalation.as_mut() {
            policy.notify_at_hours.push(MAX_WINDOW_HOURS + 1);
        }
        assert!(workflow.validate().is_err());

        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        if let Some(policy) = workflow.steps[1].escalation.as_mut() {
            policy.auto_approve_after_hours = Some(u32::MAX);
        }
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn deadline_past_the_calendar_is_an_error_not_a_panic() {
        let finance = StepTarget::Role("finance".to_owned());
        let step = WorkflowStep::new(1, "Manager", finance.clone(), u32::MAX);
        let late = Utc.with_ymd_and_hms(262_000, 1, 1, 0, 0, 0).single().expect("timestamp");

        let error = step.sla_deadline(late).expect_err("overflow");
        assert!(matches!(error, DomainError::InvariantViolation(_)));

        let start = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("timestamp");
        let step = WorkflowStep::new(1, "Manager", finance, 24);
        let deadline = step.sla_deadline(start).expect("deadline");
        assert_eq!(deadline, start + chrono::Duration::hours(24));
    }

    #[test]
    fn validation_rejects_zero_sla_and_blank_targets() {
        let now = Utc::now();
        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.steps[0].sla_hours = 0;
        assert!(workflow.validate().is_err());

        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.steps[0].target = StepTarget::Role("  ".to_owned());
        assert!(workflow.validate().is_err());

        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.steps.clear();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_amount_range() {
        let now = Utc::now();
        let mut workflow = draft().into_definition(WorkflowId::new("WF-1"), now);
        workflow.conditions = Some(WorkflowConditions {
            amount_min: Some(Decimal::new(10, 0)),
            amount_max: Some(Decimal::new(5, 0)),
            ..WorkflowConditions::default()
        });

        assert!(workflow.validate().is_err());
    }

    #[test]
    fn patch_creates_next_version_and_keeps_unset_fields() {
        let created = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("timestamp");
        let later = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).single().expect("timestamp");
        let current = draft().into_definition(WorkflowId::new("WF-1"), created);

        let next = WorkflowPatch { is_active: Some(false), ..WorkflowPatch::default() }
            .apply(&current, later);

        assert_eq!(next.version, 2);
        assert!(!next.is_active);
        assert_eq!(next.name, current.name);
        assert_eq!(next.steps, current.steps);
        assert_eq!(next.created_at, created);
        assert_eq!(next.updated_at, later);
    }

    #[test]
    fn disabled_escalation_is_not_active() {
        let step = WorkflowStep::new(1, "Manager", StepTarget::Relationship("manager".to_owned()), 24)
            .with_escalation(EscalationPolicy {
                enabled: false,
                target: None,
                notify_at_hours: vec![12],
                auto_approve_after_hours: Some(48),
            });

        assert!(step.active_escalation().is_none());
    }

    #[test]
    fn step_serializes_with_flattened_target() {
        let step = WorkflowStep::new(1, "Finance", StepTarget::Role("finance".to_owned()), 24);
        let value = serde_json::to_value(&step).expect("serialize");

        assert_eq!(value["targetType"], json!("role"));
        assert_eq!(value["targetValue"], json!("finance"));
        assert_eq!(value["slaHours"], json!(24));
    }
}
