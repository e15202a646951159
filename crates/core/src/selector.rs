use crate::domain::report::SelectionCriteria;
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionReason {
    Matched { specificity: usize },
    DefaultFallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    pub workflow: WorkflowDefinition,
    pub reason: SelectionReason,
}

/// Picks the workflow a submitted report is bound to.
///
/// The most specific matching active workflow wins; ties go to the highest
/// version, then the most recently created, then the lowest id.
#[derive(Clone, Debug, Default)]
pub struct WorkflowSelector {
    default_workflow_id: Option<WorkflowId>,
}

impl WorkflowSelector {
    pub fn new(default_workflow_id: Option<WorkflowId>) -> Self {
        Self { default_workflow_id }
    }

    pub fn default_workflow_id(&self) -> Option<&WorkflowId> {
        self.default_workflow_id.as_ref()
    }

    /// `default_workflow` is the latest version of the configured default, if
    /// one is configured and exists.
    pub fn select(
        &self,
        candidates: Vec<WorkflowDefinition>,
        criteria: &SelectionCriteria,
        default_workflow: Option<WorkflowDefinition>,
    ) -> Result<Selection, DomainError> {
        let mut matching: Vec<WorkflowDefinition> = candidates
            .into_iter()
            .filter(|workflow| workflow.is_active && workflow.matches(criteria))
            .collect();

        matching.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(workflow) = matching.into_iter().next() {
            let specificity = workflow.specificity();
            return Ok(Selection { workflow, reason: SelectionReason::Matched { specificity } });
        }

        match (self.default_workflow_id.as_ref(), default_workflow) {
            (Some(id), Some(workflow)) if &workflow.id == id && workflow.is_active => {
                Ok(Selection { workflow, reason: SelectionReason::DefaultFallback })
            }
            _ => Err(DomainError::NoApplicableWorkflow),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{SelectionReason, WorkflowSelector};
    use crate::domain::report::SelectionCriteria;
    use crate::domain::workflow::{WorkflowConditions, WorkflowId};
    use crate::errors::DomainError;
    use crate::testing::two_step_workflow;

    fn criteria(amount: i64) -> SelectionCriteria {
        SelectionCriteria {
            amount: Decimal::new(amount, 0),
            category: "travel".to_owned(),
            department: "engineering".to_owned(),
        }
    }

    fn conditions(min: Option<i64>, categories: &[&str]) -> Option<WorkflowConditions> {
        Some(WorkflowConditions {
            amount_min: min.map(|value| Decimal::new(value, 0)),
            categories: categories.iter().map(|value| (*value).to_owned()).collect(),
            ..WorkflowConditions::default()
        })
    }

    #[test]
    fn most_specific_match_wins() {
        let now = Utc::now();
        let mut broad = two_step_workflow("WF-broad", now);
        broad.conditions = conditions(Some(100), &[]);
        let mut narrow = two_step_workflow("WF-narrow", now);
        narrow.conditions = conditions(Some(100), &["travel"]);

        let selection = WorkflowSelector::default()
            .select(vec![broad, narrow], &criteria(500), None)
            .expect("selection");

        assert_eq!(selection.workflow.id, WorkflowId::new("WF-narrow"));
        assert_eq!(selection.reason, SelectionReason::Matched { specificity: 2 });
    }

    #[test]
    fn ties_break_on_version_then_creation_time() {
        let now = Utc::now();
        let mut older = two_step_workflow("WF-a", now - Duration::days(3));
        older.version = 4;
        let mut newer = two_step_workflow("WF-b", now);
        newer.version = 2;

        let selection = WorkflowSelector::default()
            .select(vec![newer.clone(), older.clone()], &criteria(50), None)
            .expect("selection");
        assert_eq!(selection.workflow.id, older.id);

        newer.version = 4;
        let selection = WorkflowSelector::default()
            .select(vec![older, newer.clone()], &criteria(50), None)
            .expect("selection");
        assert_eq!(selection.workflow.id, newer.id);
    }

    #[test]
    fn inactive_and_non_matching_workflows_are_ignored() {
        let now = Utc::now();
        let mut inactive = two_step_workflow("WF-off", now);
        inactive.is_active = false;
        let mut expensive = two_step_workflow("WF-big", now);
        expensive.conditions = conditions(Some(10_000), &[]);

        let error = WorkflowSelector::default()
            .select(vec![inactive, expensive], &criteria(50), None)
            .expect_err("nothing applies");

        assert_eq!(error, DomainError::NoApplicableWorkflow);
    }

    #[test]
    fn falls_back_to_configured_default() {
        let now = Utc::now();
        let default = two_step_workflow("WF-default", now);
        let mut expensive = two_step_workflow("WF-big", now);
        expensive.conditions = conditions(Some(10_000), &[]);

        let selector = WorkflowSelector::new(Some(WorkflowId::new("WF-default")));
        let selection =
            selector.select(vec![expensive], &criteria(50), Some(default)).expect("fallback");

        assert_eq!(selection.workflow.id, WorkflowId::new("WF-default"));
        assert_eq!(selection.reason, SelectionReason::DefaultFallback);
    }

    #[test]
    fn inactive_default_is_not_used() {
        let now = Utc::now();
        let mut default = two_step_workflow("WF-default", now);
        default.is_active = false;

        let selector = WorkflowSelector::new(Some(WorkflowId::new("WF-default")));
        let error = selector.select(Vec::new(), &criteria(50), Some(default)).expect_err("none");

        assert_eq!(error, DomainError::NoApplicableWorkflow);
    }
}
