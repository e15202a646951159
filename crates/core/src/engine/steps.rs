use crate::audit::HistoryAction;
use crate::domain::report::WorkflowStatus;
use crate::domain::workflow::WorkflowStep;
use crate::errors::DomainError;
use crate::predicate::PredicateContext;

/// Which actions a report status admits.
pub(crate) fn check_transition(
    status: WorkflowStatus,
    action: HistoryAction,
) -> Result<(), DomainError> {
    use HistoryAction::{Approve, AutoApprove, Escalate, Reject, Return};
    use WorkflowStatus::InReview;

    match (status, action) {
        (InReview, Approve | Reject | Return | Escalate | AutoApprove) => Ok(()),
        _ => Err(DomainError::InvalidTransition { status, action }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepActivation {
    Active,
    Bypassed(&'static str),
}

impl StepActivation {
    /// `requiredIf` gates a step on; `skipIf` gates it off unless the step is
    /// marked `required`.
    pub(crate) fn evaluate(step: &WorkflowStep, context: &PredicateContext) -> Self {
        if let Some(required_if) = &step.required_if {
            if !required_if.evaluate(context) {
                return Self::Bypassed("bypassed: requiredIf condition not met");
            }
        }
        if !step.required {
            if let Some(skip_if) = &step.skip_if {
                if skip_if.evaluate(context) {
                    return Self::Bypassed("bypassed: skipIf condition met");
                }
            }
        }
        Self::Active
    }
}
