use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use super::{EngineSettings, WorkflowEngine};
use crate::audit::HistoryAction;
use crate::clock::ManualClock;
use crate::domain::actor::Actor;
use crate::domain::report::{ReportId, WorkflowStatus};
use crate::domain::workflow::{
    ReturnPolicy, WorkflowConditions, WorkflowDefinition, WorkflowId, WorkflowPatch, WorkflowStep,
};
use crate::errors::{ApplicationError, DomainError};
use crate::notify::RecordingNotifier;
use crate::predicate::{Condition, Predicate};
use crate::store::{InMemoryWorkflowStore, WorkflowStore};
use crate::targets::{StaticDirectory, StepTarget};
use crate::testing::{base_time, directory, hours_after_base, report, two_step_workflow};

struct Harness {
    engine: WorkflowEngine,
    store: Arc<InMemoryWorkflowStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with(directory(), EngineSettings::default())
    }

    fn with(directory: StaticDirectory, settings: EngineSettings) -> Self {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let clock = Arc::new(ManualClock::new(base_time()));
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(directory),
            Arc::new(RecordingNotifier::default()),
            settings,
        )
        .with_clock(clock.clone());
        Self { engine, store, clock }
    }

    async fn seed(&self, workflow: &WorkflowDefinition) {
        self.store.insert_workflow(workflow).await.expect("seed workflow");
    }
}

fn manager() -> Actor {
    Actor::new("mgr-1")
}

fn finance() -> Actor {
    Actor::new("fin-1")
}

fn report_id(id: &str) -> ReportId {
    ReportId::new(id)
}

fn domain_error(error: ApplicationError) -> DomainError {
    match error {
        ApplicationError::Domain(domain) => domain,
        other => panic!("expected domain error, got {other:?}"),
    }
}

/// Manager, then director only above 1000, then finance.
fn conditional_workflow() -> WorkflowDefinition {
    let mut workflow = two_step_workflow("WF-cond", base_time());
    workflow.steps = vec![
        WorkflowStep::new(1, "Manager", StepTarget::Relationship("manager".to_owned()), 24),
        WorkflowStep::new(2, "Director", StepTarget::Role("director".to_owned()), 24)
            .with_required_if(Predicate::new("amount", Condition::GreaterThan, json!(1000))),
        WorkflowStep::new(3, "Finance", StepTarget::Role("finance".to_owned()), 48),
    ];
    workflow
}

#[tokio::test]
async fn submit_binds_workflow_and_enters_first_step() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;

    let outcome = harness.engine.submit(report("R-1", 250)).await.expect("submit");

    assert_eq!(outcome.from, WorkflowStatus::Pending);
    assert_eq!(outcome.to, WorkflowStatus::InReview);
    assert_eq!(outcome.current_step, 1);
    assert_eq!(outcome.step_instance, 1);
    assert!(outcome.entries.is_empty());

    let state = harness.store.load_report_state(&report_id("R-1")).await.expect("load");
    let state = state.expect("state stored");
    assert_eq!(state.workflow_id, WorkflowId::new("WF-1"));
    assert_eq!(state.workflow_version, 1);
    assert_eq!(state.step_started_at, base_time());
}

#[tokio::test]
async fn second_submit_is_rejected() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let error = harness.engine.submit(report("R-1", 250)).await.expect_err("duplicate");

    assert!(matches!(domain_error(error), DomainError::AlreadySubmitted { .. }));
}

#[tokio::test]
async fn submit_without_applicable_workflow_fails() {
    let harness = Harness::new();
    let mut workflow = two_step_workflow("WF-big", base_time());
    workflow.conditions = Some(WorkflowConditions {
        amount_min: Some(rust_decimal::Decimal::new(10_000, 0)),
        ..WorkflowConditions::default()
    });
    harness.seed(&workflow).await;

    let error = harness.engine.submit(report("R-1", 50)).await.expect_err("no workflow");

    assert_eq!(domain_error(error), DomainError::NoApplicableWorkflow);
}

#[tokio::test]
async fn default_workflow_catches_unmatched_reports() {
    let settings = EngineSettings {
        default_workflow_id: Some(WorkflowId::new("WF-default")),
        ..EngineSettings::default()
    };
    let harness = Harness::with(directory(), settings);
    let mut default = two_step_workflow("WF-default", base_time());
    default.conditions = Some(WorkflowConditions {
        categories: vec!["never".to_owned()],
        ..WorkflowConditions::default()
    });
    harness.seed(&default).await;

    harness.engine.submit(report("R-1", 50)).await.expect("fallback submit");

    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert_eq!(view.workflow.id, WorkflowId::new("WF-default"));
}

#[tokio::test]
async fn step_not_required_for_small_amounts_is_bypassed() {
    let harness = Harness::new();
    harness.seed(&conditional_workflow()).await;
    harness.engine.submit(report("R-1", 500)).await.expect("submit");

    let outcome =
        harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("approve");

    assert_eq!(outcome.current_step, 3);
    assert_eq!(outcome.to, WorkflowStatus::InReview);
    assert_eq!(outcome.entries.len(), 2);
    assert_eq!(outcome.entries[0].action, HistoryAction::Approve);
    assert_eq!(outcome.entries[0].actor_id, Some(manager().id));
    let bypass = &outcome.entries[1];
    assert_eq!(bypass.step_number, 2);
    assert_eq!(bypass.action, HistoryAction::Approve);
    assert!(bypass.actor_id.is_none());
    assert!(bypass.comment.as_deref().is_some_and(|c| c.contains("requiredIf")));
}

#[tokio::test]
async fn large_amounts_visit_the_conditional_step() {
    let harness = Harness::new();
    harness.seed(&conditional_workflow()).await;
    harness.engine.submit(report("R-1", 1500)).await.expect("submit");

    let outcome =
        harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("approve");

    assert_eq!(outcome.current_step, 2);
    assert_eq!(outcome.entries.len(), 1);
}

#[tokio::test]
async fn approving_every_step_completes_the_report() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("step 1");
    let outcome = harness
        .engine
        .approve(&report_id("R-1"), &finance(), Some("looks fine".to_owned()))
        .await
        .expect("step 2");

    assert_eq!(outcome.to, WorkflowStatus::Approved);
    let history = harness.store.list_history(&report_id("R-1")).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].comment.as_deref(), Some("looks fine"));

    let error = harness
        .engine
        .approve(&report_id("R-1"), &finance(), None)
        .await
        .expect_err("already approved");
    assert!(matches!(
        domain_error(error),
        DomainError::InvalidTransition { status: WorkflowStatus::Approved, .. }
    ));
}

#[tokio::test]
async fn only_resolved_approvers_may_act() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let error = harness
        .engine
        .approve(&report_id("R-1"), &finance(), None)
        .await
        .expect_err("finance is not the manager");
    assert!(matches!(domain_error(error), DomainError::NotEligible { step_number: 1, .. }));

    let admin = Actor::new("admin-1").with_permission("workflow:override");
    let outcome =
        harness.engine.approve(&report_id("R-1"), &admin, None).await.expect("override");
    assert_eq!(outcome.current_step, 2);
}

#[tokio::test]
async fn reject_is_terminal_and_keeps_category() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let blank = harness
        .engine
        .reject(&report_id("R-1"), &manager(), "  ".to_owned(), None)
        .await
        .expect_err("comment required");
    assert!(matches!(domain_error(blank), DomainError::Validation(_)));

    let outcome = harness
        .engine
        .reject(
            &report_id("R-1"),
            &manager(),
            "missing receipts for hotel".to_owned(),
            Some("documentation".to_owned()),
        )
        .await
        .expect("reject");

    assert_eq!(outcome.to, WorkflowStatus::Rejected);
    assert_eq!(outcome.entries[0].rejection_category.as_deref(), Some("documentation"));

    let error = harness
        .engine
        .return_report(&report_id("R-1"), &manager(), "please fix".to_owned())
        .await
        .expect_err("rejected is terminal");
    assert!(matches!(domain_error(error), DomainError::InvalidTransition { .. }));
}

#[tokio::test]
async fn hard_restart_return_goes_back_to_first_step() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");
    harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("step 1");

    harness.clock.advance(Duration::hours(3));
    let outcome = harness
        .engine
        .return_report(&report_id("R-1"), &finance(), "attach the invoice".to_owned())
        .await
        .expect("return");

    assert_eq!(outcome.to, WorkflowStatus::InReview);
    assert_eq!(outcome.current_step, 1);
    assert_eq!(outcome.step_instance, 3);
    assert_eq!(outcome.entries[0].action, HistoryAction::Return);

    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert_eq!(view.step_started_at, hours_after_base(3));
    assert_eq!(view.sla_deadline, Some(hours_after_base(27)));
}

#[tokio::test]
async fn soft_restart_return_reopens_the_same_step() {
    let harness = Harness::new();
    let mut workflow = two_step_workflow("WF-1", base_time());
    workflow.on_return_policy = ReturnPolicy::SoftRestart;
    harness.seed(&workflow).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");
    harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("step 1");

    let outcome = harness
        .engine
        .return_report(&report_id("R-1"), &finance(), "attach the invoice".to_owned())
        .await
        .expect("return");

    assert_eq!(outcome.current_step, 2);
    assert_eq!(outcome.step_instance, 3);
}

#[tokio::test]
async fn broken_relationship_stalls_the_step() {
    let directory = StaticDirectory::new().with_role_member("finance", "fin-1");
    let harness = Harness::with(directory, EngineSettings::default());
    harness.seed(&two_step_workflow("WF-1", base_time())).await;

    let outcome = harness.engine.submit(report("R-1", 250)).await.expect("submit");
    assert_eq!(outcome.to, WorkflowStatus::InReview);

    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert!(view.stalled_reason.as_deref().is_some_and(|reason| reason.contains("manager")));

    let error = harness
        .engine
        .approve(&report_id("R-1"), &manager(), None)
        .await
        .expect_err("stalled");
    assert!(matches!(domain_error(error), DomainError::UnresolvableTarget { step_number: 1, .. }));

    let admin = Actor::new("admin-1").with_permission("workflow:override");
    let outcome =
        harness.engine.approve(&report_id("R-1"), &admin, None).await.expect("override");
    assert_eq!(outcome.current_step, 2);
    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert!(view.stalled_reason.is_none());
}

#[tokio::test]
async fn directory_outage_surfaces_as_integration_failure() {
    let directory = directory();
    directory.set_unavailable(true);
    let harness = Harness::with(directory, EngineSettings::default());
    harness.seed(&two_step_workflow("WF-1", base_time())).await;

    let error = harness.engine.submit(report("R-1", 250)).await.expect_err("outage");

    assert!(matches!(error, ApplicationError::Integration(_)));
    assert!(harness.store.load_report_state(&report_id("R-1")).await.expect("load").is_none());
}

#[tokio::test]
async fn system_steps_resolve_without_a_human() {
    let harness = Harness::new();
    let mut workflow = two_step_workflow("WF-1", base_time());
    workflow.steps.insert(0, WorkflowStep::new(1, "Policy check", StepTarget::System, 1));
    workflow.steps[1].step_number = 5;
    workflow.steps[2].step_number = 9;
    harness.seed(&workflow).await;

    let outcome = harness.engine.submit(report("R-1", 250)).await.expect("submit");

    assert_eq!(outcome.current_step, 5);
    assert_eq!(outcome.step_instance, 2);
    assert_eq!(outcome.entries.len(), 1);
    assert!(outcome.entries[0].actor_id.is_none());
}

#[tokio::test]
async fn all_steps_bypassed_approves_on_submit() {
    let harness = Harness::new();
    let mut workflow = two_step_workflow("WF-1", base_time());
    for step in &mut workflow.steps {
        step.skip_if = Some(Predicate::new("amount", Condition::LessThan, json!(100)));
    }
    harness.seed(&workflow).await;

    let outcome = harness.engine.submit(report("R-1", 20)).await.expect("submit");

    assert_eq!(outcome.to, WorkflowStatus::Approved);
    assert_eq!(outcome.entries.len(), 2);
}

#[tokio::test]
async fn in_flight_reports_keep_their_workflow_version() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let patch = WorkflowPatch {
        steps: Some(vec![WorkflowStep::new(
            1,
            "Finance only",
            StepTarget::Role("finance".to_owned()),
            12,
        )]),
        ..WorkflowPatch::default()
    };
    let v2 = harness
        .engine
        .update_workflow(&WorkflowId::new("WF-1"), patch)
        .await
        .expect("update");
    assert_eq!(v2.version, 2);

    let outcome =
        harness.engine.approve(&report_id("R-1"), &manager(), None).await.expect("v1 step 1");
    assert_eq!(outcome.current_step, 2);

    harness.engine.submit(report("R-2", 250)).await.expect("submit on v2");
    let view = harness.engine.status(&report_id("R-2")).await.expect("status");
    assert_eq!(view.workflow.version, 2);
    assert_eq!(view.current_step_name.as_deref(), Some("Finance only"));
}

#[tokio::test]
async fn status_reports_overdue_steps() {
    let harness = Harness::new();
    harness.seed(&two_step_workflow("WF-1", base_time())).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert!(!view.overdue);
    assert_eq!(view.total_steps, 2);

    harness.clock.advance(Duration::hours(25));
    let view = harness.engine.status(&report_id("R-1")).await.expect("status");
    assert!(view.overdue);
    assert!(view.history.is_empty());
}

#[tokio::test]
async fn unknown_report_is_not_found() {
    let harness = Harness::new();

    let error = harness.engine.status(&report_id("R-404")).await.expect_err("missing");

    assert!(matches!(error, ApplicationError::NotFound { entity: "report", .. }));
}

#[tokio::test]
async fn concurrent_approvals_let_exactly_one_win() {
    let directory = directory().with_role_member("approvers", "a-1").with_role_member("approvers", "a-2");
    let harness = Harness::with(directory, EngineSettings::default());
    let mut workflow = two_step_workflow("WF-1", base_time());
    workflow.steps =
        vec![WorkflowStep::new(1, "Any approver", StepTarget::Role("approvers".to_owned()), 24)];
    harness.seed(&workflow).await;
    harness.engine.submit(report("R-1", 250)).await.expect("submit");

    let id = report_id("R-1");
    let first = Actor::new("a-1");
    let second = Actor::new("a-2");
    let (a, b) = tokio::join!(
        harness.engine.approve(&id, &first, None),
        harness.engine.approve(&id, &second, None),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let loser = results.into_iter().find_map(Result::err).expect("one loses");
    assert!(matches!(
        domain_error(loser),
        DomainError::InvalidTransition { status: WorkflowStatus::Approved, .. }
    ));
    assert_eq!(harness.store.list_history(&id).await.expect("history").len(), 1);
}

#[tokio::test]
async fn invalid_workflow_definitions_are_rejected() {
    let harness = Harness::new();
    let draft = serde_json::from_value(json!({
        "name": "Broken",
        "steps": [{
            "stepNumber": 1,
            "name": "Manager",
            "targetType": "relationship",
            "targetValue": "manager",
            "slaHours": 0
        }]
    }))
    .expect("draft parses");

    let error = harness.engine.create_workflow(draft).await.expect_err("zero sla");

    assert!(matches!(domain_error(error), DomainError::Validation(_)));
}

#[tokio::test]
async fn sla_windows_beyond_ten_years_are_rejected() {
    let harness = Harness::new();
    let draft = serde_json::from_value(json!({
        "name": "Forever",
        "steps": [{
            "stepNumber": 1,
            "name": "Manager",
            "targetType": "relationship",
            "targetValue": "manager",
            "slaHours": 4_000_000_000u32
        }]
    }))
    .expect("draft parses");

    let error = harness.engine.create_workflow(draft).await.expect_err("sla too long");

    let DomainError::Validation(message) = domain_error(error) else {
        panic!("expected a validation error");
    };
    assert!(message.contains("slaHours"));
    assert!(harness.engine.submit(report("R-1", 250)).await.is_err());
}
