//! Approval state machine.
//!
//! Every mutation of a report runs under that report's lock and is written
//! with a compare-and-swap on the state revision, so concurrent approvers and
//! the SLA scheduler never both advance the same step.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{ApprovalHistoryEntry, HistoryAction, HistoryView};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::domain::actor::Actor;
use crate::domain::report::{ReportId, ReportSnapshot, ReportWorkflowState, WorkflowStatus};
use crate::domain::workflow::{
    ReturnPolicy, WorkflowDefinition, WorkflowDraft, WorkflowId, WorkflowPatch, WorkflowStep,
};
use crate::errors::{ApplicationError, DomainError};
use crate::notify::{EscalationNotice, EscalationNotifier};
use crate::selector::{SelectionReason, WorkflowSelector};
use crate::store::{CommitOutcome, Page, PageRequest, StoreError, WorkflowStore};
use crate::targets::{Directory, TargetResolver};

mod locks;
mod steps;

use locks::ReportLocks;
use steps::{check_transition, StepActivation};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub default_workflow_id: Option<WorkflowId>,
    pub lookup_timeout: Duration,
    pub override_permission: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_workflow_id: config.default_workflow_id.clone().map(WorkflowId::new),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
            override_permission: config.override_permission.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitionOutcome {
    pub report_id: ReportId,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub current_step: u32,
    pub step_instance: u32,
    /// History appended by this transition, in order.
    pub entries: Vec<ApprovalHistoryEntry>,
}

/// What happened when the scheduler asked for an escalation or auto-approval.
#[derive(Clone, Debug, PartialEq)]
pub enum SlaFiring {
    Fired(ApprovalHistoryEntry),
    /// Another tick already recorded this key.
    AlreadyFired,
    /// The step instance moved on or the escalation no longer applies.
    Inert,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatusView {
    pub report_id: ReportId,
    pub status: WorkflowStatus,
    pub current_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    pub step_instance: u32,
    pub step_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_deadline: Option<DateTime<Utc>>,
    pub overdue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled_reason: Option<String>,
    pub workflow: WorkflowDefinition,
    pub history: Vec<ApprovalHistoryEntry>,
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn EscalationNotifier>,
    clock: Arc<dyn Clock>,
    selector: WorkflowSelector,
    settings: EngineSettings,
    locks: ReportLocks,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn EscalationNotifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            clock: Arc::new(SystemClock),
            selector: WorkflowSelector::new(settings.default_workflow_id.clone()),
            settings,
            locks: ReportLocks::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn create_workflow(
        &self,
        draft: WorkflowDraft,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        let workflow = draft.into_definition(WorkflowId::generate(), self.clock.now());
        workflow.validate()?;
        self.store.insert_workflow(&workflow).await.map_err(|error| match error {
            StoreError::Duplicate(_) => {
                DomainError::WorkflowConflict { workflow_id: workflow.id.to_string() }.into()
            }
            other => ApplicationError::from(other),
        })?;

        info!(
            event_name = "workflow.definition.created",
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            steps = workflow.steps.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    /// Writes a new version; reports already bound to older versions keep them.
    pub async fn update_workflow(
        &self,
        id: &WorkflowId,
        patch: WorkflowPatch,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        let current = self
            .store
            .load_latest_workflow(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("workflow", id.as_str()))?;

        let next = patch.apply(&current, self.clock.now());
        next.validate()?;
        self.store.save_workflow_version(&next).await.map_err(|error| match error {
            StoreError::Duplicate(_) => {
                DomainError::WorkflowConflict { workflow_id: id.to_string() }.into()
            }
            other => ApplicationError::from(other),
        })?;

        info!(
            event_name = "workflow.definition.versioned",
            workflow_id = %next.id,
            workflow_version = next.version,
            "workflow version saved"
        );
        Ok(next)
    }

    pub async fn get_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.store
            .load_latest_workflow(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("workflow", id.as_str()))
    }

    pub async fn list_workflows(
        &self,
        page: PageRequest,
    ) -> Result<Page<WorkflowDefinition>, ApplicationError> {
        Ok(self.store.list_workflows(page).await?)
    }

    /// Binds the report to a workflow version and enters its first active step.
    pub async fn submit(
        &self,
        report: ReportSnapshot,
    ) -> Result<TransitionOutcome, ApplicationError> {
        validate_report(&report)?;
        let report_id = report.report_id.clone();
        let _guard = self.locks.acquire(&report_id).await;

        if let Some(existing) = self.store.load_report_state(&report_id).await? {
            return Err(DomainError::AlreadySubmitted {
                report_id: report_id.to_string(),
                status: existing.status,
            }
            .into());
        }

        let criteria = report.criteria();
        let candidates = self.store.load_active_workflows_matching(&criteria).await?;
        let default_workflow = match self.selector.default_workflow_id() {
            Some(id) => self.store.load_latest_workflow(id).await?,
            None => None,
        };
        let selection = self.selector.select(candidates, &criteria, default_workflow)?;
        let workflow = selection.workflow;

        let now = self.clock.now();
        let mut state = ReportWorkflowState::pending(report, &workflow, now);
        let mut entries = Vec::new();
        self.enter_step(&workflow, &mut state, workflow.first_step_number(), now, &mut entries)
            .await?;

        match self.store.commit_transition(&state, None, &entries).await? {
            CommitOutcome::Committed => {}
            CommitOutcome::StaleRevision | CommitOutcome::DuplicateEntry => {
                return Err(DomainError::AlreadySubmitted {
                    report_id: report_id.to_string(),
                    status: WorkflowStatus::InReview,
                }
                .into());
            }
        }

        info!(
            event_name = "workflow.report.submitted",
            report_id = %report_id,
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            step_number = state.current_step,
            status = %state.status,
            fallback = matches!(selection.reason, SelectionReason::DefaultFallback),
            "report submitted for approval"
        );

        Ok(TransitionOutcome {
            report_id,
            from: WorkflowStatus::Pending,
            to: state.status,
            current_step: state.current_step,
            step_instance: state.step_instance,
            entries,
        })
    }

    pub async fn approve(
        &self,
        report_id: &ReportId,
        actor: &Actor,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.decide(report_id, actor, HistoryAction::Approve, comment, None).await
    }

    pub async fn reject(
        &self,
        report_id: &ReportId,
        actor: &Actor,
        comment: String,
        rejection_category: Option<String>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        require_comment(&comment, HistoryAction::Reject)?;
        self.decide(report_id, actor, HistoryAction::Reject, Some(comment), rejection_category)
            .await
    }

    /// Sends the report back; it re-enters review per the workflow's return
    /// policy with a fresh step instance and SLA clock.
    pub async fn return_report(
        &self,
        report_id: &ReportId,
        actor: &Actor,
        comment: String,
    ) -> Result<TransitionOutcome, ApplicationError> {
        require_comment(&comment, HistoryAction::Return)?;
        self.decide(report_id, actor, HistoryAction::Return, Some(comment), None).await
    }

    pub async fn status(
        &self,
        report_id: &ReportId,
    ) -> Result<WorkflowStatusView, ApplicationError> {
        let state = self.load_state(report_id).await?;
        let workflow = self.bound_workflow(&state).await?;
        let history = self.store.list_history(report_id).await?;
        let now = self.clock.now();

        let step = workflow.step(state.current_step);
        let sla_deadline = step
            .filter(|_| state.status == WorkflowStatus::InReview)
            .map(|step| step.sla_deadline(state.step_started_at))
            .transpose()?;

        Ok(WorkflowStatusView {
            report_id: state.report_id,
            status: state.status,
            current_step: state.current_step,
            current_step_name: step.map(|step| step.name.clone()),
            total_steps: workflow.steps.len(),
            step_instance: state.step_instance,
            step_started_at: state.step_started_at,
            sla_deadline,
            overdue: sla_deadline.is_some_and(|deadline| now > deadline),
            stalled_reason: state.stalled_reason,
            workflow,
            history,
        })
    }

    /// Records an escalation for `mark` hours on the given step instance and
    /// notifies the escalation target. History is written before the notice
    /// goes out, so a notice is sent at most once per key.
    pub async fn fire_escalation(
        &self,
        report_id: &ReportId,
        step_instance: u32,
        mark: u32,
        now: DateTime<Utc>,
    ) -> Result<SlaFiring, ApplicationError> {
        let _guard = self.locks.acquire(report_id).await;
        let Some(mut state) = self.current_instance(report_id, step_instance).await? else {
            return Ok(SlaFiring::Inert);
        };
        let workflow = self.bound_workflow(&state).await?;
        let step = current_step(&workflow, &state)?;
        let Some(policy) = step.active_escalation() else {
            return Ok(SlaFiring::Inert);
        };

        let target = policy.target.as_ref().unwrap_or(&step.target);
        let (recipients, unresolved_reason) =
            match self.resolver().resolve(target, &state.report.submitter_id).await {
                Ok(resolved) => (resolved.actors(), None),
                Err(error) if error.is_unresolvable() => (Vec::new(), Some(error.to_string())),
                Err(error) => {
                    return Err(ApplicationError::Integration(format!(
                        "escalation target for step {} of report {report_id}: {error}",
                        step.step_number
                    )));
                }
            };

        let deadline = step.sla_deadline(state.step_started_at)?;
        let comment = match &unresolved_reason {
            Some(reason) => format!("no decision after {mark}h; no escalation recipient: {reason}"),
            None => format!("no decision after {mark}h"),
        };
        let entry = ApprovalHistoryEntry::new(
            report_id.clone(),
            step,
            step_instance,
            HistoryAction::Escalate,
            now,
        )
        .with_notify_mark(mark)
        .with_sla_deadline(deadline)
        .with_comment(Some(comment))
        .escalated(true);

        let expected = state.revision;
        state.revision += 1;
        state.updated_at = now;
        match self
            .store
            .commit_transition(&state, Some(expected), slice::from_ref(&entry))
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::DuplicateEntry => return Ok(SlaFiring::AlreadyFired),
            CommitOutcome::StaleRevision => return Ok(SlaFiring::Inert),
        }

        let notice = EscalationNotice {
            report_id: report_id.clone(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            step_number: step.step_number,
            step_name: step.name.clone(),
            step_instance,
            mark_hours: mark,
            recipients,
            unresolved_reason,
            sla_deadline: deadline,
            fired_at: now,
        };
        if let Err(error) = self.notifier.notify(&notice).await {
            warn!(
                event_name = "workflow.sla.notify_failed",
                report_id = %report_id,
                step_number = step.step_number,
                mark_hours = mark,
                error = %error,
                "escalation recorded but notice was not delivered"
            );
        }

        info!(
            event_name = "workflow.sla.escalated",
            report_id = %report_id,
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            step_number = step.step_number,
            step_instance,
            mark_hours = mark,
            unresolved = notice.unresolved_reason.is_some(),
            "step escalated"
        );
        Ok(SlaFiring::Fired(entry))
    }

    /// Approves the step instance on behalf of the system once its
    /// auto-approval window has passed.
    pub async fn fire_auto_approval(
        &self,
        report_id: &ReportId,
        step_instance: u32,
        after_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<SlaFiring, ApplicationError> {
        let _guard = self.locks.acquire(report_id).await;
        let Some(mut state) = self.current_instance(report_id, step_instance).await? else {
            return Ok(SlaFiring::Inert);
        };
        let workflow = self.bound_workflow(&state).await?;
        let step = current_step(&workflow, &state)?.clone();
        let applies = step
            .active_escalation()
            .is_some_and(|policy| policy.auto_approve_after_hours == Some(after_hours));
        if !applies {
            return Ok(SlaFiring::Inert);
        }

        let history = self.store.list_history(report_id).await?;
        let was_escalated = HistoryView::new(&history).was_escalated(step_instance);
        let entry = ApprovalHistoryEntry::new(
            report_id.clone(),
            &step,
            step_instance,
            HistoryAction::AutoApprove,
            now,
        )
        .with_notify_mark(after_hours)
        .with_sla_deadline(step.sla_deadline(state.step_started_at)?)
        .with_comment(Some(format!("auto-approved after {after_hours}h without a decision")))
        .escalated(was_escalated);

        let from = state.status;
        let expected = state.revision;
        let mut entries = vec![entry.clone()];
        self.enter_step(
            &workflow,
            &mut state,
            workflow.next_step_after(step.step_number),
            now,
            &mut entries,
        )
        .await?;
        state.revision = expected + 1;
        state.updated_at = now;

        match self.store.commit_transition(&state, Some(expected), &entries).await? {
            CommitOutcome::Committed => {}
            CommitOutcome::DuplicateEntry => return Ok(SlaFiring::AlreadyFired),
            CommitOutcome::StaleRevision => return Ok(SlaFiring::Inert),
        }

        info!(
            event_name = "workflow.sla.auto_approved",
            report_id = %report_id,
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            step_number = step.step_number,
            step_instance,
            from = %from,
            to = %state.status,
            "step auto-approved"
        );
        Ok(SlaFiring::Fired(entry))
    }

    /// Workflow version a report is bound to.
    pub async fn bound_workflow(
        &self,
        state: &ReportWorkflowState,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.store
            .load_workflow_version(&state.workflow_id, state.workflow_version)
            .await?
            .ok_or_else(|| {
                DomainError::InvariantViolation(format!(
                    "report {} is bound to missing workflow {} v{}",
                    state.report_id, state.workflow_id, state.workflow_version
                ))
                .into()
            })
    }

    fn resolver(&self) -> TargetResolver<'_> {
        TargetResolver::new(self.directory.as_ref(), self.settings.lookup_timeout)
    }

    async fn load_state(
        &self,
        report_id: &ReportId,
    ) -> Result<ReportWorkflowState, ApplicationError> {
        self.store
            .load_report_state(report_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("report", report_id.as_str()))
    }

    async fn current_instance(
        &self,
        report_id: &ReportId,
        step_instance: u32,
    ) -> Result<Option<ReportWorkflowState>, ApplicationError> {
        let state = self.store.load_report_state(report_id).await?;
        Ok(state.filter(|state| {
            state.status == WorkflowStatus::InReview && state.step_instance == step_instance
        }))
    }

    async fn decide(
        &self,
        report_id: &ReportId,
        actor: &Actor,
        action: HistoryAction,
        comment: Option<String>,
        rejection_category: Option<String>,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let _guard = self.locks.acquire(report_id).await;
        let mut state = self.load_state(report_id).await?;
        check_transition(state.status, action)?;

        let workflow = self.bound_workflow(&state).await?;
        let step = current_step(&workflow, &state)?.clone();
        self.ensure_eligible(&step, &state, actor).await?;

        let history = self.store.list_history(report_id).await?;
        let was_escalated = HistoryView::new(&history).was_escalated(state.step_instance);
        let now = self.clock.now();
        let from = state.status;
        let expected = state.revision;

        let mut entries = vec![ApprovalHistoryEntry::new(
            report_id.clone(),
            &step,
            state.step_instance,
            action,
            now,
        )
        .with_actor(actor)
        .with_comment(comment)
        .with_rejection_category(rejection_category)
        .with_sla_deadline(step.sla_deadline(state.step_started_at)?)
        .escalated(was_escalated)];

        match action {
            HistoryAction::Approve => {
                let next = workflow.next_step_after(step.step_number);
                self.enter_step(&workflow, &mut state, next, now, &mut entries).await?;
            }
            HistoryAction::Reject => {
                state.status = WorkflowStatus::Rejected;
                state.stalled_reason = None;
            }
            HistoryAction::Return => {
                state.status = WorkflowStatus::Returned;
                let restart = match workflow.on_return_policy {
                    ReturnPolicy::HardRestart => workflow.first_step_number(),
                    ReturnPolicy::SoftRestart => Some(step.step_number),
                };
                self.enter_step(&workflow, &mut state, restart, now, &mut entries).await?;
            }
            HistoryAction::Escalate | HistoryAction::AutoApprove => {
                return Err(DomainError::InvariantViolation(format!(
                    "{action} is reserved for the scheduler"
                ))
                .into());
            }
        }

        state.revision = expected + 1;
        state.updated_at = now;
        match self.store.commit_transition(&state, Some(expected), &entries).await? {
            CommitOutcome::Committed => {}
            CommitOutcome::StaleRevision | CommitOutcome::DuplicateEntry => {
                return Err(DomainError::StaleState { report_id: report_id.to_string() }.into());
            }
        }

        info!(
            event_name = decision_event_name(action, state.status),
            report_id = %report_id,
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            step_number = step.step_number,
            actor_id = %actor.id,
            from = %from,
            to = %state.status,
            "approval decision recorded"
        );

        Ok(TransitionOutcome {
            report_id: report_id.clone(),
            from,
            to: state.status,
            current_step: state.current_step,
            step_instance: state.step_instance,
            entries,
        })
    }

    async fn ensure_eligible(
        &self,
        step: &WorkflowStep,
        state: &ReportWorkflowState,
        actor: &Actor,
    ) -> Result<(), ApplicationError> {
        if actor.has_permission(&self.settings.override_permission) {
            return Ok(());
        }

        match self.resolver().resolve(&step.target, &state.report.submitter_id).await {
            Ok(eligible) if eligible.contains(&actor.id) => Ok(()),
            Ok(_) => Err(DomainError::NotEligible {
                actor_id: actor.id.to_string(),
                step_number: step.step_number,
            }
            .into()),
            Err(error) if error.is_unresolvable() => Err(DomainError::UnresolvableTarget {
                step_number: step.step_number,
                reason: error.to_string(),
            }
            .into()),
            Err(error) => Err(ApplicationError::Integration(error.to_string())),
        }
    }

    /// Walks forward from `start`, recording bypassed and system steps, until
    /// a step needs a human decision. Running off the end approves the report.
    async fn enter_step(
        &self,
        workflow: &WorkflowDefinition,
        state: &mut ReportWorkflowState,
        start: Option<u32>,
        now: DateTime<Utc>,
        entries: &mut Vec<ApprovalHistoryEntry>,
    ) -> Result<(), ApplicationError> {
        let context = state.report.predicate_context();
        let mut candidate = start;

        while let Some(step_number) = candidate {
            let step = workflow.step(step_number).ok_or_else(|| {
                DomainError::InvariantViolation(format!(
                    "workflow {} v{} has no step {step_number}",
                    workflow.id, workflow.version
                ))
            })?;
            state.current_step = step_number;
            state.step_instance += 1;
            state.step_started_at = now;
            state.stalled_reason = None;

            let bypass = match StepActivation::evaluate(step, &context) {
                StepActivation::Bypassed(reason) => Some(reason),
                StepActivation::Active if step.target.is_system() => {
                    Some("resolved automatically by system step")
                }
                StepActivation::Active => None,
            };
            if let Some(reason) = bypass {
                entries.push(
                    ApprovalHistoryEntry::new(
                        state.report_id.clone(),
                        step,
                        state.step_instance,
                        HistoryAction::Approve,
                        now,
                    )
                    .with_comment(Some(reason.to_owned())),
                );
                candidate = workflow.next_step_after(step_number);
                continue;
            }

            match self.resolver().resolve(&step.target, &state.report.submitter_id).await {
                Ok(_) => {}
                Err(error) if error.is_unresolvable() => {
                    warn!(
                        event_name = "workflow.step.stalled",
                        report_id = %state.report_id,
                        workflow_id = %workflow.id,
                        step_number,
                        reason = %error,
                        "step has no resolvable approver"
                    );
                    state.stalled_reason = Some(error.to_string());
                }
                Err(error) => return Err(ApplicationError::Integration(error.to_string())),
            }
            state.status = WorkflowStatus::InReview;
            return Ok(());
        }

        state.status = WorkflowStatus::Approved;
        Ok(())
    }
}

fn current_step<'a>(
    workflow: &'a WorkflowDefinition,
    state: &ReportWorkflowState,
) -> Result<&'a WorkflowStep, ApplicationError> {
    workflow.step(state.current_step).ok_or_else(|| {
        DomainError::InvariantViolation(format!(
            "report {} points at missing step {}",
            state.report_id, state.current_step
        ))
        .into()
    })
}

fn decision_event_name(action: HistoryAction, to: WorkflowStatus) -> &'static str {
    match (action, to) {
        (HistoryAction::Approve, WorkflowStatus::Approved) => "workflow.report.approved",
        (HistoryAction::Approve, _) => "workflow.step.approved",
        (HistoryAction::Reject, _) => "workflow.report.rejected",
        (HistoryAction::Return, _) => "workflow.report.returned",
        _ => "workflow.report.transition",
    }
}

fn require_comment(comment: &str, action: HistoryAction) -> Result<(), DomainError> {
    if comment.trim().is_empty() {
        return Err(DomainError::Validation(format!("a comment is required to {action}")));
    }
    Ok(())
}

fn validate_report(report: &ReportSnapshot) -> Result<(), DomainError> {
    if report.report_id.as_str().trim().is_empty() {
        return Err(DomainError::Validation("report id is required".to_owned()));
    }
    if report.submitter_id.as_str().trim().is_empty() {
        return Err(DomainError::Validation("submitter id is required".to_owned()));
    }
    if report.amount.is_sign_negative() {
        return Err(DomainError::Validation("amount must not be negative".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
