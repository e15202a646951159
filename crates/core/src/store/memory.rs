use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CommitOutcome, Page, PageRequest, ReviewCursor, StoreError, WorkflowStore};
use crate::audit::{ApprovalHistoryEntry, HistoryKey};
use crate::domain::report::{ReportId, ReportWorkflowState, SelectionCriteria, WorkflowStatus};
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    workflows: BTreeMap<WorkflowId, BTreeMap<u32, WorkflowDefinition>>,
    states: HashMap<ReportId, ReportWorkflowState>,
    history: HashMap<ReportId, Vec<ApprovalHistoryEntry>>,
    keys: HashSet<HistoryKey>,
}

impl MemoryState {
    fn latest_workflows(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values().filter_map(|versions| versions.values().next_back())
    }
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.workflows.contains_key(&workflow.id) {
            return Err(StoreError::Duplicate(format!("workflow {}", workflow.id)));
        }
        inner
            .workflows
            .entry(workflow.id.clone())
            .or_default()
            .insert(workflow.version, workflow.clone());
        Ok(())
    }

    async fn save_workflow_version(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let versions = inner.workflows.entry(workflow.id.clone()).or_default();
        if versions.contains_key(&workflow.version) {
            return Err(StoreError::Duplicate(format!(
                "workflow {} version {}",
                workflow.id, workflow.version
            )));
        }
        versions.insert(workflow.version, workflow.clone());
        Ok(())
    }

    async fn load_latest_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.get(id).and_then(|versions| versions.values().next_back()).cloned())
    }

    async fn load_workflow_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.get(id).and_then(|versions| versions.get(&version)).cloned())
    }

    async fn list_workflows(
        &self,
        page: PageRequest,
    ) -> Result<Page<WorkflowDefinition>, StoreError> {
        let inner = self.inner.read().await;
        let mut latest: Vec<&WorkflowDefinition> = inner.latest_workflows().collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let total = latest.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let items = latest
            .into_iter()
            .skip(offset)
            .take(page.per_page as usize)
            .cloned()
            .collect();

        Ok(Page { items, page: page.page, per_page: page.per_page, total })
    }

    async fn load_active_workflows_matching(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .latest_workflows()
            .filter(|workflow| workflow.is_active && workflow.matches(criteria))
            .cloned()
            .collect())
    }

    async fn load_report_state(
        &self,
        report_id: &ReportId,
    ) -> Result<Option<ReportWorkflowState>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.states.get(report_id).cloned())
    }

    async fn commit_transition(
        &self,
        state: &ReportWorkflowState,
        expected_revision: Option<u64>,
        entries: &[ApprovalHistoryEntry],
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        let stored_revision = inner.states.get(&state.report_id).map(|stored| stored.revision);
        if stored_revision != expected_revision {
            return Ok(CommitOutcome::StaleRevision);
        }

        let mut new_keys = HashSet::new();
        for key in entries.iter().filter_map(ApprovalHistoryEntry::idempotency_key) {
            if inner.keys.contains(&key) || !new_keys.insert(key) {
                return Ok(CommitOutcome::DuplicateEntry);
            }
        }

        inner.keys.extend(new_keys);
        inner.states.insert(state.report_id.clone(), state.clone());
        inner.history.entry(state.report_id.clone()).or_default().extend(entries.iter().cloned());
        Ok(CommitOutcome::Committed)
    }

    async fn list_history(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ApprovalHistoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.history.get(report_id).cloned().unwrap_or_default())
    }

    async fn list_in_review_states(
        &self,
        after: Option<&ReviewCursor>,
        limit: u32,
    ) -> Result<Vec<ReportWorkflowState>, StoreError> {
        let inner = self.inner.read().await;
        let mut waiting: Vec<&ReportWorkflowState> = inner
            .states
            .values()
            .filter(|state| state.status == WorkflowStatus::InReview)
            .filter(|state| after.map_or(true, |cursor| cursor.precedes(state)))
            .collect();
        waiting.sort_by(|a, b| {
            a.step_started_at.cmp(&b.step_started_at).then_with(|| a.report_id.cmp(&b.report_id))
        });
        Ok(waiting.into_iter().take(limit as usize).cloned().collect())
    }
}
