//! Persistence seam for workflow definitions, report state and history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::audit::ApprovalHistoryEntry;
use crate::domain::report::{ReportId, ReportWorkflowState, SelectionCriteria};
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};
use crate::errors::ApplicationError;

pub mod memory;

pub use memory::InMemoryWorkflowStore;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("storage failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
}

impl From<StoreError> for ApplicationError {
    fn from(error: StoreError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    /// Pages start at 1; page size is clamped into `1..=MAX_PAGE_SIZE`.
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

/// Keyset position in the in-review scan: the last `(step_started_at,
/// report_id)` already returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewCursor {
    pub step_started_at: DateTime<Utc>,
    pub report_id: ReportId,
}

impl ReviewCursor {
    pub fn after(state: &ReportWorkflowState) -> Self {
        Self { step_started_at: state.step_started_at, report_id: state.report_id.clone() }
    }

    /// True when `state` sorts strictly after this position.
    pub fn precedes(&self, state: &ReportWorkflowState) -> bool {
        (state.step_started_at, &state.report_id) > (self.step_started_at, &self.report_id)
    }
}

/// Result of an atomic state-plus-history write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored revision moved on, or the state already exists on insert.
    StaleRevision,
    /// A scheduler entry with the same idempotency key is already recorded.
    DuplicateEntry,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] if the workflow id is taken.
    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    /// Stores a new version next to the existing ones.
    async fn save_workflow_version(&self, workflow: &WorkflowDefinition)
        -> Result<(), StoreError>;

    async fn load_latest_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn load_workflow_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Latest versions, ordered by name then id.
    async fn list_workflows(
        &self,
        page: PageRequest,
    ) -> Result<Page<WorkflowDefinition>, StoreError>;

    /// Latest versions that are active and whose conditions accept `criteria`.
    async fn load_active_workflows_matching(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn load_report_state(
        &self,
        report_id: &ReportId,
    ) -> Result<Option<ReportWorkflowState>, StoreError>;

    /// Writes `state` and appends `entries` in one unit.
    ///
    /// With `expected_revision == None` the state must not exist yet;
    /// otherwise the stored revision must equal it. Nothing is written unless
    /// the outcome is [`CommitOutcome::Committed`].
    async fn commit_transition(
        &self,
        state: &ReportWorkflowState,
        expected_revision: Option<u64>,
        entries: &[ApprovalHistoryEntry],
    ) -> Result<CommitOutcome, StoreError>;

    /// Full history of one report in append order.
    async fn list_history(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ApprovalHistoryEntry>, StoreError>;

    /// Reports waiting on a step, ordered by `(step_started_at, report_id)`
    /// and starting strictly after `after` when given.
    async fn list_in_review_states(
        &self,
        after: Option<&ReviewCursor>,
        limit: u32,
    ) -> Result<Vec<ReportWorkflowState>, StoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{PageRequest, ReviewCursor};
    use crate::domain::report::ReportWorkflowState;
    use crate::testing::{report, two_step_workflow};

    #[test]
    fn page_request_clamps_inputs() {
        assert_eq!(PageRequest::new(None, None), PageRequest { page: 1, per_page: 20 });
        assert_eq!(PageRequest::new(Some(0), Some(0)), PageRequest { page: 1, per_page: 1 });
        assert_eq!(PageRequest::new(Some(3), Some(500)), PageRequest { page: 3, per_page: 100 });
        assert_eq!(PageRequest::new(Some(3), Some(10)).offset(), 20);
    }

    #[test]
    fn review_cursor_orders_by_start_then_report_id() {
        let started = Utc::now();
        let workflow = two_step_workflow("WF-1", started);
        let state = |id: &str, offset: i64| {
            let at = started + Duration::hours(offset);
            ReportWorkflowState::pending(report(id, 100), &workflow, at)
        };

        let cursor = ReviewCursor::after(&state("R-2", 0));
        assert!(!cursor.precedes(&state("R-1", 0)));
        assert!(!cursor.precedes(&state("R-2", 0)));
        assert!(cursor.precedes(&state("R-3", 0)));
        assert!(cursor.precedes(&state("R-0", 1)));
    }
}
