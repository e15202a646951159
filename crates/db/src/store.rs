//! SQLite implementation of the workflow store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use expensa_core::audit::{ApprovalHistoryEntry, HistoryAction, HistoryEntryId};
use expensa_core::domain::actor::ActorId;
use expensa_core::domain::report::{
    ReportId, ReportSnapshot, ReportWorkflowState, SelectionCriteria, WorkflowStatus,
};
use expensa_core::domain::workflow::{
    ReturnPolicy, WorkflowConditions, WorkflowDefinition, WorkflowId, WorkflowStep,
};
use expensa_core::store::{
    CommitOutcome, Page, PageRequest, ReviewCursor, StoreError, WorkflowStore,
};

use crate::DbPool;

const WORKFLOW_COLUMNS: &str = "workflow_id, version, name, is_active, conditions_json,
    steps_json, on_return_policy, created_at, updated_at";

const STATE_COLUMNS: &str = "report_id, workflow_id, workflow_version, current_step, status,
    step_instance, step_started_at, stalled_reason, report_json, revision, submitted_at,
    updated_at";

const HISTORY_COLUMNS: &str = "id, report_id, step_number, step_name, step_instance, actor_id,
    actor_email, action, comment, rejection_category, notify_mark, created_at, sla_deadline,
    was_escalated";

pub struct SqlWorkflowStore {
    pool: DbPool,
}

impl SqlWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_version(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        let conditions_json = workflow
            .conditions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| StoreError::Backend(format!("encode conditions: {error}")))?;
        let steps_json = serde_json::to_string(&workflow.steps)
            .map_err(|error| StoreError::Backend(format!("encode steps: {error}")))?;

        sqlx::query(
            "INSERT INTO workflow_definition_version (
                workflow_id,
                version,
                name,
                is_active,
                conditions_json,
                steps_json,
                on_return_policy,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.id.as_str())
        .bind(i64::from(workflow.version))
        .bind(&workflow.name)
        .bind(workflow.is_active)
        .bind(conditions_json)
        .bind(steps_json)
        .bind(workflow.on_return_policy.as_str())
        .bind(timestamp(&workflow.created_at))
        .bind(timestamp(&workflow.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                StoreError::Duplicate(format!("workflow {} version {}", workflow.id, workflow.version))
            } else {
                backend(error)
            }
        })?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for SqlWorkflowStore {
    async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        let existing = sqlx::query(
            "SELECT COUNT(*) AS count FROM workflow_definition_version WHERE workflow_id = ?",
        )
        .bind(workflow.id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?
        .try_get::<i64, _>("count")
        .map_err(backend)?;

        if existing > 0 {
            return Err(StoreError::Duplicate(format!("workflow {}", workflow.id)));
        }
        self.insert_version(workflow).await
    }

    async fn save_workflow_version(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        self.insert_version(workflow).await
    }

    async fn load_latest_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflow_definition_version
             WHERE workflow_id = ?
             ORDER BY version DESC
             LIMIT 1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(workflow_from_row).transpose()
    }

    async fn load_workflow_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflow_definition_version
             WHERE workflow_id = ? AND version = ?"
        ))
        .bind(id.as_str())
        .bind(i64::from(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(workflow_from_row).transpose()
    }

    async fn list_workflows(
        &self,
        page: PageRequest,
    ) -> Result<Page<WorkflowDefinition>, StoreError> {
        let total = sqlx::query(
            "SELECT COUNT(DISTINCT workflow_id) AS count FROM workflow_definition_version",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?
        .try_get::<i64, _>("count")
        .map_err(backend)?;

        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflow_definition_version AS w
             WHERE w.version = (
                SELECT MAX(v.version) FROM workflow_definition_version AS v
                WHERE v.workflow_id = w.workflow_id
             )
             ORDER BY w.name ASC, w.workflow_id ASC
             LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(page.per_page))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let items = rows.into_iter().map(workflow_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn load_active_workflows_matching(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflow_definition_version AS w
             WHERE w.version = (
                SELECT MAX(v.version) FROM workflow_definition_version AS v
                WHERE v.workflow_id = w.workflow_id
             )
               AND w.is_active = 1
             ORDER BY w.workflow_id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut matching = Vec::new();
        for row in rows {
            let workflow = workflow_from_row(row)?;
            if workflow.matches(criteria) {
                matching.push(workflow);
            }
        }
        Ok(matching)
    }

    async fn load_report_state(
        &self,
        report_id: &ReportId,
    ) -> Result<Option<ReportWorkflowState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM report_workflow_state WHERE report_id = ?"
        ))
        .bind(report_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(state_from_row).transpose()
    }

    async fn commit_transition(
        &self,
        state: &ReportWorkflowState,
        expected_revision: Option<u64>,
        entries: &[ApprovalHistoryEntry],
    ) -> Result<CommitOutcome, StoreError> {
        let report_json = serde_json::to_string(&state.report)
            .map_err(|error| StoreError::Backend(format!("encode report snapshot: {error}")))?;
        let revision = to_i64("revision", state.revision)?;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let written = match expected_revision {
            None => sqlx::query(
                "INSERT INTO report_workflow_state (
                    report_id,
                    workflow_id,
                    workflow_version,
                    current_step,
                    status,
                    step_instance,
                    step_started_at,
                    stalled_reason,
                    report_json,
                    revision,
                    submitted_at,
                    updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(report_id) DO NOTHING",
            )
            .bind(state.report_id.as_str())
            .bind(state.workflow_id.as_str())
            .bind(i64::from(state.workflow_version))
            .bind(i64::from(state.current_step))
            .bind(state.status.as_str())
            .bind(i64::from(state.step_instance))
            .bind(timestamp(&state.step_started_at))
            .bind(state.stalled_reason.as_deref())
            .bind(&report_json)
            .bind(revision)
            .bind(timestamp(&state.submitted_at))
            .bind(timestamp(&state.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(backend)?,
            Some(expected) => sqlx::query(
                "UPDATE report_workflow_state SET
                    workflow_id = ?,
                    workflow_version = ?,
                    current_step = ?,
                    status = ?,
                    step_instance = ?,
                    step_started_at = ?,
                    stalled_reason = ?,
                    report_json = ?,
                    revision = ?,
                    updated_at = ?
                 WHERE report_id = ? AND revision = ?",
            )
            .bind(state.workflow_id.as_str())
            .bind(i64::from(state.workflow_version))
            .bind(i64::from(state.current_step))
            .bind(state.status.as_str())
            .bind(i64::from(state.step_instance))
            .bind(timestamp(&state.step_started_at))
            .bind(state.stalled_reason.as_deref())
            .bind(&report_json)
            .bind(revision)
            .bind(timestamp(&state.updated_at))
            .bind(state.report_id.as_str())
            .bind(to_i64("expected_revision", expected)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?,
        };

        if written.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(CommitOutcome::StaleRevision);
        }

        for entry in entries {
            let appended = sqlx::query(&format!(
                "INSERT INTO approval_history ({HISTORY_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING"
            ))
            .bind(&entry.id.0)
            .bind(entry.report_id.as_str())
            .bind(i64::from(entry.step_number))
            .bind(&entry.step_name)
            .bind(i64::from(entry.step_instance))
            .bind(entry.actor_id.as_ref().map(ActorId::as_str))
            .bind(entry.actor_email.as_deref())
            .bind(entry.action.as_str())
            .bind(entry.comment.as_deref())
            .bind(entry.rejection_category.as_deref())
            .bind(entry.notify_mark.map(i64::from))
            .bind(timestamp(&entry.created_at))
            .bind(entry.sla_deadline.as_ref().map(timestamp))
            .bind(entry.was_escalated)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            if appended.rows_affected() == 0 {
                tx.rollback().await.map_err(backend)?;
                return Ok(CommitOutcome::DuplicateEntry);
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(CommitOutcome::Committed)
    }

    async fn list_history(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ApprovalHistoryEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS}
             FROM approval_history
             WHERE report_id = ?
             ORDER BY sequence ASC"
        ))
        .bind(report_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(history_from_row).collect()
    }

    async fn list_in_review_states(
        &self,
        after: Option<&ReviewCursor>,
        limit: u32,
    ) -> Result<Vec<ReportWorkflowState>, StoreError> {
        let rows = match after {
            None => {
                sqlx::query(&format!(
                    "SELECT {STATE_COLUMNS}
                     FROM report_workflow_state
                     WHERE status = 'in_review'
                     ORDER BY step_started_at ASC, report_id ASC
                     LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
            Some(cursor) => {
                sqlx::query(&format!(
                    "SELECT {STATE_COLUMNS}
                     FROM report_workflow_state
                     WHERE status = 'in_review'
                       AND (step_started_at, report_id) > (?, ?)
                     ORDER BY step_started_at ASC, report_id ASC
                     LIMIT ?"
                ))
                .bind(timestamp(&cursor.step_started_at))
                .bind(cursor.report_id.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend)?;

        rows.into_iter().map(state_from_row).collect()
    }
}

fn workflow_from_row(row: SqliteRow) -> Result<WorkflowDefinition, StoreError> {
    let policy_raw = row.try_get::<String, _>("on_return_policy").map_err(backend)?;
    let on_return_policy = ReturnPolicy::parse(&policy_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown return policy `{policy_raw}`")))?;

    let conditions = row
        .try_get::<Option<String>, _>("conditions_json")
        .map_err(backend)?
        .map(|raw| decode_json::<WorkflowConditions>("conditions_json", &raw))
        .transpose()?;
    let steps_raw = row.try_get::<String, _>("steps_json").map_err(backend)?;
    let steps = decode_json::<Vec<WorkflowStep>>("steps_json", &steps_raw)?;

    Ok(WorkflowDefinition {
        id: WorkflowId::new(row.try_get::<String, _>("workflow_id").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        version: parse_u32("version", row.try_get("version").map_err(backend)?)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        conditions,
        steps,
        on_return_policy,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(backend)?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at").map_err(backend)?)?,
    })
}

fn state_from_row(row: SqliteRow) -> Result<ReportWorkflowState, StoreError> {
    let status_raw = row.try_get::<String, _>("status").map_err(backend)?;
    let status = WorkflowStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown workflow status `{status_raw}`")))?;
    let report_raw = row.try_get::<String, _>("report_json").map_err(backend)?;
    let revision = row.try_get::<i64, _>("revision").map_err(backend)?;

    Ok(ReportWorkflowState {
        report_id: ReportId::new(row.try_get::<String, _>("report_id").map_err(backend)?),
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id").map_err(backend)?),
        workflow_version: parse_u32(
            "workflow_version",
            row.try_get("workflow_version").map_err(backend)?,
        )?,
        current_step: parse_u32("current_step", row.try_get("current_step").map_err(backend)?)?,
        status,
        step_instance: parse_u32("step_instance", row.try_get("step_instance").map_err(backend)?)?,
        step_started_at: parse_timestamp(
            "step_started_at",
            row.try_get("step_started_at").map_err(backend)?,
        )?,
        stalled_reason: row.try_get("stalled_reason").map_err(backend)?,
        report: decode_json::<ReportSnapshot>("report_json", &report_raw)?,
        revision: u64::try_from(revision).map_err(|_| {
            StoreError::Decode(format!("invalid value for `revision`: {revision}"))
        })?,
        submitted_at: parse_timestamp(
            "submitted_at",
            row.try_get("submitted_at").map_err(backend)?,
        )?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at").map_err(backend)?)?,
    })
}

fn history_from_row(row: SqliteRow) -> Result<ApprovalHistoryEntry, StoreError> {
    let action_raw = row.try_get::<String, _>("action").map_err(backend)?;
    let action = HistoryAction::parse(&action_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown history action `{action_raw}`")))?;

    Ok(ApprovalHistoryEntry {
        id: HistoryEntryId(row.try_get("id").map_err(backend)?),
        report_id: ReportId::new(row.try_get::<String, _>("report_id").map_err(backend)?),
        step_number: parse_u32("step_number", row.try_get("step_number").map_err(backend)?)?,
        step_name: row.try_get("step_name").map_err(backend)?,
        step_instance: parse_u32("step_instance", row.try_get("step_instance").map_err(backend)?)?,
        actor_id: row.try_get::<Option<String>, _>("actor_id").map_err(backend)?.map(ActorId::new),
        actor_email: row.try_get("actor_email").map_err(backend)?,
        action,
        comment: row.try_get("comment").map_err(backend)?,
        rejection_category: row.try_get("rejection_category").map_err(backend)?,
        notify_mark: row
            .try_get::<Option<i64>, _>("notify_mark")
            .map_err(backend)?
            .map(|mark| parse_u32("notify_mark", mark))
            .transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(backend)?)?,
        sla_deadline: row
            .try_get::<Option<String>, _>("sla_deadline")
            .map_err(backend)?
            .map(|value| parse_timestamp("sla_deadline", value))
            .transpose()?,
        was_escalated: row.try_get("was_escalated").map_err(backend)?,
    })
}

pub(crate) fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(database) if database.is_unique_violation())
}

/// Fixed-width UTC so text order matches time order.
pub(crate) fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value).map(|parsed| parsed.with_timezone(&Utc)).map_err(
        |error| StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}

fn parse_u32(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| {
        StoreError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn to_i64(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("`{column}` out of range for storage: {value}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw)
        .map_err(|error| StoreError::Decode(format!("invalid json in `{column}`: {error}")))
}
