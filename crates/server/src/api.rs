//! Workflow and expense-report routes.
//!
//! - `POST /workflows`                                   create a definition (version 1)
//! - `GET  /workflows`                                   latest versions, paginated
//! - `GET  /workflows/{id}`                              latest version
//! - `PUT  /workflows/{id}`                              write the next version
//! - `POST /expense-reports/{report_id}/submit`          bind and enter the first step
//! - `POST /expense-reports/{report_id}/approve`
//! - `POST /expense-reports/{report_id}/reject`
//! - `POST /expense-reports/{report_id}/return`
//! - `GET  /expense-reports/{report_id}/workflow-status`

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use expensa_core::audit::ApprovalHistoryEntry;
use expensa_core::domain::actor::ActorId;
use expensa_core::domain::report::{ReportId, ReportSnapshot, WorkflowStatus};
use expensa_core::domain::workflow::{
    WorkflowDefinition, WorkflowDraft, WorkflowId, WorkflowPatch,
};
use expensa_core::engine::{TransitionOutcome, WorkflowEngine, WorkflowStatusView};
use expensa_core::errors::{ApplicationError, DomainError, InterfaceError};
use expensa_core::store::{Page, PageRequest};

use crate::identity::Identity;

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<WorkflowEngine>,
    min_comment_length: usize,
}

impl ApiState {
    pub fn new(engine: Arc<WorkflowEngine>, min_comment_length: usize) -> Self {
        Self { engine, min_comment_length }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow).put(update_workflow))
        .route("/expense-reports/{report_id}/submit", post(submit_report))
        .route("/expense-reports/{report_id}/approve", post(approve_report))
        .route("/expense-reports/{report_id}/reject", post(reject_report))
        .route("/expense-reports/{report_id}/return", post(return_report))
        .route("/expense-reports/{report_id}/workflow-status", get(workflow_status))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated { correlation_id: String },
    Interface(InterfaceError),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub user_message: &'static str,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self::Interface(error.into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::Interface(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthenticated { correlation_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "unauthenticated",
                    message: "missing x-actor-id header".to_string(),
                    user_message: "Sign in before acting on expense reports.",
                    correlation_id,
                },
            ),
            Self::Interface(error) => {
                let status = StatusCode::from_u16(error.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    warn!(
                        event_name = "system.api.request_failed",
                        correlation_id = error.correlation_id(),
                        status = status.as_u16(),
                        error = %error,
                        "request failed"
                    );
                }
                (
                    status,
                    ErrorBody {
                        code: error.code(),
                        message: error.message().to_string(),
                        user_message: error.user_message(),
                        correlation_id: error.correlation_id().to_string(),
                    },
                )
            }
        };
        (status, Json(ErrorEnvelope { error: body })).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkflowsQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub amount: Decimal,
    pub category: String,
    pub department: String,
    #[serde(default)]
    pub submitter_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub comment: String,
    #[serde(default)]
    pub rejection_category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequest {
    pub comment: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    pub report_id: ReportId,
    pub from: WorkflowStatus,
    pub status: WorkflowStatus,
    pub current_step: u32,
    pub step_instance: u32,
    pub entries: Vec<ApprovalHistoryEntry>,
}

impl From<TransitionOutcome> for TransitionResponse {
    fn from(outcome: TransitionOutcome) -> Self {
        Self {
            report_id: outcome.report_id,
            from: outcome.from,
            status: outcome.to,
            current_step: outcome.current_step,
            step_instance: outcome.step_instance,
            entries: outcome.entries,
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn create_workflow(
    State(state): State<ApiState>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    let draft: WorkflowDraft = parse_body(&body, &identity.correlation_id)?;
    let workflow = state
        .engine
        .create_workflow(draft)
        .await
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))?;

    info!(
        event_name = "system.api.workflow_created",
        correlation_id = %identity.correlation_id,
        actor_id = %identity.actor.id,
        workflow_id = %workflow.id,
        "workflow created via api"
    );
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn update_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<Json<WorkflowDefinition>> {
    let patch: WorkflowPatch = parse_body(&body, &identity.correlation_id)?;
    state
        .engine
        .update_workflow(&WorkflowId::new(id), patch)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn list_workflows(
    State(state): State<ApiState>,
    Query(query): Query<ListWorkflowsQuery>,
    identity: Identity,
) -> ApiResult<Json<Page<WorkflowDefinition>>> {
    state
        .engine
        .list_workflows(PageRequest::new(query.page, query.per_page))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn get_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    identity: Identity,
) -> ApiResult<Json<WorkflowDefinition>> {
    state
        .engine
        .get_workflow(&WorkflowId::new(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn submit_report(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let request: SubmitRequest = parse_body(&body, &identity.correlation_id)?;
    let submitter_id = request
        .submitter_id
        .filter(|value| !value.trim().is_empty())
        .map(ActorId::new)
        .unwrap_or_else(|| identity.actor.id.clone());

    let snapshot = ReportSnapshot {
        report_id: ReportId::new(report_id),
        submitter_id,
        amount: request.amount,
        category: request.category,
        department: request.department,
        attributes: request.attributes,
    };

    state
        .engine
        .submit(snapshot)
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn approve_report(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let request: ApproveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ApproveRequest::default()
    } else {
        parse_body(&body, &identity.correlation_id)?
    };

    state
        .engine
        .approve(&ReportId::new(report_id), &identity.actor, request.comment)
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn reject_report(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let request: RejectRequest = parse_body(&body, &identity.correlation_id)?;
    check_comment(&request.comment, state.min_comment_length, &identity.correlation_id)?;

    state
        .engine
        .reject(
            &ReportId::new(report_id),
            &identity.actor,
            request.comment,
            request.rejection_category,
        )
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn return_report(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
    identity: Identity,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let request: ReturnRequest = parse_body(&body, &identity.correlation_id)?;
    check_comment(&request.comment, state.min_comment_length, &identity.correlation_id)?;

    state
        .engine
        .return_report(&ReportId::new(report_id), &identity.actor, request.comment)
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

async fn workflow_status(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
    identity: Identity,
) -> ApiResult<Json<WorkflowStatusView>> {
    state
        .engine
        .status(&ReportId::new(report_id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &identity.correlation_id))
}

fn parse_body<T: DeserializeOwned>(body: &[u8], correlation_id: &str) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|error| {
        ApiError::bad_request(format!("invalid request body: {error}"), correlation_id)
    })
}

fn check_comment(comment: &str, min_length: usize, correlation_id: &str) -> ApiResult<()> {
    if comment.trim().chars().count() < min_length {
        return Err(ApiError::from_application(
            DomainError::Validation(format!("comment must be at least {min_length} characters"))
                .into(),
            correlation_id,
        ));
    }
    Ok(())
}
