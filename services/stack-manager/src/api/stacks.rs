//! Stack API endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use stackd_id::StackId;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::gateway::WorkloadStatus;
use crate::stack::{CreateStackInput, Stack};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stacks", get(list_stacks).post(create_stack))
        .route("/stacks/{stack_id}", get(get_stack).delete(delete_stack))
        .route("/stacks/{stack_id}/status", get(get_stack_status))
        .route("/users/{user_id}/stacks", get(list_user_stacks))
}

/// Request to create a stack.
#[derive(Debug, Deserialize)]
pub struct CreateStackRequest {
    pub user_id: i64,
    pub problem_id: i64,
    /// Pod manifest as YAML or JSON text.
    pub pod_spec: String,
    pub target_port: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteStackResponse {
    pub deleted: bool,
    pub stack_id: StackId,
}

#[derive(Debug, Serialize)]
pub struct ListStacksResponse {
    pub stacks: Vec<Stack>,
}

#[derive(Debug, Serialize)]
pub struct ListUserStacksResponse {
    pub user_id: i64,
    pub stacks: Vec<Stack>,
}

#[derive(Debug, Serialize)]
pub struct StackStatusResponse {
    pub stack: Stack,
    pub workload: WorkloadStatus,
}

/// Unparseable ids cannot name a stack, so they are reported as not found.
fn parse_stack_id(raw: &str, request_id: &str) -> Result<StackId, ApiError> {
    StackId::parse(raw).map_err(|_| {
        ApiError::not_found("stack_not_found", "stack not found").with_request_id(request_id)
    })
}

async fn create_stack(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<CreateStackRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;

    let stack = state
        .stacks()
        .create(CreateStackInput {
            user_id: req.user_id,
            problem_id: req.problem_id,
            pod_spec: req.pod_spec,
            target_port: req.target_port,
        })
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok((StatusCode::CREATED, Json(stack)).into_response())
}

async fn list_stacks(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListStacksResponse>, ApiError> {
    let stacks = state
        .stacks()
        .list_all()
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(ListStacksResponse { stacks }))
}

async fn get_stack(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(stack_id): Path<String>,
) -> Result<Json<Stack>, ApiError> {
    let stack_id = parse_stack_id(&stack_id, &ctx.request_id)?;
    let stack = state
        .stacks()
        .get(stack_id)
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(stack))
}

async fn get_stack_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(stack_id): Path<String>,
) -> Result<Json<StackStatusResponse>, ApiError> {
    let stack_id = parse_stack_id(&stack_id, &ctx.request_id)?;
    let detail = state
        .stacks()
        .get_status_detail(stack_id)
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(StackStatusResponse {
        stack: detail.stack,
        workload: detail.workload,
    }))
}

async fn delete_stack(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(stack_id): Path<String>,
) -> Result<Json<DeleteStackResponse>, ApiError> {
    let stack_id = parse_stack_id(&stack_id, &ctx.request_id)?;
    let stack = state
        .stacks()
        .delete(stack_id)
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(DeleteStackResponse {
        deleted: true,
        stack_id: stack.id,
    }))
}

async fn list_user_stacks(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
) -> Result<Json<ListUserStacksResponse>, ApiError> {
    let user_id: i64 = user_id.parse().map_err(|_| {
        ApiError::bad_request("invalid_user_id", "user_id must be a positive integer")
            .with_request_id(ctx.request_id.clone())
    })?;

    let stacks = state
        .stacks()
        .list_by_user(user_id)
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(ListUserStacksResponse { user_id, stacks }))
}
