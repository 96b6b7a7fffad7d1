use axum::{extract::State, routing::get, Json, Router};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::stack::StackStats;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(get_stats))
}

async fn get_stats(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<StackStats>, ApiError> {
    let stats = state
        .stacks()
        .stats()
        .await
        .map_err(|e| ApiError::from_stack(e, &ctx.request_id))?;

    Ok(Json(stats))
}
