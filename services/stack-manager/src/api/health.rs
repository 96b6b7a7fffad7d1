//! Probe endpoints for the orchestrator running stackd itself.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Unavailable,
    /// Degraded but still serving reads and deletes.
    Exhausted,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Check {
    fn ok() -> Self {
        Self {
            status: CheckStatus::Ok,
            message: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub service: &'static str,
    pub version: &'static str,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<&'static str, Check>,
}

impl ProbeReport {
    fn new() -> Self {
        Self {
            service: "stackd",
            version: env!("CARGO_PKG_VERSION"),
            checked_at: Utc::now(),
            components: BTreeMap::new(),
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz() -> Json<ProbeReport> {
    Json(ProbeReport::new())
}

/// 503 while the stack store is unreachable. Port exhaustion is reported
/// but does not fail readiness.
async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ProbeReport>) {
    let mut report = ProbeReport::new();

    let store = match state.stacks().health_check().await {
        Ok(()) => Check::ok(),
        Err(e) => Check {
            status: CheckStatus::Unavailable,
            message: Some(e.to_string()),
        },
    };
    let ready = store.status == CheckStatus::Ok;
    report.components.insert("store", store);

    let usage = state.stacks().ports().usage();
    let ports = if usage.available() == 0 {
        Check {
            status: CheckStatus::Exhausted,
            message: Some(format!("all {} node ports allocated", usage.capacity)),
        }
    } else {
        Check::ok()
    };
    report.components.insert("node_ports", ports);

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}
