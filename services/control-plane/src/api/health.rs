//! Health check endpoints.
//!
//! `/livez` and `/healthz` answer as long as the process serves requests.
//! `/readyz` additionally requires every informer cache to have completed
//! its first list and the replica not to be demoting. A follower with warm
//! caches is ready: it is a valid standby.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::leader::LeaderState;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// "leader", "follower" or "demoting".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leadership: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// Status: "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn new(ok: bool, message: Option<String>) -> Self {
        Self {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            message,
        }
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        identity: None,
        leadership: None,
        components: BTreeMap::new(),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(response("ok"))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let leadership = state.leader_state();
    let mut components = BTreeMap::new();

    let mut all_synced = true;
    for (kind, synced) in state.cache_sync() {
        all_synced &= synced;
        let message = (!synced).then(|| "initial list not complete".to_string());
        components.insert(format!("informer/{kind}"), ComponentStatus::new(synced, message));
    }

    let leader_ok = leadership != LeaderState::Demoting;
    components.insert(
        "leader-election".to_string(),
        ComponentStatus::new(leader_ok, (!leader_ok).then(|| "lease lost".to_string())),
    );

    let ready = all_synced && leader_ok;
    let mut body = response(if ready { "ok" } else { "degraded" });
    body.identity = Some(state.identity().to_string());
    body.leadership = Some(leadership_label(leadership).to_string());
    body.components = components;

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

fn leadership_label(state: LeaderState) -> &'static str {
    match state {
        LeaderState::Leader => "leader",
        LeaderState::Follower => "follower",
        LeaderState::Demoting => "demoting",
    }
}
