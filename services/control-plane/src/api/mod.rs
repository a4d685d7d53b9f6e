//! HTTP routing: health checks only. Objects are read and written through
//! the store, never through this server.

mod health;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::{ComponentStatus, HealthResponse};

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
