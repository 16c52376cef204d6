//! Router construction and shared state for the control plane (C11).
//!
//! Grounded on `sem_os_server::router::build_router` for the
//! protected/public route split and the `tower_http::trace::TraceLayer`
//! request-span convention SPEC_FULL.md §C calls out.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;

use super::auth;
use super::error::ControlPlaneError;
use super::handlers;
use super::commands::CommandHandlers;

/// The closed set of control-plane config knobs, each with the
/// documented default.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub token: String,
    pub host: String,
    pub port: u16,
    pub replay_last_default: usize,
    pub replay_last_max: usize,
    pub expose_raw_opencode_events: bool,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            host: "127.0.0.1".to_string(),
            port: 4317,
            replay_last_default: 50,
            replay_last_max: 1000,
            expose_raw_opencode_events: false,
        }
    }
}

/// Supplies the opaque, scheduler-assembled status snapshot served at
/// `GET /v1/state`. The core redacts it on the way out but never interprets
/// its shape.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Value;
}

/// Shared axum state: the bus, config, and the two scheduler-provided seams.
#[derive(Clone)]
pub struct ControlPlaneState {
    pub bus: Arc<EventBus>,
    pub config: Arc<ControlPlaneConfig>,
    pub snapshot: Arc<dyn SnapshotProvider>,
    pub commands: Arc<dyn CommandHandlers>,
}

/// `Authorization: Bearer <t>` gate for every route except `/v1/events`.
async fn require_bearer(State(state): State<ControlPlaneState>, req: Request, next: Next) -> Response {
    match auth::bearer_from_header(req.headers()) {
        Some(token) if auth::tokens_match(&state.config.token, &token) => next.run(req).await,
        _ => ControlPlaneError::Unauthorized.into_response(),
    }
}

/// Build the full router: `/v1/events` (self-authenticating upgrade) plus
/// the bearer-gated REST surface.
pub fn build_router(state: ControlPlaneState) -> Router {
    let protected = Router::new()
        .route("/v1/state", get(handlers::get_state))
        .route("/healthz", get(handlers::healthz))
        .route("/v1/commands/pause", post(handlers::pause))
        .route("/v1/commands/resume", post(handlers::resume))
        .route("/v1/commands/message/enqueue", post(handlers::message_enqueue))
        .route("/v1/commands/message/interrupt", post(handlers::message_interrupt))
        .route("/v1/commands/task/priority", post(handlers::task_priority))
        .route("/v1/commands/task/status", post(handlers::task_status))
        .route("/v1/commands/issue/priority", post(handlers::issue_priority))
        .route("/v1/commands/issue/cmd", post(handlers::issue_cmd))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/v1/events", get(handlers::get_events))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
