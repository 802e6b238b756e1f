//! HTTP + WebSocket surface.
//!
//! - `http`: REST routes under `/api` behind bearer auth, plus `/health`
//! - `ws`: the `/ws` delivery socket

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::Authenticator;
use crate::delivery::{ClientRouter, EventBroadcaster};
use crate::queue::JobQueue;
use crate::reaper::OrphanReaper;
use crate::store::ChatStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn ChatStore>,
    pub router: Arc<ClientRouter>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub reaper: Arc<OrphanReaper>,
    pub auth: Arc<dyn Authenticator>,
}

/// Build the full axum router.
pub fn routes(state: AppState, cors_origin: &str) -> Router {
    let api = Router::new()
        .route("/chat", post(http::enqueue_chat))
        .route("/jobs/{id}", get(http::get_job).delete(http::cancel_job))
        .route("/queue/stats", get(http::queue_stats))
        .route("/conversations", get(http::list_conversations))
        .route("/conversations/{id}/messages", get(http::list_messages))
        .route("/messages/{id}/feedback", post(http::message_feedback))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            http::require_auth,
        ));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origin)),
        )
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match HeaderValue::from_str(origin) {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            warn!(origin, error = %e, "Invalid CORS origin, allowing any");
            layer.allow_origin(Any)
        }
    }
}
