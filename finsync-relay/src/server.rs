//! Axum router setup.

use crate::auth::auth_middleware;
use crate::config::RelayConfig;
use crate::handlers::{init, installations, sync};
use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use axum::extract::FromRef;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub limiter: RateLimiter,
    pub max_pending_inits: usize,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: &RelayConfig) -> Self {
        Self {
            storage,
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            max_pending_inits: config.max_pending_inits,
        }
    }
}

impl FromRef<AppState> for RelayStorage {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

pub fn build_router(state: AppState, config: &RelayConfig) -> Router {
    // Authenticated routes
    let authenticated = Router::new()
        .route("/sync/push", post(sync::push))
        .route("/sync/pull", get(sync::pull))
        .route("/sync/ack", post(sync::ack))
        .route(
            "/sync/init",
            post(init::post_init)
                .get(init::get_inits)
                .delete(init::delete_inits),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Unauthenticated routes
    let public = Router::new()
        .route("/installations", post(installations::register))
        .route("/health", get(health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
