//! HTTP routes

mod allowance;
mod jobs;


use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/allowance/check", post(allowance::check))
        .route("/v1/allowance/confirm", post(allowance::confirm))
        .route("/v1/jobs/billing-reset", post(jobs::billing_reset))
        .route("/v1/jobs/health-sweep", post(jobs::health_sweep))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}
