//! Secret-gated job trigger endpoints
//!
//! Alternate adapters for the worker's scheduled jobs, used by operators and
//! external schedulers. Both are idempotent, so a retried trigger after a
//! partial failure is safe.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use storyforge_metering::{
    GraceSweepReport, HealthCheckSummary, ResetReport, SweepReport,
};

use crate::error::ApiError;
use crate::state::AppState;

const JOB_SECRET_HEADER: &str = "x-job-secret";

/// Constant-time secret check; timing must not leak prefix matches
fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let provided = headers
        .get(JOB_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing job secret" })),
        )
            .into_response())
    }
}

/// `POST /v1/jobs/billing-reset`
pub async fn billing_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetReport>, Response> {
    authorize(&headers, &state.config.job_trigger_secret)?;
    tracing::info!("Billing period reset triggered via API");
    let report = state
        .metering
        .periods
        .reset_expired_periods(OffsetDateTime::now_utc())
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct HealthSweepReport {
    pub reservations: SweepReport,
    pub deactivated_grants: u64,
    pub grace: GraceSweepReport,
    pub checks: HealthCheckSummary,
}

/// `POST /v1/jobs/health-sweep`
///
/// Runs the reservation expiry sweep, add-on expiry pass, grace enforcement
/// and the consistency checks in one shot.
pub async fn health_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HealthSweepReport>, Response> {
    authorize(&headers, &state.config.job_trigger_secret)?;
    tracing::info!("Health sweep triggered via API");
    let now = OffsetDateTime::now_utc();
    let metering = &state.metering;

    let into_response = |e| ApiError(e).into_response();
    let reservations = metering
        .reservations
        .sweep_expired(now)
        .await
        .map_err(into_response)?;
    let deactivated_grants = metering
        .addons
        .deactivate_expired(now)
        .await
        .map_err(into_response)?;
    let grace = metering
        .monitor
        .run_grace_sweep(now)
        .await
        .map_err(into_response)?;
    let checks = metering
        .monitor
        .run_all_checks(now)
        .await
        .map_err(into_response)?;

    Ok(Json(HealthSweepReport {
        reservations,
        deactivated_grants,
        grace,
        checks,
    }))
}
