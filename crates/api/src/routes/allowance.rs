//! Allowance check and confirmation endpoints

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use storyforge_metering::{AllowanceDecision, ConfirmOptions, ConfirmOutcome};
use storyforge_shared::ResourceKind;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub org_id: Uuid,
    /// Resource being requested; token spend when omitted
    #[serde(default)]
    pub action: ResourceKind,
    /// Units the caller intends to spend
    pub requested: i64,
}

/// `POST /v1/allowance/check`
///
/// Always 200 for a well-formed request; denial is expressed in the body
/// (`allowed: false` plus reason, breakdown and upgrade hint), not as an
/// HTTP error.
pub async fn check(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<AllowanceDecision>, ApiError> {
    let decision = state
        .metering
        .allowance
        .check_allowance(req.org_id, req.action, req.requested, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub org_id: Uuid,
    /// Available balance the caller expects to become visible
    pub expected_available: i64,
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
    pub deadline: Option<OffsetDateTime>,
}

/// `POST /v1/allowance/confirm`
///
/// Bounded polling until the expected balance lands; `confirmed: false`
/// after the attempt budget is a normal 200 outcome.
pub async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmOutcome>, ApiError> {
    let defaults = ConfirmOptions::default();
    let options = ConfirmOptions {
        max_attempts: req.max_attempts.unwrap_or(defaults.max_attempts),
        delay_ms: req.delay_ms.unwrap_or(defaults.delay_ms),
        deadline: req.deadline,
    };
    let outcome = state
        .metering
        .confirmer
        .await_balance(req.org_id, req.expected_available, options)
        .await?;
    Ok(Json(outcome))
}
