//! Usage ledger
//!
//! Durable per-organization, per-billing-period counters with atomic,
//! correlation-id-idempotent increments. The ledger is the sole writer of
//! usage counters; the atomic "record correlation if absent, then increment"
//! step lives behind the store seam so both backends apply it as one
//! indivisible operation rather than a read-then-write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use storyforge_shared::ResourceKind;

use crate::error::{MeteringError, MeteringResult};
use crate::period::BillingPeriodManager;
use crate::store::MeteringStore;

/// Longest accepted correlation id; anything longer is rejected up front
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// One row per (organization, billing period)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrganizationUsage {
    pub id: Uuid,
    pub org_id: Uuid,
    /// Half-open interval: `period_start <= t < period_end`
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    /// Entitlement token limit captured at period start
    pub tokens_limit: i64,
    /// Monotonically non-decreasing within the period
    pub tokens_used: i64,
    pub actions_used: i64,
    pub seats_used: i64,
    /// Rollover carried from the previous period, not yet consumed
    pub purchased_token_balance: i64,
    /// Set when the period is closed and superseded; archived rows are
    /// append-only history and never mutated again
    pub archived_at: Option<OffsetDateTime>,
}

impl OrganizationUsage {
    /// Base allowance still unspent (never negative)
    pub fn remaining_base_tokens(&self) -> i64 {
        (self.tokens_limit - self.tokens_used).max(0)
    }

    /// Tokens consumed beyond the limit; derived, never stored negative
    pub fn overage_tokens(&self) -> i64 {
        (self.tokens_used - self.tokens_limit).max(0)
    }

    pub fn counter(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Tokens => self.tokens_used,
            ResourceKind::Actions => self.actions_used,
            ResourceKind::Seats => self.seats_used,
        }
    }
}

/// Outcome of an increment as recorded by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The increment was applied now
    Applied { counter_after: i64 },
    /// An increment with this correlation id was already applied; the
    /// previously recorded result is returned unchanged
    Replayed { counter_after: i64 },
}

/// Result returned to callers of [`UsageLedger::increment`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResult {
    pub org_id: Uuid,
    pub kind: ResourceKind,
    pub amount: i64,
    /// Counter value for `kind` after this logical increment
    pub counter_after: i64,
    /// True when this call was deduplicated against an earlier application
    pub replayed: bool,
}

/// Durable usage counters with exactly-once increment semantics
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn MeteringStore>,
    periods: BillingPeriodManager,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        let periods = BillingPeriodManager::new(store.clone());
        Self { store, periods }
    }

    /// Return the current period's usage row, creating it lazily on first
    /// use. Elapsed periods are handed to the Billing Period Manager for
    /// rotation rather than silently reset here.
    pub async fn get_or_create(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<OrganizationUsage> {
        let rotation = self.periods.rotate_org(org_id, now).await?;
        Ok(rotation.current().clone())
    }

    /// Atomically add `amount` to the organization's counter for `kind`,
    /// unless an increment with the same correlation id was already applied,
    /// in which case the previously recorded result is replayed.
    pub async fn increment(
        &self,
        org_id: Uuid,
        kind: ResourceKind,
        amount: i64,
        correlation_id: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<UsageResult> {
        validate_amount(amount)?;
        validate_correlation_id(correlation_id)?;

        // Make sure the current period's row exists; fails with NotFound for
        // unknown organizations.
        self.get_or_create(org_id, now).await?;

        let outcome = self
            .store
            .apply_increment(org_id, kind, amount, correlation_id, now)
            .await?;

        let (counter_after, replayed) = match outcome {
            IncrementOutcome::Applied { counter_after } => (counter_after, false),
            IncrementOutcome::Replayed { counter_after } => (counter_after, true),
        };

        if replayed {
            tracing::debug!(
                org_id = %org_id,
                correlation_id = %correlation_id,
                "Replayed idempotent increment"
            );
        } else {
            tracing::debug!(
                org_id = %org_id,
                kind = %kind,
                amount = amount,
                counter_after = counter_after,
                "Applied usage increment"
            );
        }

        Ok(UsageResult {
            org_id,
            kind,
            amount,
            counter_after,
            replayed,
        })
    }

    /// Closed periods for this organization, newest first
    pub async fn archived_periods(&self, org_id: Uuid) -> MeteringResult<Vec<OrganizationUsage>> {
        self.store.archived_usage(org_id).await
    }
}

pub(crate) fn validate_amount(amount: i64) -> MeteringResult<()> {
    if amount <= 0 {
        return Err(MeteringError::InvalidArgument(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_correlation_id(correlation_id: &str) -> MeteringResult<()> {
    if correlation_id.is_empty() {
        return Err(MeteringError::InvalidArgument(
            "correlation id must not be empty".to_string(),
        ));
    }
    if correlation_id.len() > MAX_CORRELATION_ID_LEN {
        return Err(MeteringError::InvalidArgument(format!(
            "correlation id exceeds {MAX_CORRELATION_ID_LEN} bytes"
        )));
    }
    Ok(())
}
