//! Balance confirmation polling
//!
//! After a purchase or grant lands asynchronously, callers poll until the
//! expected balance becomes visible. Polling is strictly bounded: a fixed
//! number of attempts with a fixed delay, plus an optional wall-clock
//! deadline that aborts early.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::allowance::metered_addon_balance;
use crate::entitlement::Entitlement;
use crate::error::{MeteringError, MeteringResult};
use crate::store::MeteringStore;

/// Attempt cap when the caller does not supply one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Delay between attempts when the caller does not supply one
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(200);
/// Hard ceiling regardless of what the caller asks for
pub const MAX_POLL_ATTEMPTS: u32 = 60;

/// Polling bounds for one confirmation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmOptions {
    pub max_attempts: u32,
    pub delay_ms: u64,
    /// Optional wall-clock cutoff; polling stops early once passed
    pub deadline: Option<OffsetDateTime>,
}

impl Default for ConfirmOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: DEFAULT_POLL_DELAY.as_millis() as u64,
            deadline: None,
        }
    }
}

/// Result of a confirmation poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub confirmed: bool,
    /// Available balance observed on the final attempt
    pub observed_available: i64,
    pub attempts: u32,
}

/// Polls the usage snapshot until an expected balance becomes visible
pub struct BalanceConfirmer {
    store: Arc<dyn MeteringStore>,
}

impl BalanceConfirmer {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Poll until the organization's available balance reaches
    /// `expected_available`.
    ///
    /// Never errors on a balance that simply has not landed yet; the outcome
    /// reports `confirmed: false` with the last observed balance so callers
    /// can decide whether to keep waiting. Store errors propagate.
    pub async fn await_balance(
        &self,
        org_id: Uuid,
        expected_available: i64,
        options: ConfirmOptions,
    ) -> MeteringResult<ConfirmOutcome> {
        if expected_available < 0 {
            return Err(MeteringError::InvalidArgument(
                "expected balance must be non-negative".to_string(),
            ));
        }
        if options.max_attempts == 0 {
            return Err(MeteringError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let max_attempts = options.max_attempts.min(MAX_POLL_ATTEMPTS);
        let delay = Duration::from_millis(options.delay_ms);

        // Usage rows are created lazily on first spend, so a fresh
        // organization legitimately has none; its balance is the full
        // entitlement plus any landed grants, not zero.
        let org = self
            .store
            .organization(org_id)
            .await?
            .ok_or_else(|| MeteringError::NotFound(format!("organization {org_id}")))?;
        let entitlement = Entitlement::resolve_str(&org.subscription_tier, &org.overrides);

        let mut observed = 0i64;
        for attempt in 1..=max_attempts {
            let now = OffsetDateTime::now_utc();
            if let Some(deadline) = options.deadline {
                if now >= deadline {
                    tracing::debug!(
                        org_id = %org_id,
                        attempts = attempt - 1,
                        "Confirmation poll aborted at deadline"
                    );
                    return Ok(ConfirmOutcome {
                        confirmed: false,
                        observed_available: observed,
                        attempts: attempt - 1,
                    });
                }
            }

            observed = match self.store.usage_snapshot(org_id, now).await? {
                Some(snapshot) => snapshot.available(),
                None => {
                    let addons = metered_addon_balance(&*self.store, org_id, now).await?;
                    entitlement.tokens_limit_i64().saturating_add(addons)
                }
            };
            if observed >= expected_available {
                tracing::debug!(
                    org_id = %org_id,
                    observed_available = observed,
                    attempts = attempt,
                    "Balance confirmed"
                );
                return Ok(ConfirmOutcome {
                    confirmed: true,
                    observed_available: observed,
                    attempts: attempt,
                });
            }

            if attempt < max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::debug!(
            org_id = %org_id,
            expected_available,
            observed_available = observed,
            attempts = max_attempts,
            "Balance not confirmed within attempt budget"
        );
        Ok(ConfirmOutcome {
            confirmed: false,
            observed_available: observed,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_bounded() {
        let opts = ConfirmOptions::default();
        assert!(opts.max_attempts > 0);
        assert!(opts.max_attempts <= MAX_POLL_ATTEMPTS);
        assert!(opts.deadline.is_none());
    }
}
