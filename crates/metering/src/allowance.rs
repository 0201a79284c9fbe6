//! Allowance calculation
//!
//! Combines the resolved entitlement, current ledger state and active add-on
//! credits into a single "can I spend N units" decision plus a structured
//! remaining-balance breakdown. Strictly read-only: callers poll it to
//! confirm availability without consuming anything, so querying must never
//! mutate ledger or reservation state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use storyforge_shared::{ResourceKind, SubscriptionTier};

use crate::entitlement::Entitlement;
use crate::error::{MeteringError, MeteringResult};
use crate::ledger::{validate_amount, OrganizationUsage};
use crate::store::{MeteringStore, SubscriptionState};

/// Remaining quantity across active metered add-on grants
pub(crate) async fn metered_addon_balance(
    store: &dyn MeteringStore,
    org_id: Uuid,
    now: OffsetDateTime,
) -> MeteringResult<i64> {
    let grants = store.active_grants(org_id, now).await?;
    Ok(grants
        .iter()
        .filter(|g| g.grant_type.is_metered())
        .map(|g| g.remaining)
        .sum())
}

/// Usage row plus the balances that share its consistency scope
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub usage: OrganizationUsage,
    /// Remaining quantity across active metered add-on grants
    pub addon_tokens: i64,
    /// Sum of unexpired held reservations (additive liabilities)
    pub outstanding_holds: i64,
}

impl UsageSnapshot {
    /// Tokens spendable right now:
    /// `max(0, limit - used) + rollover + add-ons - outstanding holds`
    pub fn available(&self) -> i64 {
        (self.usage.remaining_base_tokens()
            + self.usage.purchased_token_balance
            + self.addon_tokens
            - self.outstanding_holds)
            .max(0)
    }
}

/// Itemized remaining balance, required for user-facing upgrade prompts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowanceBreakdown {
    /// Unspent base plan entitlement
    pub base_remaining: i64,
    /// Rollover carried from the previous period
    pub rollover_balance: i64,
    /// Active add-on credits
    pub addon_balance: i64,
    /// Outstanding held reservations, subtracted from the pool
    pub reserved: i64,
}

/// Decision returned by [`AllowanceCalculator::check_allowance`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowanceDecision {
    pub allowed: bool,
    pub requested: i64,
    pub available: i64,
    pub breakdown: AllowanceBreakdown,
    /// Structured reason on denial, never a bare boolean
    pub reason: Option<String>,
    /// Suggested upgrade path on denial
    pub upgrade_hint: Option<String>,
}

/// Read-only allowance queries over the durable store
#[derive(Clone)]
pub struct AllowanceCalculator {
    store: Arc<dyn MeteringStore>,
}

impl AllowanceCalculator {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Decide whether the organization may consume `requested` units of the
    /// given resource. Tokens are gated against the full multi-source pool;
    /// seats and actions are gated against their entitlement limits.
    ///
    /// Transient store failures are retried here with a short bounded
    /// backoff; this is the only place the engine auto-retries, and only
    /// because the query is read-only.
    pub async fn check_allowance(
        &self,
        org_id: Uuid,
        resource: ResourceKind,
        requested: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<AllowanceDecision> {
        validate_amount(requested)?;

        let strategy = FixedInterval::from_millis(50).take(2);
        let store = self.store.clone();
        let (org, snapshot, fallback_addons) = RetryIf::spawn(
            strategy,
            || {
                let store = store.clone();
                async move {
                    let org = store
                        .organization(org_id)
                        .await?
                        .ok_or_else(|| MeteringError::NotFound(format!("organization {org_id}")))?;
                    let snapshot = store.usage_snapshot(org_id, now).await?;
                    // Grants are not tied to the usage row's lifecycle, so
                    // they count even before the row exists
                    let fallback_addons = if snapshot.is_none() {
                        metered_addon_balance(&*store, org_id, now).await?
                    } else {
                        0
                    };
                    Ok::<_, MeteringError>((org, snapshot, fallback_addons))
                }
            },
            MeteringError::is_retryable,
        )
        .await?;

        let entitlement = Entitlement::resolve_str(&org.subscription_tier, &org.overrides);

        if org.subscription_state == SubscriptionState::Blocked {
            return Ok(AllowanceDecision {
                allowed: false,
                requested,
                available: 0,
                breakdown: AllowanceBreakdown::default(),
                reason: Some(
                    org.block_reason
                        .unwrap_or_else(|| "organization is blocked for non-payment".to_string()),
                ),
                upgrade_hint: None,
            });
        }

        let (available, breakdown) = match resource {
            ResourceKind::Tokens => match snapshot {
                Some(snap) => {
                    let breakdown = AllowanceBreakdown {
                        base_remaining: snap.usage.remaining_base_tokens(),
                        rollover_balance: snap.usage.purchased_token_balance,
                        addon_balance: snap.addon_tokens,
                        reserved: snap.outstanding_holds,
                    };
                    (snap.available(), breakdown)
                }
                None => {
                    // No usage row yet this period: the full entitlement
                    // plus any landed grants. Creation stays with the
                    // ledger; a read must not mutate state as a side effect.
                    let limit = entitlement.tokens_limit_i64();
                    (
                        limit.saturating_add(fallback_addons),
                        AllowanceBreakdown {
                            base_remaining: limit,
                            addon_balance: fallback_addons,
                            ..Default::default()
                        },
                    )
                }
            },
            ResourceKind::Seats => {
                let limit = i64::from(entitlement.max_seats);
                let used = snapshot.as_ref().map_or(0, |s| s.usage.seats_used);
                let remaining = (limit - used).max(0);
                (
                    remaining,
                    AllowanceBreakdown {
                        base_remaining: remaining,
                        ..Default::default()
                    },
                )
            }
            ResourceKind::Actions => {
                let limit = i64::try_from(entitlement.stories_per_month).unwrap_or(i64::MAX);
                let used = snapshot.as_ref().map_or(0, |s| s.usage.actions_used);
                let remaining = (limit - used).max(0);
                (
                    remaining,
                    AllowanceBreakdown {
                        base_remaining: remaining,
                        ..Default::default()
                    },
                )
            }
        };

        let allowed = available >= requested;
        let (reason, upgrade_hint) = if allowed {
            (None, None)
        } else {
            (
                Some(format!(
                    "insufficient {resource} allowance: requested {requested}, available {available}"
                )),
                upgrade_suggestion(entitlement.tier),
            )
        };

        Ok(AllowanceDecision {
            allowed,
            requested,
            available,
            breakdown,
            reason,
            upgrade_hint,
        })
    }
}

/// Next tier worth suggesting when an allowance check is denied
fn upgrade_suggestion(tier: SubscriptionTier) -> Option<String> {
    let next = match tier {
        SubscriptionTier::Free => Some(SubscriptionTier::Starter),
        SubscriptionTier::Starter => Some(SubscriptionTier::Pro),
        SubscriptionTier::Pro => Some(SubscriptionTier::Team),
        SubscriptionTier::Team => Some(SubscriptionTier::Enterprise),
        SubscriptionTier::Enterprise => None,
    };
    next.map(|t| format!("upgrade to the {t} plan for a higher token allowance"))
}
