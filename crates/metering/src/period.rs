//! Billing period management
//!
//! Period boundaries are a deterministic function of the organization's
//! billing anchor day and the evaluation instant. An anchor day that does not
//! exist in a month (e.g. the 31st in February) clamps to the month's last
//! day, in both directions: the next period still anchors to the original
//! day of the following eligible month.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, Time};
use uuid::Uuid;

use crate::entitlement::Entitlement;
use crate::error::{MeteringError, MeteringResult};
use crate::ledger::OrganizationUsage;
use crate::store::MeteringStore;

/// A half-open billing interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl BillingPeriod {
    /// Compute the period containing `now` for the given anchor day (1..=31).
    ///
    /// Anchor days outside 1..=31 are clamped into range rather than
    /// rejected; this function is on the hot path and must be total.
    pub fn containing(anchor_day: u8, now: OffsetDateTime) -> Self {
        let anchor_day = anchor_day.clamp(1, 31);
        let today = now.date();

        let this_month_anchor = clamped_date(today.year(), today.month(), anchor_day);
        let start_date = if today >= this_month_anchor {
            this_month_anchor
        } else {
            let (py, pm) = previous_month(today.year(), today.month());
            clamped_date(py, pm, anchor_day)
        };

        let (ny, nm) = next_month(start_date.year(), start_date.month());
        let end_date = clamped_date(ny, nm, anchor_day);

        Self {
            start: start_date.with_time(Time::MIDNIGHT).assume_utc(),
            end: end_date.with_time(Time::MIDNIGHT).assume_utc(),
        }
    }

    /// The period immediately following this one
    pub fn next(&self, anchor_day: u8) -> Self {
        // Evaluate just inside the successor interval
        Self::containing(anchor_day, self.end + Duration::seconds(1))
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Clamp an anchor day into the given month
fn clamped_date(year: i32, month: Month, anchor_day: u8) -> Date {
    let last = time::util::days_in_year_month(year, month);
    // day is in range by construction, but stay total on the hot path
    Date::from_calendar_date(year, month, anchor_day.min(last))
        .unwrap_or_else(|_| Date::from_calendar_date(year, month, 1).unwrap_or(Date::MIN))
}

fn next_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::December => (year + 1, Month::January),
        other => (year, other.next()),
    }
}

fn previous_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::January => (year - 1, Month::December),
        other => (year, other.previous()),
    }
}

/// How rollover is applied when a period rotates. The store computes the
/// actual carry from the row it archives, inside the rotation transaction,
/// so a concurrent increment on the elapsed row can never make it stale.
#[derive(Debug, Clone, Copy)]
pub struct RolloverPolicy {
    pub eligible: bool,
    /// Upper bound on carried tokens per rotation
    pub cap: i64,
}

impl RolloverPolicy {
    pub fn for_entitlement(entitlement: &Entitlement) -> Self {
        Self {
            eligible: entitlement.rollover_eligible,
            cap: i64::try_from(entitlement.rollover_cap_tokens).unwrap_or(i64::MAX),
        }
    }

    /// Tokens carried out of an elapsed row: the lesser of unused base
    /// allowance and the cap. Non-eligible tiers carry zero.
    pub fn carry_from(&self, archived: &OrganizationUsage) -> i64 {
        if !self.eligible {
            return 0;
        }
        let unused = (archived.tokens_limit - archived.tokens_used).max(0);
        unused.min(self.cap)
    }
}

/// Outcome of rotating one organization's period
#[derive(Debug, Clone)]
pub enum PeriodRotation {
    /// No usage row existed; one was created for the current period
    Created(OrganizationUsage),
    /// The stored period had elapsed; it was archived and replaced
    Rotated {
        archived: OrganizationUsage,
        current: OrganizationUsage,
    },
    /// The stored period is still current; nothing to do
    AlreadyCurrent(OrganizationUsage),
}

impl PeriodRotation {
    pub fn current(&self) -> &OrganizationUsage {
        match self {
            Self::Created(u) | Self::AlreadyCurrent(u) => u,
            Self::Rotated { current, .. } => current,
        }
    }
}

/// Aggregate report for a reset batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Per-organization failures; the batch itself never fails wholesale
    pub failures: Vec<ResetFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetFailure {
    pub org_id: Uuid,
    pub error: String,
}

/// Computes period boundaries, rotates elapsed periods and applies rollover
#[derive(Clone)]
pub struct BillingPeriodManager {
    store: Arc<dyn MeteringStore>,
}

impl BillingPeriodManager {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Rotate one organization to the period containing `now`.
    ///
    /// Per-organization transactional and independently retryable: the store
    /// archives the elapsed row and creates the new one in a single
    /// transaction, and skips creation if the new period's row already exists.
    pub async fn rotate_org(&self, org_id: Uuid, now: OffsetDateTime) -> MeteringResult<PeriodRotation> {
        let org = self
            .store
            .organization(org_id)
            .await?
            .ok_or_else(|| MeteringError::NotFound(format!("organization {org_id}")))?;

        let entitlement = Entitlement::resolve_str(&org.subscription_tier, &org.overrides);
        let period = BillingPeriod::containing(org.billing_anchor_day, now);
        let new_limit = entitlement.tokens_limit_i64();

        let current = self.store.current_usage(org_id).await?;
        match current {
            Some(usage) if usage.period_end > now => Ok(PeriodRotation::AlreadyCurrent(usage)),
            Some(_elapsed) => {
                // The carry is computed by the store from the row it locks
                // and archives; a read here could go stale under a
                // concurrent commit on the elapsed row.
                let rollover = RolloverPolicy::for_entitlement(&entitlement);
                let rotation = self
                    .store
                    .rotate_period(org_id, period, new_limit, rollover, now)
                    .await?;
                if let PeriodRotation::Rotated { current, .. } = &rotation {
                    tracing::info!(
                        org_id = %org_id,
                        carried_tokens = current.purchased_token_balance,
                        tokens_limit = current.tokens_limit,
                        period_start = %current.period_start,
                        "Rotated billing period"
                    );
                }
                Ok(rotation)
            }
            None => {
                // Lazy creation on first usage in a period
                let usage = self
                    .store
                    .create_usage_period(org_id, period, new_limit, 0)
                    .await?;
                Ok(PeriodRotation::Created(usage))
            }
        }
    }

    /// Scan all organizations whose stored period has elapsed and rotate each.
    ///
    /// Individual failures are collected and reported, never thrown; one bad
    /// record must not block the rest of the batch. Safe to re-invoke: the
    /// per-organization rotation is idempotent.
    pub async fn reset_expired_periods(&self, now: OffsetDateTime) -> MeteringResult<ResetReport> {
        let org_ids = self.store.organizations_with_elapsed_period(now).await?;
        let mut report = ResetReport {
            processed: org_ids.len(),
            ..Default::default()
        };

        for org_id in org_ids {
            match self.rotate_org(org_id, now).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    tracing::error!(org_id = %org_id, error = %e, "Failed to rotate billing period");
                    report.failed += 1;
                    report.failures.push(ResetFailure {
                        org_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "Billing period reset complete"
        );
        Ok(report)
    }
}
