//! Durable store seam
//!
//! All cross-request coordination happens through this trait rather than
//! in-memory locks, because multiple process instances run concurrently.
//! Every atomic conditional update the engine relies on (idempotent
//! increment, hold admission, commit-with-increment, period rotation) is a
//! single trait method so each backend can make it one indivisible step:
//! a row-locked transaction in Postgres, one mutex scope in memory.

mod memory;
mod postgres;

pub use memory::MemoryMeteringStore;
pub use postgres::PostgresMeteringStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use storyforge_shared::ResourceKind;

use crate::addons::{AddOnGrant, AddOnType};
use crate::allowance::UsageSnapshot;
use crate::entitlement::EntitlementOverrides;
use crate::error::MeteringResult;
use crate::ledger::{IncrementOutcome, OrganizationUsage};
use crate::period::{BillingPeriod, PeriodRotation, RolloverPolicy};
use crate::reservation::{HoldOutcome, HoldRequest, Reservation};

/// Payment standing of an organization's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    /// Payment degraded; access continues until the grace deadline
    PastDue,
    /// Grace period exhausted; privileged actions are refused
    Blocked,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Organization fields the engine reads (billing-relevant subset)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub id: Uuid,
    pub name: String,
    /// Stored tier string; resolved fail-closed by the Entitlement Resolver
    pub subscription_tier: String,
    /// Day-of-month the billing period anchors to (1..=31)
    pub billing_anchor_day: u8,
    pub subscription_state: SubscriptionState,
    /// Deadline of the grace window while `past_due`
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub blocked_at: Option<OffsetDateTime>,
    pub block_reason: Option<String>,
    /// Admin-set custom limits overriding tier defaults
    pub overrides: EntitlementOverrides,
}

/// Durable storage operations the metering engine is built on
#[async_trait]
pub trait MeteringStore: Send + Sync {
    // --- organizations ---

    async fn organization(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationRecord>>;

    /// Organizations whose open usage row has `period_end <= now`
    async fn organizations_with_elapsed_period(
        &self,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<Uuid>>;

    // --- usage ledger ---

    /// The latest open (non-archived) usage row, if any. May describe an
    /// elapsed period; rotation decisions belong to the Billing Period
    /// Manager, not the store.
    async fn current_usage(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationUsage>>;

    /// Create the usage row for a period. Idempotent: an existing open row
    /// with the same `period_start` is returned unchanged.
    async fn create_usage_period(
        &self,
        org_id: Uuid,
        period: BillingPeriod,
        tokens_limit: i64,
        carried_tokens: i64,
    ) -> MeteringResult<OrganizationUsage>;

    /// Archive elapsed rows and create the new period's row in a single
    /// transaction, computing the rollover carry from the archived row
    /// inside that transaction. Idempotent: if the new period's row already
    /// exists the call reports the current state instead of re-applying
    /// anything.
    async fn rotate_period(
        &self,
        org_id: Uuid,
        new_period: BillingPeriod,
        tokens_limit: i64,
        rollover: RolloverPolicy,
        now: OffsetDateTime,
    ) -> MeteringResult<PeriodRotation>;

    /// Record-correlation-if-absent, then increment, as one indivisible
    /// step. The token path drains base allowance first, then the carried
    /// rollover balance, then active add-on credits in expiry order.
    async fn apply_increment(
        &self,
        org_id: Uuid,
        kind: ResourceKind,
        amount: i64,
        correlation_id: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<IncrementOutcome>;

    /// Usage row, active add-on token balance and outstanding holds read in
    /// one consistency scope (read-committed is sufficient)
    async fn usage_snapshot(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Option<UsageSnapshot>>;

    /// Closed periods, newest first (append-only history)
    async fn archived_usage(&self, org_id: Uuid) -> MeteringResult<Vec<OrganizationUsage>>;

    // --- add-on grants ---

    async fn insert_grant(&self, grant: &AddOnGrant) -> MeteringResult<AddOnGrant>;

    /// Grants active at `now` (activated, unexpired, not deactivated)
    async fn active_grants(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<AddOnGrant>>;

    /// Atomically consume credits of a type across its active grants in
    /// expiry order. Returns false (consuming nothing) when the active
    /// balance cannot cover the amount.
    async fn consume_credits(
        &self,
        org_id: Uuid,
        grant_type: AddOnType,
        amount: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<bool>;

    /// Mark grants past expiry inactive; never deletes
    async fn deactivate_expired_grants(&self, now: OffsetDateTime) -> MeteringResult<u64>;

    // --- reservations ---

    async fn reservation(&self, id: Uuid) -> MeteringResult<Option<Reservation>>;

    /// Admission check and insert in one consistency scope with the ledger
    /// counters and other outstanding holds
    async fn try_hold(
        &self,
        request: &HoldRequest,
        now: OffsetDateTime,
    ) -> MeteringResult<HoldOutcome>;

    /// `held -> committed` plus the ledger increment, all-or-nothing.
    /// Lapsed holds fail with `Expired` (left for the sweep to mark);
    /// terminal reservations fail with `Conflict`.
    async fn commit_reservation(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Reservation>;

    /// `held -> released`; idempotent no-op on terminal states
    async fn release_reservation(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Reservation>;

    /// Transition every hold past TTL to `expired`, returning those swept.
    /// Conditional on current state, so concurrent sweeps are safe.
    async fn expire_reservations(&self, now: OffsetDateTime) -> MeteringResult<Vec<Reservation>>;

    /// All reservations currently in `held`, regardless of TTL
    async fn held_reservations(&self) -> MeteringResult<Vec<Reservation>>;

    // --- grace / health ---

    /// Organizations in `past_due` that have not been blocked yet
    async fn organizations_in_degraded_state(&self) -> MeteringResult<Vec<OrganizationRecord>>;

    /// Block a degraded organization; returns false if already blocked
    async fn block_organization(
        &self,
        org_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<bool>;

    /// Open usage rows with any negative counter (invariant violation)
    async fn negative_counter_orgs(&self) -> MeteringResult<Vec<Uuid>>;
}
