//! In-memory metering store
//!
//! Single-process backend used by tests and local development. One mutex
//! guards all state, so every trait method is naturally one indivisible
//! step, matching the transactional boundaries the Postgres backend draws.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use storyforge_shared::ResourceKind;

use crate::addons::{AddOnGrant, AddOnType};
use crate::allowance::UsageSnapshot;
use crate::error::{MeteringError, MeteringResult};
use crate::ledger::{IncrementOutcome, OrganizationUsage};
use crate::period::{BillingPeriod, PeriodRotation, RolloverPolicy};
use crate::reservation::{HoldOutcome, HoldRequest, Reservation, ReservationStatus};
use crate::store::{MeteringStore, OrganizationRecord, SubscriptionState};

#[derive(Default)]
struct State {
    orgs: HashMap<Uuid, OrganizationRecord>,
    usage: Vec<OrganizationUsage>,
    /// (org, correlation id) -> counter recorded at first application
    increments: HashMap<(Uuid, String), i64>,
    grants: Vec<AddOnGrant>,
    reservations: HashMap<Uuid, Reservation>,
}

impl State {
    fn open_usage_mut(&mut self, org_id: Uuid) -> Option<&mut OrganizationUsage> {
        self.usage
            .iter_mut()
            .filter(|u| u.org_id == org_id && u.archived_at.is_none())
            .max_by_key(|u| u.period_start)
    }

    fn open_usage(&self, org_id: Uuid) -> Option<&OrganizationUsage> {
        self.usage
            .iter()
            .filter(|u| u.org_id == org_id && u.archived_at.is_none())
            .max_by_key(|u| u.period_start)
    }

    fn addon_token_balance(&self, org_id: Uuid, now: OffsetDateTime) -> i64 {
        self.grants
            .iter()
            .filter(|g| g.org_id == org_id && g.grant_type.is_metered() && g.is_active(now))
            .map(|g| g.remaining)
            .sum()
    }

    fn outstanding_holds(&self, org_id: Uuid, now: OffsetDateTime) -> i64 {
        self.reservations
            .values()
            .filter(|r| r.org_id == org_id && r.is_outstanding(now))
            .map(|r| r.amount)
            .sum()
    }

    /// Drain `amount` tokens: base first, then carried rollover, then active
    /// add-on credits in expiry order. Spill covered by rollover or credits
    /// does not count against the base limit; only the uncovered remainder
    /// lands on `tokens_used` as overage.
    fn drain_tokens(&mut self, org_id: Uuid, amount: i64, now: OffsetDateTime) {
        let Some(usage) = self.open_usage_mut(org_id) else {
            return;
        };
        let base_take = amount.min((usage.tokens_limit - usage.tokens_used).max(0));
        let mut spill = amount - base_take;

        let from_rollover = spill.min(usage.purchased_token_balance);
        usage.purchased_token_balance -= from_rollover;
        spill -= from_rollover;
        usage.tokens_used += base_take;
        if spill == 0 {
            return;
        }

        let mut active: Vec<&mut AddOnGrant> = self
            .grants
            .iter_mut()
            .filter(|g| {
                g.org_id == org_id && g.grant_type.is_metered() && g.remaining > 0 && g.is_active(now)
            })
            .collect();
        // Oldest expiry first; never-expiring grants last
        active.sort_by_key(|g| (g.expires_at.is_none(), g.expires_at));
        for grant in active {
            if spill == 0 {
                break;
            }
            let take = spill.min(grant.remaining);
            grant.remaining -= take;
            spill -= take;
        }

        // Uncovered spill is overage, visible via tokens_used > tokens_limit
        if spill > 0 {
            if let Some(usage) = self.open_usage_mut(org_id) {
                usage.tokens_used += spill;
            }
        }
    }
}

/// In-memory [`MeteringStore`] implementation
pub struct MemoryMeteringStore {
    state: Mutex<State>,
}

impl MemoryMeteringStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed or replace an organization record (test/dev helper; production
    /// organizations are owned by the account service)
    pub async fn insert_organization(&self, org: OrganizationRecord) {
        let mut state = self.state.lock().await;
        state.orgs.insert(org.id, org);
    }

    /// Move an organization into a degraded payment state with a grace
    /// deadline (mirrors what the payment webhook handler does in production)
    pub async fn mark_past_due(&self, org_id: Uuid, grace_ends_at: OffsetDateTime) {
        let mut state = self.state.lock().await;
        if let Some(org) = state.orgs.get_mut(&org_id) {
            org.subscription_state = SubscriptionState::PastDue;
            org.grace_period_ends_at = Some(grace_ends_at);
        }
    }
}

impl Default for MemoryMeteringStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeteringStore for MemoryMeteringStore {
    async fn organization(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationRecord>> {
        let state = self.state.lock().await;
        Ok(state.orgs.get(&org_id).cloned())
    }

    async fn organizations_with_elapsed_period(
        &self,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<Uuid> = state
            .usage
            .iter()
            .filter(|u| u.archived_at.is_none() && u.period_end <= now)
            .map(|u| u.org_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn current_usage(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationUsage>> {
        let state = self.state.lock().await;
        Ok(state.open_usage(org_id).cloned())
    }

    async fn create_usage_period(
        &self,
        org_id: Uuid,
        period: BillingPeriod,
        tokens_limit: i64,
        carried_tokens: i64,
    ) -> MeteringResult<OrganizationUsage> {
        let mut state = self.state.lock().await;
        if !state.orgs.contains_key(&org_id) {
            return Err(MeteringError::NotFound(format!("organization {org_id}")));
        }
        if let Some(existing) = state
            .usage
            .iter()
            .find(|u| u.org_id == org_id && u.archived_at.is_none() && u.period_start == period.start)
        {
            return Ok(existing.clone());
        }
        let usage = OrganizationUsage {
            id: Uuid::new_v4(),
            org_id,
            period_start: period.start,
            period_end: period.end,
            tokens_limit,
            tokens_used: 0,
            actions_used: 0,
            seats_used: 0,
            purchased_token_balance: carried_tokens,
            archived_at: None,
        };
        state.usage.push(usage.clone());
        Ok(usage)
    }

    async fn rotate_period(
        &self,
        org_id: Uuid,
        new_period: BillingPeriod,
        tokens_limit: i64,
        rollover: RolloverPolicy,
        now: OffsetDateTime,
    ) -> MeteringResult<PeriodRotation> {
        let mut state = self.state.lock().await;
        if !state.orgs.contains_key(&org_id) {
            return Err(MeteringError::NotFound(format!("organization {org_id}")));
        }

        // Resumed retry: the new row already exists
        if let Some(existing) = state
            .usage
            .iter()
            .find(|u| u.org_id == org_id && u.archived_at.is_none() && u.period_start == new_period.start)
            .cloned()
        {
            return Ok(PeriodRotation::AlreadyCurrent(existing));
        }

        // With more than one elapsed row only the most recent one carries
        let mut archived: Option<OrganizationUsage> = None;
        for usage in state
            .usage
            .iter_mut()
            .filter(|u| u.org_id == org_id && u.archived_at.is_none() && u.period_end <= now)
        {
            usage.archived_at = Some(now);
            if archived
                .as_ref()
                .map_or(true, |a| usage.period_start > a.period_start)
            {
                archived = Some(usage.clone());
            }
        }

        // Carry computed from the row archived in this same scope, so it can
        // never trail a concurrent increment on the elapsed period.
        let carried_tokens = archived
            .as_ref()
            .map(|u| rollover.carry_from(u))
            .unwrap_or(0);

        let current = OrganizationUsage {
            id: Uuid::new_v4(),
            org_id,
            period_start: new_period.start,
            period_end: new_period.end,
            tokens_limit,
            tokens_used: 0,
            actions_used: 0,
            seats_used: 0,
            purchased_token_balance: carried_tokens,
            archived_at: None,
        };
        state.usage.push(current.clone());

        Ok(match archived {
            Some(archived) => PeriodRotation::Rotated { archived, current },
            None => PeriodRotation::Created(current),
        })
    }

    async fn apply_increment(
        &self,
        org_id: Uuid,
        kind: ResourceKind,
        amount: i64,
        correlation_id: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<IncrementOutcome> {
        let mut state = self.state.lock().await;
        if !state.orgs.contains_key(&org_id) {
            return Err(MeteringError::NotFound(format!("organization {org_id}")));
        }

        let key = (org_id, correlation_id.to_string());
        if let Some(&counter_after) = state.increments.get(&key) {
            return Ok(IncrementOutcome::Replayed { counter_after });
        }

        if state.open_usage(org_id).is_none() {
            return Err(MeteringError::NotFound(format!(
                "no open usage period for organization {org_id}"
            )));
        }

        match kind {
            ResourceKind::Tokens => state.drain_tokens(org_id, amount, now),
            ResourceKind::Actions => {
                if let Some(usage) = state.open_usage_mut(org_id) {
                    usage.actions_used += amount;
                }
            }
            ResourceKind::Seats => {
                if let Some(usage) = state.open_usage_mut(org_id) {
                    usage.seats_used += amount;
                }
            }
        }

        let counter_after = state
            .open_usage(org_id)
            .map(|u| u.counter(kind))
            .unwrap_or_default();
        state.increments.insert(key, counter_after);
        Ok(IncrementOutcome::Applied { counter_after })
    }

    async fn usage_snapshot(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Option<UsageSnapshot>> {
        let state = self.state.lock().await;
        let Some(usage) = state.open_usage(org_id).cloned() else {
            return Ok(None);
        };
        Ok(Some(UsageSnapshot {
            addon_tokens: state.addon_token_balance(org_id, now),
            outstanding_holds: state.outstanding_holds(org_id, now),
            usage,
        }))
    }

    async fn archived_usage(&self, org_id: Uuid) -> MeteringResult<Vec<OrganizationUsage>> {
        let state = self.state.lock().await;
        let mut rows: Vec<OrganizationUsage> = state
            .usage
            .iter()
            .filter(|u| u.org_id == org_id && u.archived_at.is_some())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        Ok(rows)
    }

    async fn insert_grant(&self, grant: &AddOnGrant) -> MeteringResult<AddOnGrant> {
        let mut state = self.state.lock().await;
        if !state.orgs.contains_key(&grant.org_id) {
            return Err(MeteringError::NotFound(format!(
                "organization {}",
                grant.org_id
            )));
        }
        state.grants.push(grant.clone());
        Ok(grant.clone())
    }

    async fn active_grants(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<AddOnGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.org_id == org_id && g.is_active(now))
            .cloned()
            .collect())
    }

    async fn consume_credits(
        &self,
        org_id: Uuid,
        grant_type: AddOnType,
        amount: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<bool> {
        let mut state = self.state.lock().await;
        let mut active: Vec<&mut AddOnGrant> = state
            .grants
            .iter_mut()
            .filter(|g| {
                g.org_id == org_id && g.grant_type == grant_type && g.remaining > 0 && g.is_active(now)
            })
            .collect();

        let total: i64 = active.iter().map(|g| g.remaining).sum();
        if total < amount {
            return Ok(false);
        }

        active.sort_by_key(|g| (g.expires_at.is_none(), g.expires_at));
        let mut left = amount;
        for grant in active {
            if left == 0 {
                break;
            }
            let take = left.min(grant.remaining);
            grant.remaining -= take;
            left -= take;
        }
        Ok(true)
    }

    async fn deactivate_expired_grants(&self, now: OffsetDateTime) -> MeteringResult<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for grant in state
            .grants
            .iter_mut()
            .filter(|g| g.active && g.expires_at.is_some_and(|exp| exp <= now))
        {
            grant.active = false;
            count += 1;
        }
        Ok(count)
    }

    async fn reservation(&self, id: Uuid) -> MeteringResult<Option<Reservation>> {
        let state = self.state.lock().await;
        Ok(state.reservations.get(&id).cloned())
    }

    async fn try_hold(
        &self,
        request: &HoldRequest,
        now: OffsetDateTime,
    ) -> MeteringResult<HoldOutcome> {
        let mut state = self.state.lock().await;
        if !state.orgs.contains_key(&request.org_id) {
            return Err(MeteringError::NotFound(format!(
                "organization {}",
                request.org_id
            )));
        }

        if let Some(existing) = state
            .reservations
            .values()
            .find(|r| {
                r.org_id == request.org_id
                    && r.correlation_id == request.correlation_id
                    && r.is_outstanding(now)
            })
            .cloned()
        {
            return Ok(HoldOutcome::Existing(existing));
        }

        let Some(usage) = state.open_usage(request.org_id).cloned() else {
            return Err(MeteringError::NotFound(format!(
                "no open usage period for organization {}",
                request.org_id
            )));
        };
        let available = (usage.remaining_base_tokens()
            + usage.purchased_token_balance
            + state.addon_token_balance(request.org_id, now)
            - state.outstanding_holds(request.org_id, now))
        .max(0);

        if request.amount > available {
            return Ok(HoldOutcome::Denied { available });
        }

        let ttl = time::Duration::try_from(request.ttl)
            .map_err(|e| MeteringError::InvalidArgument(format!("ttl out of range: {e}")))?;
        let reservation = Reservation {
            id: Uuid::new_v4(),
            org_id: request.org_id,
            correlation_id: request.correlation_id.clone(),
            amount: request.amount,
            resource_type: request.resource_type,
            resource_id: request.resource_id.clone(),
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + ttl,
        };
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(HoldOutcome::Held(reservation))
    }

    async fn commit_reservation(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Reservation> {
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| MeteringError::NotFound(format!("reservation {id}")))?;

        match reservation.status {
            ReservationStatus::Held if reservation.expires_at <= now => {
                // Logically expired; the sweep will mark it. No ledger effect.
                Err(MeteringError::Expired(format!(
                    "reservation {id} expired at {}; the held amount is no longer available",
                    reservation.expires_at
                )))
            }
            ReservationStatus::Held => {
                let key = (reservation.org_id, reservation.correlation_id.clone());
                if !state.increments.contains_key(&key) {
                    match reservation.resource_type {
                        ResourceKind::Tokens => {
                            state.drain_tokens(reservation.org_id, reservation.amount, now)
                        }
                        ResourceKind::Actions => {
                            if let Some(usage) = state.open_usage_mut(reservation.org_id) {
                                usage.actions_used += reservation.amount;
                            }
                        }
                        ResourceKind::Seats => {
                            if let Some(usage) = state.open_usage_mut(reservation.org_id) {
                                usage.seats_used += reservation.amount;
                            }
                        }
                    }
                    let counter_after = state
                        .open_usage(reservation.org_id)
                        .map(|u| u.counter(reservation.resource_type))
                        .unwrap_or_default();
                    state.increments.insert(key, counter_after);
                }
                let committed = Reservation {
                    status: ReservationStatus::Committed,
                    ..reservation
                };
                state.reservations.insert(id, committed.clone());
                Ok(committed)
            }
            status => Err(MeteringError::Conflict(format!(
                "reservation {id} is already {status}"
            ))),
        }
    }

    async fn release_reservation(
        &self,
        id: Uuid,
        _now: OffsetDateTime,
    ) -> MeteringResult<Reservation> {
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get_mut(&id)
            .ok_or_else(|| MeteringError::NotFound(format!("reservation {id}")))?;
        if reservation.status == ReservationStatus::Held {
            reservation.status = ReservationStatus::Released;
        }
        Ok(reservation.clone())
    }

    async fn expire_reservations(&self, now: OffsetDateTime) -> MeteringResult<Vec<Reservation>> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for reservation in state.reservations.values_mut() {
            if reservation.status == ReservationStatus::Held && reservation.expires_at <= now {
                reservation.status = ReservationStatus::Expired;
                expired.push(reservation.clone());
            }
        }
        Ok(expired)
    }

    async fn held_reservations(&self) -> MeteringResult<Vec<Reservation>> {
        let state = self.state.lock().await;
        Ok(state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Held)
            .cloned()
            .collect())
    }

    async fn organizations_in_degraded_state(&self) -> MeteringResult<Vec<OrganizationRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .orgs
            .values()
            .filter(|o| o.subscription_state == SubscriptionState::PastDue && o.blocked_at.is_none())
            .cloned()
            .collect())
    }

    async fn block_organization(
        &self,
        org_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<bool> {
        let mut state = self.state.lock().await;
        let org = state
            .orgs
            .get_mut(&org_id)
            .ok_or_else(|| MeteringError::NotFound(format!("organization {org_id}")))?;
        if org.blocked_at.is_some() {
            return Ok(false);
        }
        org.subscription_state = SubscriptionState::Blocked;
        org.blocked_at = Some(now);
        org.block_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn negative_counter_orgs(&self) -> MeteringResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<Uuid> = state
            .usage
            .iter()
            .filter(|u| {
                u.archived_at.is_none()
                    && (u.tokens_used < 0
                        || u.actions_used < 0
                        || u.seats_used < 0
                        || u.purchased_token_balance < 0)
            })
            .map(|u| u.org_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
