//! Postgres metering store
//!
//! Every multi-step mutation runs inside one transaction with the current
//! usage row locked `FOR UPDATE`, which serializes writers per organization.
//! Locking is scoped to a single organization's rows; no operation ever
//! blocks on another tenant's data.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use storyforge_shared::ResourceKind;

use crate::addons::{AddOnGrant, AddOnType};
use crate::allowance::UsageSnapshot;
use crate::entitlement::EntitlementOverrides;
use crate::error::{MeteringError, MeteringResult};
use crate::ledger::{IncrementOutcome, OrganizationUsage};
use crate::period::{BillingPeriod, PeriodRotation, RolloverPolicy};
use crate::reservation::{HoldOutcome, HoldRequest, Reservation, ReservationStatus};
use crate::store::{MeteringStore, OrganizationRecord, SubscriptionState};

const USAGE_COLUMNS: &str = "id, org_id, period_start, period_end, tokens_limit, tokens_used, \
     actions_used, seats_used, purchased_token_balance, archived_at";

const RESERVATION_COLUMNS: &str = "id, org_id, correlation_id, amount, resource_type, \
     resource_id, status, created_at, expires_at";

const GRANT_COLUMNS: &str =
    "id, org_id, grant_type, quantity, remaining, activated_at, expires_at, active";

/// Postgres-backed [`MeteringStore`]
pub struct PostgresMeteringStore {
    pool: PgPool,
}

impl PostgresMeteringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn org_exists(tx: &mut Transaction<'_, Postgres>, org_id: Uuid) -> MeteringResult<()> {
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&mut **tx)
            .await?;
        if exists.is_none() {
            return Err(MeteringError::NotFound(format!("organization {org_id}")));
        }
        Ok(())
    }

    /// Latest open usage row, locked for the rest of the transaction
    async fn open_usage_for_update(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
    ) -> MeteringResult<Option<OrganizationUsage>> {
        let row: Option<OrganizationUsage> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM organization_usage
             WHERE org_id = $1 AND archived_at IS NULL
             ORDER BY period_start DESC
             LIMIT 1
             FOR UPDATE"
        ))
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn outstanding_holds(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT
             FROM reservations
             WHERE org_id = $1 AND status = 'held' AND expires_at > $2",
        )
        .bind(org_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
        Ok(sum)
    }

    async fn addon_token_balance(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(remaining), 0)::BIGINT
             FROM addon_grants
             WHERE org_id = $1
               AND active
               AND activated_at <= $2
               AND (expires_at IS NULL OR expires_at > $2)
               AND grant_type IN ('token_pack', 'recurring_booster')",
        )
        .bind(org_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
        Ok(sum)
    }

    /// Record-correlation-if-absent, then increment. Callers must already
    /// hold the usage row lock (via [`Self::open_usage_for_update`]), which
    /// makes the journal check-and-insert race-free per organization.
    async fn apply_increment_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        usage: &OrganizationUsage,
        kind: ResourceKind,
        amount: i64,
        correlation_id: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<IncrementOutcome> {
        let prior: Option<(i64,)> = sqlx::query_as(
            "SELECT counter_after FROM usage_increments
             WHERE org_id = $1 AND correlation_id = $2",
        )
        .bind(usage.org_id)
        .bind(correlation_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some((counter_after,)) = prior {
            return Ok(IncrementOutcome::Replayed { counter_after });
        }

        let counter_after = match kind {
            ResourceKind::Tokens => {
                let counted = Self::drain_tokens_in_tx(tx, usage, amount, now).await?;
                usage.tokens_used + counted
            }
            ResourceKind::Actions => {
                sqlx::query("UPDATE organization_usage SET actions_used = actions_used + $2 WHERE id = $1")
                    .bind(usage.id)
                    .bind(amount)
                    .execute(&mut **tx)
                    .await?;
                usage.actions_used + amount
            }
            ResourceKind::Seats => {
                sqlx::query("UPDATE organization_usage SET seats_used = seats_used + $2 WHERE id = $1")
                    .bind(usage.id)
                    .bind(amount)
                    .execute(&mut **tx)
                    .await?;
                usage.seats_used + amount
            }
        };

        sqlx::query(
            "INSERT INTO usage_increments (org_id, correlation_id, resource_kind, amount, counter_after)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(usage.org_id)
        .bind(correlation_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(counter_after)
        .execute(&mut **tx)
        .await?;

        Ok(IncrementOutcome::Applied { counter_after })
    }

    /// Token spend drains base allowance first, then the carried rollover
    /// balance, then active add-on credits in expiry order. Spill covered by
    /// rollover or credits does not count against the base limit; only the
    /// uncovered remainder lands on `tokens_used` as overage. Returns the
    /// amount added to `tokens_used`.
    async fn drain_tokens_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        usage: &OrganizationUsage,
        amount: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<i64> {
        let base_take = amount.min(usage.remaining_base_tokens());
        let mut spill = amount - base_take;
        let from_rollover = spill.min(usage.purchased_token_balance);
        spill -= from_rollover;

        if spill > 0 {
            let grants: Vec<(Uuid, i64)> = sqlx::query_as(
                "SELECT id, remaining FROM addon_grants
                 WHERE org_id = $1
                   AND active
                   AND remaining > 0
                   AND activated_at <= $2
                   AND (expires_at IS NULL OR expires_at > $2)
                   AND grant_type IN ('token_pack', 'recurring_booster')
                 ORDER BY expires_at ASC NULLS LAST
                 FOR UPDATE",
            )
            .bind(usage.org_id)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?;

            for (grant_id, remaining) in grants {
                if spill == 0 {
                    break;
                }
                let take = spill.min(remaining);
                sqlx::query("UPDATE addon_grants SET remaining = remaining - $2 WHERE id = $1")
                    .bind(grant_id)
                    .bind(take)
                    .execute(&mut **tx)
                    .await?;
                spill -= take;
            }
        }

        // Uncovered spill is overage, visible as tokens_used > tokens_limit
        let counted = base_take + spill;
        sqlx::query(
            "UPDATE organization_usage
             SET tokens_used = tokens_used + $2,
                 purchased_token_balance = purchased_token_balance - $3
             WHERE id = $1",
        )
        .bind(usage.id)
        .bind(counted)
        .bind(from_rollover)
        .execute(&mut **tx)
        .await?;

        Ok(counted)
    }
}

#[async_trait]
impl MeteringStore for PostgresMeteringStore {
    async fn organization(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationRecord>> {
        let row: Option<OrganizationRecord> = sqlx::query_as(
            "SELECT id, name, subscription_tier, billing_anchor_day, subscription_state,
                    grace_period_ends_at, blocked_at, block_reason,
                    custom_max_seats, custom_max_projects,
                    custom_stories_per_month, custom_ai_tokens_per_month
             FROM organizations WHERE id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn organizations_with_elapsed_period(
        &self,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT org_id FROM organization_usage
             WHERE archived_at IS NULL AND period_end <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn current_usage(&self, org_id: Uuid) -> MeteringResult<Option<OrganizationUsage>> {
        let row: Option<OrganizationUsage> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM organization_usage
             WHERE org_id = $1 AND archived_at IS NULL
             ORDER BY period_start DESC
             LIMIT 1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_usage_period(
        &self,
        org_id: Uuid,
        period: BillingPeriod,
        tokens_limit: i64,
        carried_tokens: i64,
    ) -> MeteringResult<OrganizationUsage> {
        let mut tx = self.pool.begin().await?;
        Self::org_exists(&mut tx, org_id).await?;

        sqlx::query(
            "INSERT INTO organization_usage
                 (id, org_id, period_start, period_end, tokens_limit, purchased_token_balance)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (org_id, period_start) WHERE archived_at IS NULL DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(period.start)
        .bind(period.end)
        .bind(tokens_limit)
        .bind(carried_tokens)
        .execute(&mut *tx)
        .await?;

        let usage: OrganizationUsage = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM organization_usage
             WHERE org_id = $1 AND period_start = $2 AND archived_at IS NULL"
        ))
        .bind(org_id)
        .bind(period.start)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        Self::org_exists(&mut tx, org_id).await?;

        // Resumed retry: the new period's row already exists
        let existing: Option<OrganizationUsage> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM organization_usage
             WHERE org_id = $1 AND period_start = $2 AND archived_at IS NULL"
        ))
        .bind(org_id)
        .bind(new_period.start)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(current) = existing {
            tx.commit().await?;
            return Ok(PeriodRotation::AlreadyCurrent(current));
        }

        let archived: Vec<OrganizationUsage> = sqlx::query_as(&format!(
            "UPDATE organization_usage
             SET archived_at = $2
             WHERE org_id = $1 AND archived_at IS NULL AND period_end <= $2
             RETURNING {USAGE_COLUMNS}"
        ))
        .bind(org_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        // Carry computed from the row archived in this same transaction, so
        // it can never trail a concurrent increment on the elapsed period.
        // With more than one elapsed row only the most recent one carries.
        let latest_archived = archived
            .into_iter()
            .max_by_key(|u| u.period_start);
        let carried_tokens = latest_archived
            .as_ref()
            .map(|u| rollover.carry_from(u))
            .unwrap_or(0);

        let current: OrganizationUsage = sqlx::query_as(&format!(
            "INSERT INTO organization_usage
                 (id, org_id, period_start, period_end, tokens_limit, purchased_token_balance)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {USAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(new_period.start)
        .bind(new_period.end)
        .bind(tokens_limit)
        .bind(carried_tokens)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match latest_archived {
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
        let mut tx = self.pool.begin().await?;
        Self::org_exists(&mut tx, org_id).await?;

        let usage = Self::open_usage_for_update(&mut tx, org_id)
            .await?
            .ok_or_else(|| {
                MeteringError::NotFound(format!("no open usage period for organization {org_id}"))
            })?;

        let outcome =
            Self::apply_increment_in_tx(&mut tx, &usage, kind, amount, correlation_id, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn usage_snapshot(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Option<UsageSnapshot>> {
        // One transaction so counters, grants and holds share a consistency
        // scope; read-committed is sufficient for advisory checks.
        let mut tx = self.pool.begin().await?;

        let usage: Option<OrganizationUsage> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM organization_usage
             WHERE org_id = $1 AND archived_at IS NULL
             ORDER BY period_start DESC
             LIMIT 1"
        ))
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(usage) = usage else {
            tx.commit().await?;
            return Ok(None);
        };

        let addon_tokens = Self::addon_token_balance(&mut tx, org_id, now).await?;
        let outstanding_holds = Self::outstanding_holds(&mut tx, org_id, now).await?;
        tx.commit().await?;

        Ok(Some(UsageSnapshot {
            usage,
            addon_tokens,
            outstanding_holds,
        }))
    }

    async fn archived_usage(&self, org_id: Uuid) -> MeteringResult<Vec<OrganizationUsage>> {
        let rows: Vec<OrganizationUsage> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM organization_usage
             WHERE org_id = $1 AND archived_at IS NOT NULL
             ORDER BY period_start DESC"
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_grant(&self, grant: &AddOnGrant) -> MeteringResult<AddOnGrant> {
        let row: AddOnGrant = sqlx::query_as(&format!(
            "INSERT INTO addon_grants
                 (id, org_id, grant_type, quantity, remaining, activated_at, expires_at, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {GRANT_COLUMNS}"
        ))
        .bind(grant.id)
        .bind(grant.org_id)
        .bind(grant.grant_type.as_str())
        .bind(grant.quantity)
        .bind(grant.remaining)
        .bind(grant.activated_at)
        .bind(grant.expires_at)
        .bind(grant.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_grants(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Vec<AddOnGrant>> {
        let rows: Vec<AddOnGrant> = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS}
             FROM addon_grants
             WHERE org_id = $1
               AND active
               AND activated_at <= $2
               AND (expires_at IS NULL OR expires_at > $2)
             ORDER BY expires_at ASC NULLS LAST"
        ))
        .bind(org_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn consume_credits(
        &self,
        org_id: Uuid,
        grant_type: AddOnType,
        amount: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<bool> {
        let mut tx = self.pool.begin().await?;

        let grants: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT id, remaining FROM addon_grants
             WHERE org_id = $1
               AND grant_type = $2
               AND active
               AND remaining > 0
               AND activated_at <= $3
               AND (expires_at IS NULL OR expires_at > $3)
             ORDER BY expires_at ASC NULLS LAST
             FOR UPDATE",
        )
        .bind(org_id)
        .bind(grant_type.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let total: i64 = grants.iter().map(|(_, r)| r).sum();
        if total < amount {
            tx.rollback().await?;
            return Ok(false);
        }

        let mut left = amount;
        for (grant_id, remaining) in grants {
            if left == 0 {
                break;
            }
            let take = left.min(remaining);
            sqlx::query("UPDATE addon_grants SET remaining = remaining - $2 WHERE id = $1")
                .bind(grant_id)
                .bind(take)
                .execute(&mut *tx)
                .await?;
            left -= take;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn deactivate_expired_grants(&self, now: OffsetDateTime) -> MeteringResult<u64> {
        let result = sqlx::query(
            "UPDATE addon_grants SET active = FALSE
             WHERE active AND expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reservation(&self, id: Uuid) -> MeteringResult<Option<Reservation>> {
        let row: Option<Reservation> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn try_hold(
        &self,
        request: &HoldRequest,
        now: OffsetDateTime,
    ) -> MeteringResult<HoldOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::org_exists(&mut tx, request.org_id).await?;

        // Lock the usage row so concurrent admissions for the same
        // organization serialize against the same pool arithmetic.
        let usage = Self::open_usage_for_update(&mut tx, request.org_id)
            .await?
            .ok_or_else(|| {
                MeteringError::NotFound(format!(
                    "no open usage period for organization {}",
                    request.org_id
                ))
            })?;

        let existing: Option<Reservation> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations
             WHERE org_id = $1 AND correlation_id = $2 AND status = 'held' AND expires_at > $3
             LIMIT 1"
        ))
        .bind(request.org_id)
        .bind(&request.correlation_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(reservation) = existing {
            tx.commit().await?;
            return Ok(HoldOutcome::Existing(reservation));
        }

        let addon_tokens = Self::addon_token_balance(&mut tx, request.org_id, now).await?;
        let outstanding = Self::outstanding_holds(&mut tx, request.org_id, now).await?;
        let available = (usage.remaining_base_tokens() + usage.purchased_token_balance
            + addon_tokens
            - outstanding)
            .max(0);

        if request.amount > available {
            tx.rollback().await?;
            return Ok(HoldOutcome::Denied { available });
        }

        let expires_at = now
            + time::Duration::try_from(request.ttl)
                .map_err(|e| MeteringError::InvalidArgument(format!("ttl out of range: {e}")))?;
        let reservation: Reservation = sqlx::query_as(&format!(
            "INSERT INTO reservations
                 (id, org_id, correlation_id, amount, resource_type, resource_id,
                  status, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'held', $7, $8)
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(request.org_id)
        .bind(&request.correlation_id)
        .bind(request.amount)
        .bind(request.resource_type.as_str())
        .bind(&request.resource_id)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(HoldOutcome::Held(reservation))
    }

    async fn commit_reservation(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<Reservation> {
        let mut tx = self.pool.begin().await?;

        let reservation: Reservation = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MeteringError::NotFound(format!("reservation {id}")))?;

        match reservation.status {
            ReservationStatus::Held if reservation.expires_at <= now => {
                // Logically expired; leave the physical transition to the
                // sweep. Rolling back keeps the row untouched.
                tx.rollback().await?;
                Err(MeteringError::Expired(format!(
                    "reservation {id} expired at {}; the held amount is no longer available",
                    reservation.expires_at
                )))
            }
            ReservationStatus::Held => {
                let usage = Self::open_usage_for_update(&mut tx, reservation.org_id)
                    .await?
                    .ok_or_else(|| {
                        MeteringError::NotFound(format!(
                            "no open usage period for organization {}",
                            reservation.org_id
                        ))
                    })?;

                // Reservation transition and ledger increment share this
                // transaction; they cannot diverge.
                sqlx::query("UPDATE reservations SET status = 'committed' WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                Self::apply_increment_in_tx(
                    &mut tx,
                    &usage,
                    reservation.resource_type,
                    reservation.amount,
                    &reservation.correlation_id,
                    now,
                )
                .await?;

                tx.commit().await?;
                Ok(Reservation {
                    status: ReservationStatus::Committed,
                    ..reservation
                })
            }
            status => {
                tx.rollback().await?;
                Err(MeteringError::Conflict(format!(
                    "reservation {id} is already {status}"
                )))
            }
        }
    }

    async fn release_reservation(
        &self,
        id: Uuid,
        _now: OffsetDateTime,
    ) -> MeteringResult<Reservation> {
        let released: Option<Reservation> = sqlx::query_as(&format!(
            "UPDATE reservations SET status = 'released'
             WHERE id = $1 AND status = 'held'
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(reservation) = released {
            return Ok(reservation);
        }

        // Already terminal: idempotent no-op
        self.reservation(id)
            .await?
            .ok_or_else(|| MeteringError::NotFound(format!("reservation {id}")))
    }

    async fn expire_reservations(&self, now: OffsetDateTime) -> MeteringResult<Vec<Reservation>> {
        // Conditional on current state, so concurrent sweeps each expire a
        // given hold at most once.
        let rows: Vec<Reservation> = sqlx::query_as(&format!(
            "UPDATE reservations SET status = 'expired'
             WHERE status = 'held' AND expires_at <= $1
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn held_reservations(&self) -> MeteringResult<Vec<Reservation>> {
        let rows: Vec<Reservation> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE status = 'held'"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn organizations_in_degraded_state(&self) -> MeteringResult<Vec<OrganizationRecord>> {
        let rows: Vec<OrganizationRecord> = sqlx::query_as(
            "SELECT id, name, subscription_tier, billing_anchor_day, subscription_state,
                    grace_period_ends_at, blocked_at, block_reason,
                    custom_max_seats, custom_max_projects,
                    custom_stories_per_month, custom_ai_tokens_per_month
             FROM organizations
             WHERE subscription_state = 'past_due' AND blocked_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn block_organization(
        &self,
        org_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> MeteringResult<bool> {
        let result = sqlx::query(
            "UPDATE organizations
             SET subscription_state = 'blocked', blocked_at = $2, block_reason = $3
             WHERE id = $1 AND blocked_at IS NULL",
        )
        .bind(org_id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn negative_counter_orgs(&self) -> MeteringResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT org_id FROM organization_usage
             WHERE archived_at IS NULL
               AND (tokens_used < 0 OR actions_used < 0 OR seats_used < 0
                    OR purchased_token_balance < 0)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for OrganizationRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let state_str: String = row.try_get("subscription_state")?;
        let subscription_state =
            SubscriptionState::from_str(&state_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "subscription_state".into(),
                source: format!("unknown subscription state: {state_str}").into(),
            })?;
        let anchor: i16 = row.try_get("billing_anchor_day")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            subscription_tier: row.try_get("subscription_tier")?,
            billing_anchor_day: u8::try_from(anchor).unwrap_or(1),
            subscription_state,
            grace_period_ends_at: row.try_get("grace_period_ends_at")?,
            blocked_at: row.try_get("blocked_at")?,
            block_reason: row.try_get("block_reason")?,
            overrides: EntitlementOverrides {
                max_seats: row
                    .try_get::<Option<i32>, _>("custom_max_seats")?
                    .map(|v| v.max(0) as u32),
                max_projects: row
                    .try_get::<Option<i32>, _>("custom_max_projects")?
                    .map(|v| v.max(0) as u32),
                stories_per_month: row
                    .try_get::<Option<i64>, _>("custom_stories_per_month")?
                    .map(|v| v.max(0) as u64),
                ai_tokens_per_month: row
                    .try_get::<Option<i64>, _>("custom_ai_tokens_per_month")?
                    .map(|v| v.max(0) as u64),
            },
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Reservation {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status =
            ReservationStatus::from_str(&status_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown reservation status: {status_str}").into(),
            })?;
        let kind_str: String = row.try_get("resource_type")?;
        let resource_type =
            ResourceKind::parse(&kind_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "resource_type".into(),
                source: format!("unknown resource type: {kind_str}").into(),
            })?;
        Ok(Self {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            correlation_id: row.try_get("correlation_id")?,
            amount: row.try_get("amount")?,
            resource_type,
            resource_id: row.try_get("resource_id")?,
            status,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for AddOnGrant {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let type_str: String = row.try_get("grant_type")?;
        let grant_type = AddOnType::from_str(&type_str).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "grant_type".into(),
            source: format!("unknown add-on type: {type_str}").into(),
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            grant_type,
            quantity: row.try_get("quantity")?,
            remaining: row.try_get("remaining")?,
            activated_at: row.try_get("activated_at")?,
            expires_at: row.try_get("expires_at")?,
            active: row.try_get("active")?,
        })
    }
}
