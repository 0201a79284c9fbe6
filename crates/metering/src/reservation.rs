//! Reservation manager
//!
//! Short-lived holds against the usage pool, guarding asynchronous
//! operations (an AI call in flight) so a concurrent request cannot
//! double-spend while the first is pending. State machine:
//! `held -> {committed, released, expired}`; all three terminal.
//!
//! A reservation past its `expires_at` is logically expired for every reader
//! even before the sweep physically marks it: admission arithmetic and
//! `commit` both apply the `expires_at < now` check at read time, so a
//! delayed sweep can never cause a late commit to be silently honored.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use storyforge_shared::ResourceKind;

use crate::error::{MeteringError, MeteringResult};
use crate::ledger::{validate_amount, validate_correlation_id};
use crate::store::MeteringStore;

/// Default TTL for holds when the caller does not supply one
pub const DEFAULT_HOLD_TTL: Duration = Duration::from_secs(120);

/// Reservation lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "held" => Some(Self::Held),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Held)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisional hold against the usage pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub org_id: Uuid,
    /// Caller-supplied; deduplicates repeated holds and, on commit, the
    /// ledger increment for the same logical operation
    pub correlation_id: String,
    pub amount: i64,
    pub resource_type: ResourceKind,
    pub resource_id: Option<String>,
    pub status: ReservationStatus,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl Reservation {
    /// Held past TTL: logically expired even before the sweep marks it
    pub fn is_lapsed(&self, now: OffsetDateTime) -> bool {
        self.status == ReservationStatus::Held && self.expires_at <= now
    }

    /// Counts toward outstanding liability against the pool
    pub fn is_outstanding(&self, now: OffsetDateTime) -> bool {
        self.status == ReservationStatus::Held && now < self.expires_at
    }
}

/// Parameters for [`ReservationManager::hold`]
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub org_id: Uuid,
    pub amount: i64,
    pub correlation_id: String,
    pub resource_type: ResourceKind,
    pub resource_id: Option<String>,
    pub ttl: Duration,
}

/// Store-level admission outcome for a hold attempt
#[derive(Debug, Clone)]
pub enum HoldOutcome {
    /// A new hold was admitted
    Held(Reservation),
    /// An unexpired hold with the same correlation id already exists;
    /// returned unchanged
    Existing(Reservation),
    /// Admission would overdraw the pool
    Denied { available: i64 },
}

/// Summary of one expiry sweep pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub reclaimed_amount: i64,
}

/// Creates and terminates reservations; the expiry sweep is the sole actor
/// allowed to transition `held -> expired`.
#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn MeteringStore>,
    default_ttl: Duration,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self {
            store,
            default_ttl: DEFAULT_HOLD_TTL,
        }
    }

    pub fn with_default_ttl(store: Arc<dyn MeteringStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Acquire a hold.
    ///
    /// Idempotent on correlation id: an unexpired hold with the same id is
    /// returned unchanged. Admission requires the amount to fit within the
    /// currently available balance minus other outstanding holds for the
    /// organization; the store evaluates that arithmetic inside a single
    /// consistency scope with the ledger counters.
    pub async fn hold(
        &self,
        org_id: Uuid,
        amount: i64,
        correlation_id: &str,
        ttl: Option<Duration>,
        resource_type: ResourceKind,
        resource_id: Option<String>,
        now: OffsetDateTime,
    ) -> MeteringResult<Reservation> {
        validate_amount(amount)?;
        validate_correlation_id(correlation_id)?;

        let request = HoldRequest {
            org_id,
            amount,
            correlation_id: correlation_id.to_string(),
            resource_type,
            resource_id,
            ttl: ttl.unwrap_or(self.default_ttl),
        };

        match self.store.try_hold(&request, now).await? {
            HoldOutcome::Held(reservation) => {
                tracing::debug!(
                    org_id = %org_id,
                    reservation_id = %reservation.id,
                    amount = amount,
                    expires_at = %reservation.expires_at,
                    "Acquired reservation"
                );
                Ok(reservation)
            }
            HoldOutcome::Existing(reservation) => Ok(reservation),
            HoldOutcome::Denied { available } => Err(MeteringError::LimitExceeded(format!(
                "requested {amount} tokens but only {available} are available"
            ))),
        }
    }

    /// Commit a held reservation.
    ///
    /// Transitions `held -> committed` and applies the ledger increment with
    /// the reservation's correlation id in the same store transaction; the
    /// two writes cannot diverge. Committing a lapsed hold fails with
    /// `Expired` and leaves the counters untouched; committing a terminal
    /// reservation fails with `Conflict`.
    pub async fn commit(&self, reservation_id: Uuid, now: OffsetDateTime) -> MeteringResult<Reservation> {
        let reservation = self.store.commit_reservation(reservation_id, now).await?;
        tracing::info!(
            org_id = %reservation.org_id,
            reservation_id = %reservation_id,
            amount = reservation.amount,
            "Committed reservation"
        );
        Ok(reservation)
    }

    /// Release a held reservation with no ledger effect.
    ///
    /// Safe to call on an already-terminal reservation (idempotent no-op
    /// returning the terminal state).
    pub async fn release(&self, reservation_id: Uuid, now: OffsetDateTime) -> MeteringResult<Reservation> {
        let reservation = self.store.release_reservation(reservation_id, now).await?;
        tracing::debug!(
            reservation_id = %reservation_id,
            status = %reservation.status,
            "Released reservation"
        );
        Ok(reservation)
    }

    pub async fn get(&self, reservation_id: Uuid) -> MeteringResult<Reservation> {
        self.store
            .reservation(reservation_id)
            .await?
            .ok_or_else(|| MeteringError::NotFound(format!("reservation {reservation_id}")))
    }

    /// Expire all holds past TTL and release their claim on the pool.
    ///
    /// Scheduled, not request-triggered. Safe to run concurrently with
    /// itself and with late commits: the store's conditional transition means
    /// each hold is expired at most once, and a commit racing the sweep on an
    /// already-lapsed hold is rejected with `Expired` either way.
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> MeteringResult<SweepReport> {
        let expired = self.store.expire_reservations(now).await?;
        let report = SweepReport {
            expired: expired.len(),
            reclaimed_amount: expired.iter().map(|r| r.amount).sum(),
        };
        if report.expired > 0 {
            tracing::info!(
                expired = report.expired,
                reclaimed_amount = report.reclaimed_amount,
                "Expired abandoned reservations"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reservation(status: ReservationStatus, expires_at: OffsetDateTime) -> Reservation {
        Reservation {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            correlation_id: "corr-1".to_string(),
            amount: 100,
            resource_type: ResourceKind::Tokens,
            resource_id: None,
            status,
            created_at: datetime!(2026-05-01 12:00 UTC),
            expires_at,
        }
    }

    #[test]
    fn held_past_ttl_is_lapsed_before_sweep() {
        let now = datetime!(2026-05-01 12:05 UTC);
        let lapsed = reservation(ReservationStatus::Held, datetime!(2026-05-01 12:02 UTC));
        assert!(lapsed.is_lapsed(now));
        assert!(!lapsed.is_outstanding(now));

        let live = reservation(ReservationStatus::Held, datetime!(2026-05-01 12:10 UTC));
        assert!(!live.is_lapsed(now));
        assert!(live.is_outstanding(now));
    }

    #[test]
    fn terminal_states_never_count_as_outstanding() {
        let now = datetime!(2026-05-01 12:00 UTC);
        for status in [
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            let r = reservation(status, datetime!(2026-05-01 13:00 UTC));
            assert!(status.is_terminal());
            assert!(!r.is_outstanding(now));
            assert!(!r.is_lapsed(now));
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ReservationStatus::Held,
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::from_str(s.as_str()), Some(s));
        }
    }
}
