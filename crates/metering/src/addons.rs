//! Add-on credit store
//!
//! Purchased supplemental allowances, each with its own expiry, stackability
//! and activation cap. Grants are mutated only by the purchase flow (an
//! external collaborator calling [`AddOnStore::grant`]) and by the expiry
//! sweep, which marks grants inactive and never deletes them, preserving
//! audit history.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{MeteringError, MeteringResult};
use crate::ledger::validate_amount;
use crate::store::MeteringStore;

/// Supported add-on grant types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOnType {
    /// One-time token pack, expires if unused
    TokenPack,
    /// Recurring monthly token booster, renewed by the purchase flow
    RecurringBooster,
    /// Priority support flag, not metered
    PrioritySupport,
}

impl AddOnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenPack => "token_pack",
            Self::RecurringBooster => "recurring_booster",
            Self::PrioritySupport => "priority_support",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "token_pack" => Some(Self::TokenPack),
            "recurring_booster" => Some(Self::RecurringBooster),
            "priority_support" => Some(Self::PrioritySupport),
            _ => None,
        }
    }

    /// Whether multiple active grants of this type may coexist
    pub fn is_stackable(&self) -> bool {
        matches!(self, Self::TokenPack)
    }

    /// Cap on simultaneously active grants of this type per organization
    pub fn max_active(&self) -> usize {
        match self {
            Self::TokenPack => 10,
            Self::RecurringBooster | Self::PrioritySupport => 1,
        }
    }

    /// Whether grants of this type carry consumable token quantity
    pub fn is_metered(&self) -> bool {
        matches!(self, Self::TokenPack | Self::RecurringBooster)
    }
}

impl std::fmt::Display for AddOnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A purchased supplemental allowance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOnGrant {
    pub id: Uuid,
    pub org_id: Uuid,
    pub grant_type: AddOnType,
    /// Quantity granted at purchase
    pub quantity: i64,
    /// Quantity not yet consumed
    pub remaining: i64,
    pub activated_at: OffsetDateTime,
    /// `None` for recurring types, which renew instead of expiring
    pub expires_at: Option<OffsetDateTime>,
    /// Cleared by the expiry sweep; inactive grants are kept for audit
    pub active: bool,
}

impl AddOnGrant {
    /// Active at `now`: activated, not expired, not deactivated
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.active
            && self.activated_at <= now
            && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Service managing purchased add-on credits
#[derive(Clone)]
pub struct AddOnStore {
    store: Arc<dyn MeteringStore>,
}

impl AddOnStore {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Record a purchased grant.
    ///
    /// Fails with `LimitExceeded` when activating would put the organization
    /// over `max_active` for the type (1 for non-stackable types).
    pub async fn grant(
        &self,
        org_id: Uuid,
        grant_type: AddOnType,
        quantity: i64,
        expires_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> MeteringResult<AddOnGrant> {
        if grant_type.is_metered() {
            validate_amount(quantity)?;
        }
        if let Some(exp) = expires_at {
            if exp <= now {
                return Err(MeteringError::InvalidArgument(
                    "expires_at must be in the future".to_string(),
                ));
            }
        }

        let active_of_type = self
            .store
            .active_grants(org_id, now)
            .await?
            .into_iter()
            .filter(|g| g.grant_type == grant_type)
            .count();
        if active_of_type >= grant_type.max_active() {
            return Err(MeteringError::LimitExceeded(format!(
                "organization already has {active_of_type} active {grant_type} grant(s), cap is {}",
                grant_type.max_active()
            )));
        }

        let grant = AddOnGrant {
            id: Uuid::new_v4(),
            org_id,
            grant_type,
            quantity,
            remaining: if grant_type.is_metered() { quantity } else { 0 },
            activated_at: now,
            expires_at,
            active: true,
        };
        let grant = self.store.insert_grant(&grant).await?;

        tracing::info!(
            org_id = %org_id,
            grant_id = %grant.id,
            grant_type = %grant_type,
            quantity = quantity,
            "Recorded add-on grant"
        );
        Ok(grant)
    }

    /// Remaining quantity of currently-active grants, summed per type
    pub async fn active_balance(
        &self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> MeteringResult<HashMap<AddOnType, i64>> {
        let grants = self.store.active_grants(org_id, now).await?;
        let mut balance: HashMap<AddOnType, i64> = HashMap::new();
        for grant in grants {
            *balance.entry(grant.grant_type).or_insert(0) += grant.remaining;
        }
        Ok(balance)
    }

    /// Consume `amount` credits of the given type, depleting the
    /// oldest-expiring active grants first.
    ///
    /// Expiry ordering (not creation ordering) is a billing-fairness policy:
    /// credits that would otherwise lapse unused are spent before
    /// longer-lived ones. Returns false when active credits cannot cover the
    /// amount; nothing is consumed in that case.
    pub async fn consume(
        &self,
        org_id: Uuid,
        grant_type: AddOnType,
        amount: i64,
        now: OffsetDateTime,
    ) -> MeteringResult<bool> {
        validate_amount(amount)?;
        self.store
            .consume_credits(org_id, grant_type, amount, now)
            .await
    }

    /// Mark all grants past their expiry inactive. Scheduled, never deletes.
    pub async fn deactivate_expired(&self, now: OffsetDateTime) -> MeteringResult<u64> {
        let deactivated = self.store.deactivate_expired_grants(now).await?;
        if deactivated > 0 {
            tracing::info!(deactivated = deactivated, "Deactivated expired add-on grants");
        }
        Ok(deactivated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn type_round_trips_through_str() {
        for t in [
            AddOnType::TokenPack,
            AddOnType::RecurringBooster,
            AddOnType::PrioritySupport,
        ] {
            assert_eq!(AddOnType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(AddOnType::from_str("mystery_pack"), None);
    }

    #[test]
    fn non_stackable_types_cap_at_one() {
        assert!(AddOnType::TokenPack.is_stackable());
        assert!(!AddOnType::RecurringBooster.is_stackable());
        assert_eq!(AddOnType::RecurringBooster.max_active(), 1);
        assert_eq!(AddOnType::PrioritySupport.max_active(), 1);
    }

    #[test]
    fn grant_activity_window() {
        let now = datetime!(2026-05-10 12:00 UTC);
        let grant = AddOnGrant {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            grant_type: AddOnType::TokenPack,
            quantity: 1000,
            remaining: 1000,
            activated_at: datetime!(2026-05-01 00:00 UTC),
            expires_at: Some(datetime!(2026-06-01 00:00 UTC)),
            active: true,
        };
        assert!(grant.is_active(now));
        assert!(!grant.is_active(datetime!(2026-06-01 00:00 UTC)));
        assert!(!grant.is_active(datetime!(2026-04-30 00:00 UTC)));

        let deactivated = AddOnGrant {
            active: false,
            ..grant
        };
        assert!(!deactivated.is_active(now));
    }
}
