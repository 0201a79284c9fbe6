//! Entitlement resolution
//!
//! Maps a subscription tier plus per-organization overrides to a structured
//! entitlement set. This sits on every request's hot path, so it is a pure,
//! total function: unknown or malformed input resolves to the most
//! restrictive known entitlement (fail-closed), never an error.

use serde::{Deserialize, Serialize};
use storyforge_shared::{SubscriptionTier, SupportTier};

/// Feature flags carried by an entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementFeatures {
    /// Advanced AI models (larger context, higher quality)
    pub advanced_ai: bool,
    /// Document/story exports
    pub exports: bool,
    /// Story templates library
    pub templates: bool,
    /// SSO/SAML support
    pub sso: bool,
}

impl EntitlementFeatures {
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free => Self {
                advanced_ai: false,
                exports: false,
                templates: false,
                sso: false,
            },
            SubscriptionTier::Starter => Self {
                advanced_ai: false,
                exports: true,
                templates: true,
                sso: false,
            },
            SubscriptionTier::Pro => Self {
                advanced_ai: true,
                exports: true,
                templates: true,
                sso: false,
            },
            SubscriptionTier::Team | SubscriptionTier::Enterprise => Self {
                advanced_ai: true,
                exports: true,
                templates: true,
                sso: true,
            },
        }
    }
}

/// Per-organization overrides applied on top of tier defaults
///
/// Populated from explicit nullable columns on the organization record
/// (admin-set custom limits). `None` means "use the tier default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementOverrides {
    pub max_seats: Option<u32>,
    pub max_projects: Option<u32>,
    pub stories_per_month: Option<u64>,
    pub ai_tokens_per_month: Option<u64>,
}

/// Resolved entitlement for one billing period
///
/// Immutable once resolved; the Billing Period Manager captures
/// `ai_tokens_per_month` as the period's `tokens_limit` at rotation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: SubscriptionTier,
    pub max_seats: u32,
    pub max_projects: u32,
    pub stories_per_month: u64,
    pub ai_tokens_per_month: u64,
    pub features: EntitlementFeatures,
    pub support: SupportTier,
    /// Whether unused tokens carry into the next period
    pub rollover_eligible: bool,
    /// Upper bound on carried tokens per rotation
    pub rollover_cap_tokens: u64,
    /// Whether usage may exceed the token limit (billed as overage)
    pub overage_permitted: bool,
    /// Overage billing rate; zero for tiers where overage is not permitted
    pub overage_cents_per_1000_tokens: u32,
}

impl Entitlement {
    /// Resolve the entitlement for a tier with optional overrides.
    ///
    /// Pure and total: there is no error path. Overrides only take effect
    /// where set; everything else comes from the tier defaults.
    pub fn resolve(tier: SubscriptionTier, overrides: &EntitlementOverrides) -> Self {
        let base = Self::for_tier(tier);
        Self {
            max_seats: overrides.max_seats.unwrap_or(base.max_seats),
            max_projects: overrides.max_projects.unwrap_or(base.max_projects),
            stories_per_month: overrides.stories_per_month.unwrap_or(base.stories_per_month),
            ai_tokens_per_month: overrides
                .ai_tokens_per_month
                .unwrap_or(base.ai_tokens_per_month),
            ..base
        }
    }

    /// Resolve from a stored tier string. Unknown tiers fall back to the most
    /// restrictive entitlement rather than failing.
    pub fn resolve_str(tier: &str, overrides: &EntitlementOverrides) -> Self {
        let tier = SubscriptionTier::parse(tier).unwrap_or(SubscriptionTier::Free);
        Self::resolve(tier, overrides)
    }

    /// Tier defaults
    ///
    /// Ladder: Free (10K tokens) -> Starter (100K) -> Pro (500K) -> Team (2M)
    /// -> Enterprise (unlimited). Rollover starts at Pro; overage at Team.
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        let features = EntitlementFeatures::for_tier(tier);
        match tier {
            SubscriptionTier::Free => Self {
                tier,
                max_seats: 1,
                max_projects: 1,
                stories_per_month: 25,
                ai_tokens_per_month: 10_000,
                features,
                support: SupportTier::Community,
                rollover_eligible: false,
                rollover_cap_tokens: 0,
                overage_permitted: false,
                overage_cents_per_1000_tokens: 0,
            },
            SubscriptionTier::Starter => Self {
                tier,
                max_seats: 3,
                max_projects: 5,
                stories_per_month: 200,
                ai_tokens_per_month: 100_000,
                features,
                support: SupportTier::Standard,
                rollover_eligible: false,
                rollover_cap_tokens: 0,
                overage_permitted: false,
                overage_cents_per_1000_tokens: 0,
            },
            SubscriptionTier::Pro => Self {
                tier,
                max_seats: 10,
                max_projects: 25,
                stories_per_month: 1_000,
                ai_tokens_per_month: 500_000,
                features,
                support: SupportTier::Standard,
                rollover_eligible: true,
                rollover_cap_tokens: 250_000,
                overage_permitted: false,
                overage_cents_per_1000_tokens: 0,
            },
            SubscriptionTier::Team => Self {
                tier,
                max_seats: 50,
                max_projects: 100,
                stories_per_month: 5_000,
                ai_tokens_per_month: 2_000_000,
                features,
                support: SupportTier::Priority,
                rollover_eligible: true,
                rollover_cap_tokens: 1_000_000,
                overage_permitted: true,
                overage_cents_per_1000_tokens: 150,
            },
            SubscriptionTier::Enterprise => Self {
                tier,
                max_seats: u32::MAX,
                max_projects: u32::MAX,
                stories_per_month: u64::MAX,
                ai_tokens_per_month: u64::MAX,
                features,
                support: SupportTier::Dedicated,
                rollover_eligible: true,
                rollover_cap_tokens: u64::MAX,
                overage_permitted: true,
                overage_cents_per_1000_tokens: 0,
            },
        }
    }

    /// Token limit as stored on the usage row (i64 column, saturated)
    pub fn tokens_limit_i64(&self) -> i64 {
        i64::try_from(self.ai_tokens_per_month).unwrap_or(i64::MAX)
    }

    /// Charge for tokens consumed beyond the limit, rounded up to the cent.
    /// Zero when overage is not permitted (admission refuses the spend) or
    /// when the tier's rate is zero.
    pub fn overage_charges_cents(&self, overage_tokens: i64) -> i64 {
        if !self.overage_permitted || overage_tokens <= 0 {
            return 0;
        }
        let rate = i64::from(self.overage_cents_per_1000_tokens);
        (overage_tokens.saturating_mul(rate) + 999) / 1000
    }
}
