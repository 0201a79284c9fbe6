// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Metering Engine
//!
//! Tests critical boundary conditions and race conditions in:
//! - Exactly-once increment accounting
//! - Reservation admission under concurrency and terminal-state rules
//! - Rollover and billing-period rotation, including month-end clamping
//! - Multi-source token drain ordering
//! - Confirmation polling bounds
//! - Grace period enforcement

use std::sync::Arc;

use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use storyforge_shared::SubscriptionTier;

use crate::entitlement::EntitlementOverrides;
use crate::store::{MemoryMeteringStore, MeteringStore, OrganizationRecord, SubscriptionState};
use crate::MeteringService;

fn org_record(tier: SubscriptionTier, anchor_day: u8, overrides: EntitlementOverrides) -> OrganizationRecord {
    OrganizationRecord {
        id: Uuid::new_v4(),
        name: "Test Org".to_string(),
        subscription_tier: tier.as_str().to_string(),
        billing_anchor_day: anchor_day,
        subscription_state: SubscriptionState::Active,
        grace_period_ends_at: None,
        blocked_at: None,
        block_reason: None,
        overrides,
    }
}

/// Service over a shared in-memory store, with the store handle kept for
/// seeding organizations
async fn service_with_org(
    tier: SubscriptionTier,
    anchor_day: u8,
    overrides: EntitlementOverrides,
) -> (MeteringService, Arc<MemoryMeteringStore>, Uuid) {
    let store = Arc::new(MemoryMeteringStore::new());
    let org = org_record(tier, anchor_day, overrides);
    let org_id = org.id;
    store.insert_organization(org).await;
    let service = MeteringService::new(store.clone());
    (service, store, org_id)
}

fn limit_override(tokens: u64) -> EntitlementOverrides {
    EntitlementOverrides {
        ai_tokens_per_month: Some(tokens),
        ..Default::default()
    }
}

mod ledger_tests {
    use super::*;
    use storyforge_shared::ResourceKind;

    #[tokio::test]
    async fn duplicate_correlation_id_is_counted_once() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let first = service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 500, "gen-req-1", now)
            .await
            .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.counter_after, 500);

        // Retried delivery of the same logical operation
        let second = service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 500, "gen-req-1", now)
            .await
            .unwrap();
        assert!(second.replayed, "duplicate must be replayed, not re-applied");
        assert_eq!(second.counter_after, 500);

        let usage = service.ledger.get_or_create(org_id, now).await.unwrap();
        assert_eq!(usage.tokens_used, 500);
    }

    #[tokio::test]
    async fn distinct_correlation_ids_both_apply() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 300, "gen-req-1", now)
            .await
            .unwrap();
        let second = service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 200, "gen-req-2", now)
            .await
            .unwrap();
        assert_eq!(second.counter_after, 500);
    }

    #[tokio::test]
    async fn zero_and_negative_amounts_rejected() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Free, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        for amount in [0, -100] {
            let err = service
                .ledger
                .increment(org_id, ResourceKind::Tokens, amount, "bad", now)
                .await
                .unwrap_err();
            assert!(matches!(err, crate::MeteringError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn unknown_org_is_not_found() {
        let service = MeteringService::in_memory();
        let err = service
            .ledger
            .increment(
                Uuid::new_v4(),
                ResourceKind::Tokens,
                10,
                "x",
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::MeteringError::NotFound(_)));
    }
}

mod drain_order_tests {
    use super::*;
    use crate::addons::AddOnType;
    use storyforge_shared::ResourceKind;

    #[tokio::test]
    async fn spill_drains_soonest_expiring_grant_first() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, now).await.unwrap();

        // Long-lived pack granted first, short-lived pack second
        service
            .addons
            .grant(
                org_id,
                AddOnType::TokenPack,
                500,
                Some(datetime!(2026-06-01 00:00 UTC)),
                now,
            )
            .await
            .unwrap();
        let short = service
            .addons
            .grant(
                org_id,
                AddOnType::TokenPack,
                500,
                Some(datetime!(2026-03-15 00:00 UTC)),
                now,
            )
            .await
            .unwrap();

        // 100 base + 300 spill; spill must hit the soonest-expiring pack
        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 400, "big-gen", now)
            .await
            .unwrap();

        let active = service.addons.active_balance(org_id, now).await.unwrap();
        assert_eq!(active[&AddOnType::TokenPack], 700);

        // After the short pack expires only the untouched long pack remains
        let after_expiry = datetime!(2026-03-16 00:00 UTC);
        let active = service
            .addons
            .active_balance(org_id, after_expiry)
            .await
            .unwrap();
        assert_eq!(
            active[&AddOnType::TokenPack], 500,
            "spill must have drained the soonest-expiring pack ({})",
            short.id
        );
    }

    #[tokio::test]
    async fn credit_covered_spill_is_not_overage() {
        // Pro forbids overage; spill absorbed by a pack must not push the
        // base counter past the limit
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, now).await.unwrap();

        service
            .addons
            .grant(org_id, AddOnType::TokenPack, 500, None, now)
            .await
            .unwrap();

        // 100 base + 300 from the pack
        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 400, "big-gen", now)
            .await
            .unwrap();

        let usage = service.ledger.get_or_create(org_id, now).await.unwrap();
        assert_eq!(usage.tokens_used, 100, "covered spill must not count as base usage");
        assert_eq!(usage.overage_tokens(), 0);

        let active = service.addons.active_balance(org_id, now).await.unwrap();
        assert_eq!(active[&AddOnType::TokenPack], 200);
    }

    #[tokio::test]
    async fn spill_past_all_sources_is_overage() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Team, 1, limit_override(100)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 250, "huge-gen", now)
            .await
            .unwrap();

        let usage = service.ledger.get_or_create(org_id, now).await.unwrap();
        assert_eq!(usage.tokens_used, 250);
        assert_eq!(usage.overage_tokens(), 150);
        assert_eq!(usage.remaining_base_tokens(), 0);
    }
}

mod reservation_tests {
    use super::*;
    use storyforge_shared::ResourceKind;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn concurrent_holds_never_exceed_pool() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, now).await.unwrap();

        let service = Arc::new(service);
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        // 10 concurrent holds of 300 against a 1000 pool: at most 3 admitted
        for i in 0..10 {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .reserve(
                        org_id,
                        300,
                        &format!("hold-{i}"),
                        None,
                        ResourceKind::Tokens,
                        None,
                        now,
                    )
                    .await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert!(admitted <= 3, "admitted {admitted} holds of 300 into 1000");
        assert!(admitted >= 1, "at least one hold must be admitted");
    }

    #[tokio::test]
    async fn hold_is_idempotent_on_correlation_id() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let first = service
            .reserve(org_id, 400, "gen-9", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap();
        let second = service
            .reserve(org_id, 400, "gen-9", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap();
        assert_eq!(first.id, second.id, "same correlation id, same hold");

        // Only one 400 hold is outstanding, so 600 still fits
        let third = service
            .reserve(org_id, 600, "gen-10", None, ResourceKind::Tokens, None, now)
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn commit_applies_increment_exactly_once() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let hold = service
            .reserve(org_id, 250, "gen-77", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap();
        service.reservations.commit(hold.id, now).await.unwrap();

        let usage = service.ledger.get_or_create(org_id, now).await.unwrap();
        assert_eq!(usage.tokens_used, 250);

        // A direct increment with the hold's correlation id replays
        let result = service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 250, "gen-77", now)
            .await
            .unwrap();
        assert!(result.replayed);
        let usage = service.ledger.get_or_create(org_id, now).await.unwrap();
        assert_eq!(usage.tokens_used, 250);
    }

    #[tokio::test]
    async fn commit_after_expiry_fails_without_counting() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let hold = service
            .reserve(
                org_id,
                250,
                "gen-slow",
                Some(std::time::Duration::from_secs(60)),
                ResourceKind::Tokens,
                None,
                now,
            )
            .await
            .unwrap();

        // Operation finishes after the TTL, before any sweep ran
        let late = now + Duration::seconds(120);
        let err = service.reservations.commit(hold.id, late).await.unwrap_err();
        assert!(matches!(err, crate::MeteringError::Expired(_)));

        let usage = service.ledger.get_or_create(org_id, late).await.unwrap();
        assert_eq!(usage.tokens_used, 0, "failed commit must not count usage");
    }

    #[tokio::test]
    async fn terminal_states_reject_commit_and_tolerate_release() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let hold = service
            .reserve(org_id, 100, "gen-t", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap();
        service.reservations.commit(hold.id, now).await.unwrap();

        let err = service.reservations.commit(hold.id, now).await.unwrap_err();
        assert!(matches!(err, crate::MeteringError::Conflict(_)));

        // Release on a committed reservation is an idempotent no-op
        let released = service.reservations.release(hold.id, now).await.unwrap();
        assert_eq!(released.status, crate::ReservationStatus::Committed);
    }

    #[tokio::test]
    async fn sweep_frees_held_capacity() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .reserve(
                org_id,
                900,
                "gen-a",
                Some(std::time::Duration::from_secs(60)),
                ResourceKind::Tokens,
                None,
                now,
            )
            .await
            .unwrap();

        // Pool nearly exhausted by the outstanding hold
        let denied = service
            .reserve(org_id, 500, "gen-b", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap_err();
        assert!(matches!(denied, crate::MeteringError::LimitExceeded(_)));

        let later = now + Duration::seconds(120);
        let report = service.reservations.sweep_expired(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.reclaimed_amount, 900);

        let ok = service
            .reserve(org_id, 500, "gen-b", None, ResourceKind::Tokens, None, later)
            .await;
        assert!(ok.is_ok(), "expired holds must release their claim");
    }
}

mod allowance_tests {
    use super::*;
    use crate::addons::AddOnType;
    use storyforge_shared::ResourceKind;

    #[tokio::test]
    async fn check_is_read_only() {
        let (service, store, org_id) =
            service_with_org(SubscriptionTier::Starter, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let decision = service
            .allowance
            .check_allowance(org_id, ResourceKind::Tokens, 1_000, now)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.available, 100_000);

        // No usage row was created by the read
        assert!(store.current_usage(org_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn denial_carries_breakdown_and_upgrade_hint() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Free, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 9_500, "gen-1", now)
            .await
            .unwrap();

        let decision = service
            .allowance
            .check_allowance(org_id, ResourceKind::Tokens, 1_000, now)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.available, 500);
        assert_eq!(decision.breakdown.base_remaining, 500);
        assert!(decision.reason.is_some());
        assert!(decision.upgrade_hint.unwrap().contains("starter"));
    }

    #[tokio::test]
    async fn addons_and_holds_shape_availability() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, now).await.unwrap();

        service
            .addons
            .grant(org_id, AddOnType::TokenPack, 500, None, now)
            .await
            .unwrap();
        service
            .reserve(org_id, 300, "held", None, ResourceKind::Tokens, None, now)
            .await
            .unwrap();

        let decision = service
            .allowance
            .check_allowance(org_id, ResourceKind::Tokens, 1, now)
            .await
            .unwrap();
        // 1000 base + 500 addon - 300 reserved
        assert_eq!(decision.available, 1200);
        assert_eq!(decision.breakdown.reserved, 300);
        assert_eq!(decision.breakdown.addon_balance, 500);
    }

    #[tokio::test]
    async fn fresh_org_counts_landed_grants_before_first_spend() {
        // Usage rows are created lazily, so a just-provisioned org has none;
        // a purchased pack must still show up in its availability
        let (service, store, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .addons
            .grant(org_id, AddOnType::TokenPack, 500, None, now)
            .await
            .unwrap();

        let decision = service
            .allowance
            .check_allowance(org_id, ResourceKind::Tokens, 550, now)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.available, 600);
        assert_eq!(decision.breakdown.base_remaining, 100);
        assert_eq!(decision.breakdown.addon_balance, 500);

        // The read must not have created the row
        assert!(store.current_usage(org_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seats_gated_by_entitlement_limit() {
        // Free allows a single seat
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Free, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let before = service
            .allowance
            .check_allowance(org_id, ResourceKind::Seats, 1, now)
            .await
            .unwrap();
        assert!(before.allowed);
        assert_eq!(before.available, 1);

        service
            .ledger
            .increment(org_id, ResourceKind::Seats, 1, "seat-1", now)
            .await
            .unwrap();

        let after = service
            .allowance
            .check_allowance(org_id, ResourceKind::Seats, 1, now)
            .await
            .unwrap();
        assert!(!after.allowed);
        assert_eq!(after.available, 0);
        assert!(after.reason.unwrap().contains("seats"));
    }

    #[tokio::test]
    async fn actions_gated_by_monthly_limit() {
        // Free allows 25 stories per month
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Free, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Actions, 24, "stories-bulk", now)
            .await
            .unwrap();

        let one_left = service
            .allowance
            .check_allowance(org_id, ResourceKind::Actions, 2, now)
            .await
            .unwrap();
        assert!(!one_left.allowed);
        assert_eq!(one_left.available, 1);
        assert!(one_left.reason.unwrap().contains("actions"));

        let fits = service
            .allowance
            .check_allowance(org_id, ResourceKind::Actions, 1, now)
            .await
            .unwrap();
        assert!(fits.allowed);
    }

    #[tokio::test]
    async fn blocked_org_is_denied_with_reason() {
        let store = Arc::new(MemoryMeteringStore::new());
        let org = org_record(SubscriptionTier::Pro, 1, Default::default());
        let org_id = org.id;
        store.insert_organization(org).await;
        let service = MeteringService::new(store.clone());
        let now = datetime!(2026-03-10 12:00 UTC);

        store
            .block_organization(org_id, "grace period expired", now)
            .await
            .unwrap();

        let decision = service
            .allowance
            .check_allowance(org_id, ResourceKind::Tokens, 1, now)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.available, 0);
        assert!(decision.reason.unwrap().contains("grace period expired"));
    }
}

mod period_tests {
    use super::*;
    use crate::period::PeriodRotation;
    use storyforge_shared::ResourceKind;

    #[tokio::test]
    async fn rotation_carries_capped_rollover() {
        // Pro with a 1000 limit and 300 spent: 700 unused carries
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let march = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 300, "gen-1", march)
            .await
            .unwrap();

        let april = datetime!(2026-04-02 00:00 UTC);
        let rotation = service.periods.rotate_org(org_id, april).await.unwrap();
        let PeriodRotation::Rotated { archived, current } = rotation else {
            panic!("expected a rotation");
        };
        assert!(archived.archived_at.is_some());
        assert_eq!(current.purchased_token_balance, 700);
        assert_eq!(current.tokens_used, 0);
        assert_eq!(current.tokens_limit, 1000);
    }

    #[tokio::test]
    async fn non_eligible_tier_carries_nothing() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Starter, 1, limit_override(1000)).await;
        let march = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, march).await.unwrap();

        let april = datetime!(2026-04-02 00:00 UTC);
        let rotation = service.periods.rotate_org(org_id, april).await.unwrap();
        assert_eq!(rotation.current().purchased_token_balance, 0);
    }

    #[tokio::test]
    async fn carry_tracks_the_row_the_store_archives() {
        // A commit landing while the rotation runs must be reflected in the
        // carry; the two interleave, but the carry always matches the final
        // archived counter
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let march = datetime!(2026-03-10 12:00 UTC);

        service
            .ledger
            .increment(org_id, ResourceKind::Tokens, 300, "gen-1", march)
            .await
            .unwrap();
        let hold = service
            .reserve(org_id, 400, "gen-2", None, ResourceKind::Tokens, None, march)
            .await
            .unwrap();

        let april = datetime!(2026-04-02 00:00 UTC);
        let service = Arc::new(service);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let rotator = {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                service.periods.rotate_org(org_id, april).await
            })
        };
        let committer = {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                service.reservations.commit(hold.id, march).await
            })
        };
        rotator.await.unwrap().unwrap();
        committer.await.unwrap().unwrap();

        let archived = service.ledger.archived_periods(org_id).await.unwrap();
        let archived = archived.first().expect("rotation must archive the row");
        let current = service.ledger.get_or_create(org_id, april).await.unwrap();

        // The 400 landed on whichever row was open when the commit applied
        assert_eq!(archived.tokens_used + current.tokens_used, 700);
        assert_eq!(
            current.purchased_token_balance,
            1000 - archived.tokens_used,
            "carry must be computed from the archived counter, not a stale read"
        );
    }

    #[tokio::test]
    async fn rotation_is_idempotent() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let march = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, march).await.unwrap();

        let april = datetime!(2026-04-02 00:00 UTC);
        service.periods.rotate_org(org_id, april).await.unwrap();
        let again = service.periods.rotate_org(org_id, april).await.unwrap();
        assert!(matches!(again, PeriodRotation::AlreadyCurrent(_)));

        let archived = service.ledger.archived_periods(org_id).await.unwrap();
        assert_eq!(archived.len(), 1, "retry must not archive twice");
    }

    #[tokio::test]
    async fn day_31_anchor_rotates_through_february() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 31, limit_override(1000)).await;

        // Created inside the clamped January-to-February period
        let feb = datetime!(2026-02-10 00:00 UTC);
        let usage = service.ledger.get_or_create(org_id, feb).await.unwrap();
        assert_eq!(usage.period_start, datetime!(2026-01-31 00:00 UTC));
        assert_eq!(usage.period_end, datetime!(2026-02-28 00:00 UTC));

        // Rotating in March re-anchors to the 31st
        let march = datetime!(2026-03-05 00:00 UTC);
        let rotation = service.periods.rotate_org(org_id, march).await.unwrap();
        let current = rotation.current();
        assert_eq!(current.period_start, datetime!(2026-02-28 00:00 UTC));
        assert_eq!(current.period_end, datetime!(2026-03-31 00:00 UTC));
    }

    #[tokio::test]
    async fn batch_reset_isolates_failures() {
        let store = Arc::new(MemoryMeteringStore::new());
        let good = org_record(SubscriptionTier::Pro, 1, Default::default());
        let good_id = good.id;
        store.insert_organization(good).await;
        let service = MeteringService::new(store.clone());

        let march = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(good_id, march).await.unwrap();

        let april = datetime!(2026-04-02 00:00 UTC);
        let report = service.periods.reset_expired_periods(april).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
    }
}

mod confirm_tests {
    use super::*;
    use crate::addons::AddOnType;
    use crate::confirm::ConfirmOptions;

    #[tokio::test]
    async fn confirms_once_balance_lands() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = OffsetDateTime::now_utc();
        service.ledger.get_or_create(org_id, now).await.unwrap();

        let service = Arc::new(service);
        let granter = Arc::clone(&service);
        tokio::spawn(async move {
            // Purchase lands while the caller is polling
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            granter
                .addons
                .grant(org_id, AddOnType::TokenPack, 500, None, OffsetDateTime::now_utc())
                .await
                .unwrap();
        });

        let outcome = service
            .confirmer
            .await_balance(
                org_id,
                600,
                ConfirmOptions {
                    max_attempts: 10,
                    delay_ms: 100,
                    deadline: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.confirmed);
        assert!(outcome.observed_available >= 600);
        assert!(outcome.attempts >= 2, "balance was not visible immediately");
    }

    #[tokio::test]
    async fn fresh_org_confirms_against_full_entitlement() {
        // No usage row yet: the observable balance is the entitlement plus
        // landed grants, not zero
        let (service, store, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = OffsetDateTime::now_utc();

        service
            .addons
            .grant(org_id, AddOnType::TokenPack, 500, None, now)
            .await
            .unwrap();

        let outcome = service
            .confirmer
            .await_balance(
                org_id,
                600,
                ConfirmOptions {
                    max_attempts: 3,
                    delay_ms: 10,
                    deadline: None,
                },
            )
            .await
            .unwrap();
        assert!(outcome.confirmed);
        assert_eq!(outcome.observed_available, 600);
        assert_eq!(outcome.attempts, 1, "the purchase already landed");

        // Polling must not have created the usage row
        assert!(store.current_usage(org_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_org_is_not_found() {
        let service = MeteringService::in_memory();
        let err = service
            .confirmer
            .await_balance(Uuid::new_v4(), 10, ConfirmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::MeteringError::NotFound(_)));
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(100)).await;
        let now = OffsetDateTime::now_utc();
        service.ledger.get_or_create(org_id, now).await.unwrap();

        let outcome = service
            .confirmer
            .await_balance(
                org_id,
                1_000_000,
                ConfirmOptions {
                    max_attempts: 3,
                    delay_ms: 10,
                    deadline: None,
                },
            )
            .await
            .unwrap();
        assert!(!outcome.confirmed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.observed_available, 100);
    }

    #[tokio::test]
    async fn zero_attempts_is_invalid() {
        let service = MeteringService::in_memory();
        let err = service
            .confirmer
            .await_balance(
                Uuid::new_v4(),
                10,
                ConfirmOptions {
                    max_attempts: 0,
                    delay_ms: 10,
                    deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::MeteringError::InvalidArgument(_)));
    }
}

mod grace_tests {
    use super::*;

    #[tokio::test]
    async fn sweep_blocks_only_past_deadline() {
        let store = Arc::new(MemoryMeteringStore::new());
        let lapsed = org_record(SubscriptionTier::Pro, 1, Default::default());
        let lapsed_id = lapsed.id;
        let within = org_record(SubscriptionTier::Pro, 1, Default::default());
        let within_id = within.id;
        store.insert_organization(lapsed).await;
        store.insert_organization(within).await;

        let now = datetime!(2026-03-10 12:00 UTC);
        store
            .mark_past_due(lapsed_id, datetime!(2026-03-09 00:00 UTC))
            .await;
        store
            .mark_past_due(within_id, datetime!(2026-03-20 00:00 UTC))
            .await;

        let service = MeteringService::new(store.clone());
        let report = service.monitor.run_grace_sweep(now).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.within_grace, 1);

        let blocked = store.organization(lapsed_id).await.unwrap().unwrap();
        assert_eq!(blocked.subscription_state, SubscriptionState::Blocked);
        assert!(blocked.block_reason.unwrap().contains("grace period"));

        let untouched = store.organization(within_id).await.unwrap().unwrap();
        assert_eq!(untouched.subscription_state, SubscriptionState::PastDue);

        // Re-running must not double-block
        let again = service.monitor.run_grace_sweep(now).await.unwrap();
        assert_eq!(again.blocked, 0);
    }

    #[tokio::test]
    async fn stuck_hold_judged_against_its_own_ttl() {
        use storyforge_shared::ResourceKind;

        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, limit_override(1000)).await;
        let now = datetime!(2026-03-10 12:00 UTC);

        let short = service
            .reserve(
                org_id,
                100,
                "gen-short",
                Some(std::time::Duration::from_secs(60)),
                ResourceKind::Tokens,
                None,
                now,
            )
            .await
            .unwrap();
        service
            .reserve(
                org_id,
                100,
                "gen-long",
                Some(std::time::Duration::from_secs(3600)),
                ResourceKind::Tokens,
                None,
                now,
            )
            .await
            .unwrap();

        // 150s in: the short hold sat 90s past expiry, longer than its own
        // 60s TTL, so the sweep has clearly missed it
        let summary = service
            .monitor
            .run_all_checks(now + Duration::seconds(150))
            .await
            .unwrap();
        let stuck = summary
            .violations
            .iter()
            .find(|v| v.check == "no_stuck_holds")
            .expect("short hold must be flagged");
        assert_eq!(stuck.org_ids, vec![org_id]);
        assert_eq!(
            stuck.context["reservation_ids"],
            serde_json::json!([short.id])
        );

        // 65min in: the long hold is 300s past expiry but still within its
        // own hour-long TTL, so only the short hold stays flagged
        let summary = service
            .monitor
            .run_all_checks(now + Duration::seconds(3900))
            .await
            .unwrap();
        let stuck = summary
            .violations
            .iter()
            .find(|v| v.check == "no_stuck_holds")
            .unwrap();
        assert_eq!(
            stuck.context["reservation_ids"],
            serde_json::json!([short.id])
        );
    }

    #[tokio::test]
    async fn healthy_store_passes_consistency_checks() {
        let (service, _, org_id) =
            service_with_org(SubscriptionTier::Pro, 1, Default::default()).await;
        let now = datetime!(2026-03-10 12:00 UTC);
        service.ledger.get_or_create(org_id, now).await.unwrap();

        let summary = service.monitor.run_all_checks(now).await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_failed, 0);
    }
}
