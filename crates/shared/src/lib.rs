//! Common types shared across StoryForge crates

pub mod types;

pub use types::{ResourceKind, SubscriptionTier, SupportTier};
