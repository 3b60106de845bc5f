//! Entitlements and feature gating.
//!
//! [`project`] is the only place tier rules are evaluated. Every call site
//! consumes the resulting [`FeatureEntitlementBundle`] instead of comparing
//! tiers itself.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::storage::{SubscriptionRecord, UsageLimitRecord};
use super::tier::{limit_for_tier, Tier};

/// Derived feature flags for one identity. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[must_use]
pub struct FeatureEntitlementBundle {
    pub is_active: bool,
    /// Nominal stored tier, for display. Gating uses [`effective_tier`](Self::effective_tier).
    pub tier: Tier,
    pub monthly_post_limit: u32,
    pub monthly_posts_used: u32,
    pub has_job_view_stats: bool,
    pub has_advanced_stats: bool,
    pub can_boost_posts: bool,
    pub has_priority_support: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A gated capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    PostJobs,
    JobViewStats,
    AdvancedStats,
    BoostPosts,
    PrioritySupport,
}

/// Result of checking a single feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureCheckResult {
    /// Feature is available.
    Allowed,
    /// The plan includes it but the subscription is not live.
    SubscriptionInactive,
    /// Not part of the plan.
    FeatureNotIncluded,
}

impl FeatureCheckResult {
    /// Check if the feature is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Compute the feature bundle.
///
/// A subscription whose `expires_at` has passed is treated as inactive even
/// if `active` is still set. An inactive subscription projects exactly like
/// `free`, apart from the `tier` field which keeps the stored value.
pub fn project(
    tier: Tier,
    active: bool,
    expires_at: Option<DateTime<Utc>>,
    monthly_limit: u32,
    monthly_used: u32,
    now: DateTime<Utc>,
) -> FeatureEntitlementBundle {
    let is_active = active && !expires_at.is_some_and(|end| end < now);
    let effective = if is_active { tier } else { Tier::Free };

    let monthly_post_limit = if is_active {
        monthly_limit
    } else {
        limit_for_tier(Tier::Free)
    };

    FeatureEntitlementBundle {
        is_active,
        tier,
        monthly_post_limit,
        monthly_posts_used: monthly_used,
        has_job_view_stats: matches!(effective, Tier::Standard | Tier::Premium),
        has_advanced_stats: effective == Tier::Premium,
        can_boost_posts: effective == Tier::Premium,
        has_priority_support: effective == Tier::Premium,
        expires_at,
    }
}

impl FeatureEntitlementBundle {
    /// Bundle for the two reconciled rows.
    pub fn from_records(
        subscription: &SubscriptionRecord,
        usage: &UsageLimitRecord,
        now: DateTime<Utc>,
    ) -> Self {
        project(
            subscription.tier,
            subscription.active,
            subscription.expires_at,
            usage.monthly_limit,
            usage.monthly_used,
            now,
        )
    }

    /// Bundle for a signed-out visitor or an identity with no rows yet.
    pub fn free() -> Self {
        Self {
            is_active: false,
            tier: Tier::Free,
            monthly_post_limit: limit_for_tier(Tier::Free),
            monthly_posts_used: 0,
            has_job_view_stats: false,
            has_advanced_stats: false,
            can_boost_posts: false,
            has_priority_support: false,
            expires_at: None,
        }
    }

    /// Tier used for gating.
    #[must_use]
    pub fn effective_tier(&self) -> Tier {
        if self.is_active {
            self.tier
        } else {
            Tier::Free
        }
    }

    /// Posts left this period.
    #[must_use]
    pub fn remaining_posts(&self) -> u32 {
        self.monthly_post_limit
            .saturating_sub(self.monthly_posts_used)
    }

    /// Whether the bundle grants `feature`.
    #[must_use]
    pub fn has(&self, feature: Feature) -> bool {
        match feature {
            Feature::PostJobs => self.effective_tier().can_post() && self.remaining_posts() > 0,
            Feature::JobViewStats => self.has_job_view_stats,
            Feature::AdvancedStats => self.has_advanced_stats,
            Feature::BoostPosts => self.can_boost_posts,
            Feature::PrioritySupport => self.has_priority_support,
        }
    }

    /// Check a feature, telling an inactive plan apart from a missing one.
    pub fn check(&self, feature: Feature) -> FeatureCheckResult {
        if self.has(feature) {
            return FeatureCheckResult::Allowed;
        }
        if !self.is_active {
            let nominal = project(
                self.tier,
                true,
                None,
                limit_for_tier(self.tier),
                self.monthly_posts_used,
                DateTime::<Utc>::MIN_UTC,
            );
            if nominal.has(feature) {
                return FeatureCheckResult::SubscriptionInactive;
            }
        }
        FeatureCheckResult::FeatureNotIncluded
    }
}
