//! Subscription tiers and the limits derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::BillingError;

/// Monthly post limit used for tiers without a practical cap.
///
/// Stored as a concrete number so `monthly_limit == limit_for_tier(tier)` stays
/// checkable on the usage row.
pub const UNBOUNDED_POST_LIMIT: u32 = 999_999;

/// Subscription plan level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No paid plan.
    #[default]
    Free,
    /// Entry plan, a handful of posts per month.
    Basic,
    /// Mid plan with view statistics.
    Standard,
    /// Everything, unbounded posting.
    Premium,
    /// One-off purchase of a single post.
    Single,
}

impl Tier {
    /// All tiers, in declaration order.
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Basic,
        Tier::Standard,
        Tier::Premium,
        Tier::Single,
    ];

    /// Convert to the string stored in the remote tables.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Single => "single",
        }
    }

    /// Parse a tier as reported by the billing authority.
    ///
    /// Unknown values map to [`Tier::Free`] so a typo upstream can never grant
    /// paid features.
    #[must_use]
    pub fn from_remote(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(
                target: "hireboard::billing",
                tier = %value,
                "Unknown tier from billing authority, treating as free"
            );
            Self::Free
        })
    }

    /// Monthly job-post cap for this tier.
    #[must_use]
    pub fn monthly_post_limit(&self) -> u32 {
        limit_for_tier(*self)
    }

    /// Whether accounts on this tier may create job posts at all.
    #[must_use]
    pub fn can_post(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Ordering used to compare plans.
    ///
    /// `single` is a one-off purchase and sits between `standard` and `premium`
    /// only so that comparisons are total; it grants nothing beyond `free`
    /// apart from the right to post.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Basic => 1,
            Self::Standard => 2,
            Self::Single => 3,
            Self::Premium => 4,
        }
    }
}

/// Monthly post limit for a tier.
///
/// | tier | limit |
/// |------|-------|
/// | free | 1 |
/// | single | 1 |
/// | basic | 5 |
/// | standard | 15 |
/// | premium | [`UNBOUNDED_POST_LIMIT`] |
#[must_use]
pub fn limit_for_tier(tier: Tier) -> u32 {
    match tier {
        Tier::Free | Tier::Single => 1,
        Tier::Basic => 5,
        Tier::Standard => 15,
        Tier::Premium => UNBOUNDED_POST_LIMIT,
    }
}

impl FromStr for Tier {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            "single" => Ok(Self::Single),
            _ => Err(BillingError::UnknownTier {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
