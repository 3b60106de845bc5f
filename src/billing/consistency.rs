//! Tier consistency between the subscription and usage-limit rows.
//!
//! The subscription row owns `tier`; the usage row owns `monthly_used`.
//! Neither is ever inferred from the other. After a pass the usage row
//! mirrors the subscription tier and carries the matching limit, and a
//! period that has ended is rolled over.
//!
//! Write failures do not abort a pass. They are logged, the pass is marked
//! partial, and the caller gets the values the store should have held.
//! Read failures do abort, since guessing would mean defaulting to free.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};

use super::audit::{EntitlementAuditEvent, EntitlementAuditLogger, NoOpAuditLogger};
use super::clock::{Clock, SystemClock};
use super::storage::{
    monthly_window, BillingResult, EntitlementStore, SubscriptionRecord, UsageLimitPatch,
    UsageLimitRecord, SUBSCRIPTION_TABLE, USAGE_LIMIT_TABLE,
};
use super::tier::{limit_for_tier, Tier};

/// Upper bound on whole-month steps when advancing a stale window.
const MAX_PERIOD_STEPS: u32 = 1200;

/// Something the resolver changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveAction {
    /// Subscription row was missing and a free row was created.
    SubscriptionCreated,
    /// Usage row was missing and a default row was created.
    UsageCreated,
    /// Usage row tier/limit repaired; `monthly_used` kept.
    TierCorrected { from: Tier, to: Tier },
    /// Period rolled over and usage zeroed.
    PeriodReset {
        previous_used: u32,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
}

/// Usage row after a consistency pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ResolvedUsage {
    pub usage: UsageLimitRecord,
    pub actions: Vec<ResolveAction>,
    /// At least one write failed; `usage` holds the intended values.
    pub partial: bool,
}

impl ResolvedUsage {
    /// Whether the pass rolled the period over.
    #[must_use]
    pub fn was_reset(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, ResolveAction::PeriodReset { .. }))
    }
}

/// Both rows after a consistency pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ResolvedEntitlements {
    pub subscription: SubscriptionRecord,
    pub usage: ResolvedUsage,
}

/// Repairs the usage row against the subscription row.
pub struct TierConsistencyResolver<S: EntitlementStore> {
    store: S,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn EntitlementAuditLogger>,
}

impl<S: EntitlementStore> TierConsistencyResolver<S> {
    /// Create a resolver using the system clock.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Use a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send audit events to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn EntitlementAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Read the subscription row, creating the free default if it is absent.
    ///
    /// # Errors
    ///
    /// Fails only if the read fails. A failed insert is logged and the
    /// in-memory default is returned.
    pub async fn read_or_create_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<(SubscriptionRecord, bool)> {
        if let Some(existing) = self.store.read_subscription(user_id).await? {
            return Ok((existing, false));
        }

        let now = self.clock.now();
        match self.store.insert_default_subscription(user_id, now).await {
            Ok(created) => {
                tracing::debug!(
                    target: "hireboard::billing",
                    user_id = %user_id,
                    "Created default subscription row"
                );
                Ok((created, true))
            }
            Err(e) => {
                tracing::warn!(
                    target: "hireboard::billing",
                    user_id = %user_id,
                    table = SUBSCRIPTION_TABLE,
                    error = %e,
                    "Default subscription insert failed, using in-memory default"
                );
                Ok((SubscriptionRecord::free(now), true))
            }
        }
    }

    /// Load the subscription row and bring the usage row in line with it.
    pub async fn resolve_for(&self, user_id: &str) -> BillingResult<ResolvedEntitlements> {
        let (subscription, created) = self.read_or_create_subscription(user_id).await?;
        let mut usage = self.resolve(user_id, &subscription).await?;
        if created {
            usage.actions.insert(0, ResolveAction::SubscriptionCreated);
        }
        Ok(ResolvedEntitlements {
            subscription,
            usage,
        })
    }

    /// Bring the usage row in line with a known-fresh subscription row.
    ///
    /// # Errors
    ///
    /// Fails only if the usage row cannot be read.
    pub async fn resolve(
        &self,
        user_id: &str,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<ResolvedUsage> {
        let now = self.clock.now();
        let tier = subscription.tier;
        let expected_limit = limit_for_tier(tier);
        let mut actions = Vec::new();
        let mut partial = false;

        let Some(mut usage) = self.store.read_usage_limit(user_id).await? else {
            let (start, end) = initial_window(subscription, now);
            let usage = match self
                .store
                .insert_default_usage_limit(user_id, tier, start, end)
                .await
            {
                Ok(row) => row,
                Err(e) => {
                    self.log_partial(user_id, "insert", &e);
                    partial = true;
                    UsageLimitRecord::new(tier, start, end)
                }
            };
            actions.push(ResolveAction::UsageCreated);
            return Ok(ResolvedUsage {
                usage,
                actions,
                partial,
            });
        };

        if usage.tier != tier || usage.monthly_limit != expected_limit {
            let from = usage.tier;
            let patch = UsageLimitPatch::tier(tier);
            match self.store.write_usage_limit(user_id, &patch).await {
                Ok(Some(row)) => usage = row,
                Ok(None) => patch.apply(&mut usage),
                Err(e) => {
                    self.log_partial(user_id, "correct_tier", &e);
                    partial = true;
                    patch.apply(&mut usage);
                }
            }
            tracing::info!(
                target: "hireboard::billing",
                user_id = %user_id,
                from = %from,
                to = %tier,
                monthly_limit = expected_limit,
                monthly_used = usage.monthly_used,
                "Usage tier corrected"
            );
            self.audit
                .log(EntitlementAuditEvent::UsageTierCorrected {
                    user_id: user_id.to_string(),
                    from,
                    to: tier,
                    monthly_limit: expected_limit,
                })
                .await;
            actions.push(ResolveAction::TierCorrected { from, to: tier });
        }

        if usage.is_period_expired(now) {
            let previous_used = usage.monthly_used;
            let (start, end) = next_window(&usage, subscription, now);
            let patch = UsageLimitPatch::reset(start, end);
            match self.store.write_usage_limit(user_id, &patch).await {
                Ok(Some(row)) => usage = row,
                Ok(None) => patch.apply(&mut usage),
                Err(e) => {
                    self.log_partial(user_id, "reset_period", &e);
                    partial = true;
                    patch.apply(&mut usage);
                }
            }
            tracing::info!(
                target: "hireboard::billing",
                user_id = %user_id,
                previous_used,
                period_start = %start,
                period_end = %end,
                "Usage period rolled over"
            );
            self.audit
                .log(EntitlementAuditEvent::UsageReset {
                    user_id: user_id.to_string(),
                    previous_used,
                })
                .await;
            actions.push(ResolveAction::PeriodReset {
                previous_used,
                period_start: start,
                period_end: end,
            });
        }

        Ok(ResolvedUsage {
            usage,
            actions,
            partial,
        })
    }

    fn log_partial(&self, user_id: &str, operation: &str, error: &super::error::BillingError) {
        tracing::warn!(
            target: "hireboard::billing",
            user_id = %user_id,
            table = USAGE_LIMIT_TABLE,
            operation = operation,
            error = %error,
            "Usage row write failed, continuing with best-known values"
        );
    }
}

/// Window for a brand-new usage row.
fn initial_window(
    subscription: &SubscriptionRecord,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match subscription.expires_at {
        Some(end) if end > now => (now, end),
        _ => monthly_window(now),
    }
}

/// Window that follows an expired one.
///
/// Aligns to the billing authority's period end when it lies ahead;
/// otherwise steps the old window forward in whole months from its start
/// until it contains `now`. A stepped window that would open after `now`
/// falls back to a fresh month starting at `now`.
fn next_window(
    usage: &UsageLimitRecord,
    subscription: &SubscriptionRecord,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    if let Some(end) = subscription.expires_at.filter(|end| *end > now) {
        let start = end
            .checked_sub_months(Months::new(1))
            .map_or(now, |start| start.min(now));
        return (start, end);
    }

    let anchor = usage.period_start;
    for step in 1..MAX_PERIOD_STEPS {
        let (Some(start), Some(end)) = (
            anchor.checked_add_months(Months::new(step)),
            anchor.checked_add_months(Months::new(step + 1)),
        ) else {
            break;
        };
        if now <= end {
            if start > now {
                break;
            }
            return (start, end);
        }
    }
    monthly_window(now)
}
