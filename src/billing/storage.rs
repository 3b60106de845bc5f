//! Storage traits for entitlement data.
//!
//! Two remote tables back the subsystem: a cached subscription record and a
//! usage-limit record, both keyed by user id. Implement [`EntitlementStore`]
//! against your backend; [`MemoryEntitlementStore`] is provided for
//! development and tests.
//!
//! Absence and failure are different answers. A missing row is `Ok(None)` and
//! leads to default-row creation; a failed query is `Err(..)` and must surface
//! as a retryable error.

use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use super::error::BillingError;
use super::tier::{limit_for_tier, Tier};

/// Result type for billing operations.
pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Name of the subscription table.
pub const SUBSCRIPTION_TABLE: &str = "subscription";
/// Name of the usage-limit table.
pub const USAGE_LIMIT_TABLE: &str = "usage_limit";

/// Cached subscription state, one row per identity.
///
/// Overwritten with the billing authority's answer on every successful
/// reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    /// Plan level.
    pub tier: Tier,
    /// Whether the billing authority considered the subscription live at the
    /// last reconciliation.
    pub active: bool,
    /// End of the current billing period.
    pub expires_at: Option<DateTime<Utc>>,
    /// Billing-authority subscription or customer id.
    pub external_ref: Option<String>,
    /// Last write-back time.
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Default row created for an identity seen for the first time.
    #[must_use]
    pub fn free(now: DateTime<Utc>) -> Self {
        Self {
            tier: Tier::Free,
            active: false,
            expires_at: None,
            external_ref: None,
            updated_at: now,
        }
    }

    /// Whether the stored period end has already passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|end| end < now)
    }

    /// Whether the subscription is live at `now`.
    ///
    /// A stored `active = true` with a past expiry is stale and reads as
    /// inactive. The row itself is left alone until the next reconciliation.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    /// Tier used for gating: the stored tier while active, free otherwise.
    #[must_use]
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.is_active_at(now) {
            self.tier
        } else {
            Tier::Free
        }
    }
}

/// Monthly usage counter, one row per identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageLimitRecord {
    /// Mirror of [`SubscriptionRecord::tier`]. May drift until reconciled.
    pub tier: Tier,
    /// Posts allowed in the current period.
    pub monthly_limit: u32,
    /// Posts made in the current period.
    pub monthly_used: u32,
    /// Start of the current billing window.
    pub period_start: DateTime<Utc>,
    /// End of the current billing window.
    pub period_end: DateTime<Utc>,
}

impl UsageLimitRecord {
    /// Fresh row for `tier` with a one-month window starting at `period_start`.
    #[must_use]
    pub fn new(tier: Tier, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self {
            tier,
            monthly_limit: limit_for_tier(tier),
            monthly_used: 0,
            period_start,
            period_end,
        }
    }

    /// Whether `now` is past the end of the stored window.
    #[must_use]
    pub fn is_period_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.period_end
    }

    /// Whether another post fits in the current period.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.monthly_used < self.monthly_limit
    }

    /// Posts left in the current period.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.monthly_limit.saturating_sub(self.monthly_used)
    }

    /// Whether tier and limit agree with `tier`.
    #[must_use]
    pub fn matches_tier(&self, tier: Tier) -> bool {
        self.tier == tier && self.monthly_limit == limit_for_tier(tier)
    }
}

/// Partial update of a usage-limit row.
///
/// Only the fields that are `Some` are written, so a tier correction never
/// clobbers a concurrent increment of `monthly_used`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLimitPatch {
    pub tier: Option<Tier>,
    pub monthly_limit: Option<u32>,
    pub monthly_used: Option<u32>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl UsageLimitPatch {
    /// Patch that sets tier and the matching limit.
    #[must_use]
    pub fn tier(tier: Tier) -> Self {
        Self {
            tier: Some(tier),
            monthly_limit: Some(limit_for_tier(tier)),
            ..Self::default()
        }
    }

    /// Patch that zeroes usage and moves the window.
    #[must_use]
    pub fn reset(period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self {
            monthly_used: Some(0),
            period_start: Some(period_start),
            period_end: Some(period_end),
            ..Self::default()
        }
    }

    /// Whether this patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the patch to a record in place.
    pub fn apply(&self, record: &mut UsageLimitRecord) {
        if let Some(tier) = self.tier {
            record.tier = tier;
        }
        if let Some(limit) = self.monthly_limit {
            record.monthly_limit = limit;
        }
        if let Some(used) = self.monthly_used {
            record.monthly_used = used;
        }
        if let Some(start) = self.period_start {
            record.period_start = start;
        }
        if let Some(end) = self.period_end {
            record.period_end = end;
        }
    }
}

/// Outcome of trying to reserve one unit of usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageReservation {
    /// Usage was incremented; carries the new count.
    Reserved { used: u32 },
    /// The counter is already at or above the limit.
    LimitReached { used: u32, limit: u32 },
    /// No usage row exists for this identity.
    Missing,
}

/// Default one-month window starting at `start`.
#[must_use]
pub fn monthly_window(start: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + chrono::Duration::days(30));
    (start, end)
}

/// Trait for the remote entitlement tables.
///
/// All methods are scoped to a single identity. Implementations may fail
/// transiently; report those failures as [`BillingError::StoreUnavailable`].
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Read the cached subscription row.
    async fn read_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    /// Read the usage-limit row.
    async fn read_usage_limit(&self, user_id: &str) -> BillingResult<Option<UsageLimitRecord>>;

    /// Upsert the subscription row.
    async fn write_subscription(
        &self,
        user_id: &str,
        record: &SubscriptionRecord,
    ) -> BillingResult<()>;

    /// Apply a partial update to the usage-limit row.
    ///
    /// Returns the updated row, or `None` if the row does not exist.
    async fn write_usage_limit(
        &self,
        user_id: &str,
        patch: &UsageLimitPatch,
    ) -> BillingResult<Option<UsageLimitRecord>>;

    /// Insert a fresh usage-limit row for `tier`.
    async fn insert_default_usage_limit(
        &self,
        user_id: &str,
        tier: Tier,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<UsageLimitRecord>;

    /// Insert the default free subscription row.
    async fn insert_default_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionRecord> {
        let record = SubscriptionRecord::free(now);
        self.write_subscription(user_id, &record).await?;
        Ok(record)
    }

    /// Add one to `monthly_used`.
    ///
    /// Returns the new count, or `None` if the row does not exist.
    ///
    /// # Important: Stores With Atomic Counters Should Override This
    ///
    /// The default implementation reads then writes and can lose an increment
    /// when two sessions post at the same moment. That overshoot is accepted
    /// by the posting gate, but a backend that offers an atomic increment
    /// (`UPDATE .. SET monthly_used = monthly_used + 1 RETURNING ..`) should
    /// use it here.
    async fn increment_usage(&self, user_id: &str) -> BillingResult<Option<u32>> {
        warn_non_atomic_once();
        let Some(current) = self.read_usage_limit(user_id).await? else {
            return Ok(None);
        };
        let patch = UsageLimitPatch {
            monthly_used: Some(current.monthly_used.saturating_add(1)),
            ..UsageLimitPatch::default()
        };
        Ok(self
            .write_usage_limit(user_id, &patch)
            .await?
            .map(|row| row.monthly_used))
    }

    /// Increment `monthly_used` only if it is below `limit`.
    ///
    /// Same caveat as [`increment_usage`](Self::increment_usage): the default
    /// is check-then-act.
    async fn try_reserve_usage(&self, user_id: &str, limit: u32) -> BillingResult<UsageReservation> {
        warn_non_atomic_once();
        let Some(current) = self.read_usage_limit(user_id).await? else {
            return Ok(UsageReservation::Missing);
        };
        if current.monthly_used >= limit {
            return Ok(UsageReservation::LimitReached {
                used: current.monthly_used,
                limit,
            });
        }
        let patch = UsageLimitPatch {
            monthly_used: Some(current.monthly_used + 1),
            ..UsageLimitPatch::default()
        };
        match self.write_usage_limit(user_id, &patch).await? {
            Some(row) => Ok(UsageReservation::Reserved {
                used: row.monthly_used,
            }),
            None => Ok(UsageReservation::Missing),
        }
    }

    /// Give back one unit of usage taken by [`try_reserve_usage`](Self::try_reserve_usage).
    async fn release_usage(&self, user_id: &str) -> BillingResult<()> {
        warn_non_atomic_once();
        if let Some(current) = self.read_usage_limit(user_id).await? {
            let patch = UsageLimitPatch {
                monthly_used: Some(current.monthly_used.saturating_sub(1)),
                ..UsageLimitPatch::default()
            };
            self.write_usage_limit(user_id, &patch).await?;
        }
        Ok(())
    }
}

fn warn_non_atomic_once() {
    #[cfg(debug_assertions)]
    {
        static WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            tracing::warn!(
                target: "hireboard::billing",
                "Using default non-atomic usage counter implementation. \
                 Concurrent posts may overshoot the monthly limit. \
                 Override increment_usage/try_reserve_usage with an atomic update if the store supports it."
            );
        }
    }
}

/// Store wrapper that bounds every call with a client-side timeout.
///
/// A call that does not resolve in time fails with
/// [`BillingError::Timeout`], which is retryable.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    limit: std::time::Duration,
}

impl<S: EntitlementStore> TimeoutStore<S> {
    /// Wrap `inner`, failing any call that takes longer than `limit`.
    pub fn new(inner: S, limit: std::time::Duration) -> Self {
        Self { inner, limit }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        table: &str,
        operation: &str,
        fut: impl std::future::Future<Output = BillingResult<T>> + Send,
    ) -> BillingResult<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    target: "hireboard::billing",
                    table = table,
                    operation = operation,
                    timeout_ms = self.limit.as_millis() as u64,
                    "Store call timed out"
                );
                Err(BillingError::Timeout {
                    operation: format!("{}.{}", table, operation),
                    after_ms: self.limit.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl<S: EntitlementStore> EntitlementStore for TimeoutStore<S> {
    async fn read_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.bounded(SUBSCRIPTION_TABLE, "read", self.inner.read_subscription(user_id))
            .await
    }

    async fn read_usage_limit(&self, user_id: &str) -> BillingResult<Option<UsageLimitRecord>> {
        self.bounded(USAGE_LIMIT_TABLE, "read", self.inner.read_usage_limit(user_id))
            .await
    }

    async fn write_subscription(
        &self,
        user_id: &str,
        record: &SubscriptionRecord,
    ) -> BillingResult<()> {
        self.bounded(
            SUBSCRIPTION_TABLE,
            "write",
            self.inner.write_subscription(user_id, record),
        )
        .await
    }

    async fn write_usage_limit(
        &self,
        user_id: &str,
        patch: &UsageLimitPatch,
    ) -> BillingResult<Option<UsageLimitRecord>> {
        self.bounded(
            USAGE_LIMIT_TABLE,
            "write",
            self.inner.write_usage_limit(user_id, patch),
        )
        .await
    }

    async fn insert_default_usage_limit(
        &self,
        user_id: &str,
        tier: Tier,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<UsageLimitRecord> {
        self.bounded(
            USAGE_LIMIT_TABLE,
            "insert",
            self.inner
                .insert_default_usage_limit(user_id, tier, period_start, period_end),
        )
        .await
    }

    async fn insert_default_subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionRecord> {
        self.bounded(
            SUBSCRIPTION_TABLE,
            "insert",
            self.inner.insert_default_subscription(user_id, now),
        )
        .await
    }

    async fn increment_usage(&self, user_id: &str) -> BillingResult<Option<u32>> {
        self.bounded(USAGE_LIMIT_TABLE, "increment", self.inner.increment_usage(user_id))
            .await
    }

    async fn try_reserve_usage(&self, user_id: &str, limit: u32) -> BillingResult<UsageReservation> {
        self.bounded(
            USAGE_LIMIT_TABLE,
            "reserve",
            self.inner.try_reserve_usage(user_id, limit),
        )
        .await
    }

    async fn release_usage(&self, user_id: &str) -> BillingResult<()> {
        self.bounded(USAGE_LIMIT_TABLE, "release", self.inner.release_usage(user_id))
            .await
    }
}

/// In-memory entitlement store.
///
/// Wraps data in Arc for cheap cloning; clones share the same tables. Counter
/// operations run under a single write lock and are atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryEntitlementStore {
    inner: std::sync::Arc<MemoryEntitlementStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryEntitlementStoreInner {
    subscriptions: std::sync::RwLock<std::collections::HashMap<String, SubscriptionRecord>>,
    usage_limits: std::sync::RwLock<std::collections::HashMap<String, UsageLimitRecord>>,
}

impl MemoryEntitlementStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a subscription row.
    pub fn seed_subscription(&self, user_id: &str, record: SubscriptionRecord) {
        self.subscriptions_mut().insert(user_id.to_string(), record);
    }

    /// Seed a usage-limit row.
    pub fn seed_usage_limit(&self, user_id: &str, record: UsageLimitRecord) {
        self.usage_limits_mut().insert(user_id.to_string(), record);
    }

    /// Snapshot of a subscription row.
    #[must_use]
    pub fn subscription(&self, user_id: &str) -> Option<SubscriptionRecord> {
        self.subscriptions().get(user_id).cloned()
    }

    /// Snapshot of a usage-limit row.
    #[must_use]
    pub fn usage_limit(&self, user_id: &str) -> Option<UsageLimitRecord> {
        self.usage_limits().get(user_id).cloned()
    }

    fn subscriptions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, std::collections::HashMap<String, SubscriptionRecord>> {
        self.inner.subscriptions.read().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "hireboard::billing", "Subscription table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn subscriptions_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, std::collections::HashMap<String, SubscriptionRecord>> {
        self.inner.subscriptions.write().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "hireboard::billing", "Subscription table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn usage_limits(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, std::collections::HashMap<String, UsageLimitRecord>> {
        self.inner.usage_limits.read().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "hireboard::billing", "Usage table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn usage_limits_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, std::collections::HashMap<String, UsageLimitRecord>> {
        self.inner.usage_limits.write().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "hireboard::billing", "Usage table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn read_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscription(user_id))
    }

    async fn read_usage_limit(&self, user_id: &str) -> BillingResult<Option<UsageLimitRecord>> {
        Ok(self.usage_limit(user_id))
    }

    async fn write_subscription(
        &self,
        user_id: &str,
        record: &SubscriptionRecord,
    ) -> BillingResult<()> {
        self.subscriptions_mut()
            .insert(user_id.to_string(), record.clone());
        Ok(())
    }

    async fn write_usage_limit(
        &self,
        user_id: &str,
        patch: &UsageLimitPatch,
    ) -> BillingResult<Option<UsageLimitRecord>> {
        let mut rows = self.usage_limits_mut();
        Ok(rows.get_mut(user_id).map(|row| {
            patch.apply(row);
            row.clone()
        }))
    }

    async fn insert_default_usage_limit(
        &self,
        user_id: &str,
        tier: Tier,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<UsageLimitRecord> {
        let mut rows = self.usage_limits_mut();
        // Another session may have created the row in the meantime; keep its counter.
        let row = rows
            .entry(user_id.to_string())
            .or_insert_with(|| UsageLimitRecord::new(tier, period_start, period_end));
        Ok(row.clone())
    }

    async fn increment_usage(&self, user_id: &str) -> BillingResult<Option<u32>> {
        let mut rows = self.usage_limits_mut();
        Ok(rows.get_mut(user_id).map(|row| {
            row.monthly_used = row.monthly_used.saturating_add(1);
            row.monthly_used
        }))
    }

    async fn try_reserve_usage(&self, user_id: &str, limit: u32) -> BillingResult<UsageReservation> {
        let mut rows = self.usage_limits_mut();
        let Some(row) = rows.get_mut(user_id) else {
            return Ok(UsageReservation::Missing);
        };
        if row.monthly_used >= limit {
            return Ok(UsageReservation::LimitReached {
                used: row.monthly_used,
                limit,
            });
        }
        row.monthly_used += 1;
        Ok(UsageReservation::Reserved {
            used: row.monthly_used,
        })
    }

    async fn release_usage(&self, user_id: &str) -> BillingResult<()> {
        if let Some(row) = self.usage_limits_mut().get_mut(user_id) {
            row.monthly_used = row.monthly_used.saturating_sub(1);
        }
        Ok(())
    }
}

/// Failure-injecting store for tests.
#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps a [`MemoryEntitlementStore`] and fails selected operations on demand.
    #[derive(Default, Clone)]
    pub struct FlakyStore {
        pub inner: MemoryEntitlementStore,
        flags: Arc<Flags>,
    }

    #[derive(Default)]
    struct Flags {
        fail_subscription_reads: AtomicBool,
        fail_subscription_writes: AtomicBool,
        fail_usage_reads: AtomicBool,
        fail_usage_writes: AtomicBool,
        subscription_writes: AtomicUsize,
        usage_writes: AtomicUsize,
        read_delay_ms: AtomicU64,
    }

    impl FlakyStore {
        pub fn new(inner: MemoryEntitlementStore) -> Self {
            Self {
                inner,
                flags: Arc::default(),
            }
        }

        pub fn fail_subscription_reads(&self, fail: bool) {
            self.flags.fail_subscription_reads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_subscription_writes(&self, fail: bool) {
            self.flags.fail_subscription_writes.store(fail, Ordering::SeqCst);
        }

        pub fn fail_usage_reads(&self, fail: bool) {
            self.flags.fail_usage_reads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_usage_writes(&self, fail: bool) {
            self.flags.fail_usage_writes.store(fail, Ordering::SeqCst);
        }

        /// Make every read sleep for `delay` before answering.
        pub fn delay_reads(&self, delay: std::time::Duration) {
            self.flags
                .read_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        async fn read_delay(&self) {
            let ms = self.flags.read_delay_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
        }

        pub fn subscription_writes(&self) -> usize {
            self.flags.subscription_writes.load(Ordering::SeqCst)
        }

        pub fn usage_writes(&self) -> usize {
            self.flags.usage_writes.load(Ordering::SeqCst)
        }

        fn check(&self, flag: &AtomicBool, table: &str, operation: &str) -> BillingResult<()> {
            if flag.load(Ordering::SeqCst) {
                Err(BillingError::store(table, operation, "injected failure"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EntitlementStore for FlakyStore {
        async fn read_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
            self.check(&self.flags.fail_subscription_reads, SUBSCRIPTION_TABLE, "read")?;
            self.read_delay().await;
            self.inner.read_subscription(user_id).await
        }

        async fn read_usage_limit(&self, user_id: &str) -> BillingResult<Option<UsageLimitRecord>> {
            self.check(&self.flags.fail_usage_reads, USAGE_LIMIT_TABLE, "read")?;
            self.read_delay().await;
            self.inner.read_usage_limit(user_id).await
        }

        async fn write_subscription(
            &self,
            user_id: &str,
            record: &SubscriptionRecord,
        ) -> BillingResult<()> {
            self.check(&self.flags.fail_subscription_writes, SUBSCRIPTION_TABLE, "write")?;
            self.flags.subscription_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write_subscription(user_id, record).await
        }

        async fn write_usage_limit(
            &self,
            user_id: &str,
            patch: &UsageLimitPatch,
        ) -> BillingResult<Option<UsageLimitRecord>> {
            self.check(&self.flags.fail_usage_writes, USAGE_LIMIT_TABLE, "write")?;
            self.flags.usage_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write_usage_limit(user_id, patch).await
        }

        async fn insert_default_usage_limit(
            &self,
            user_id: &str,
            tier: Tier,
            period_start: DateTime<Utc>,
            period_end: DateTime<Utc>,
        ) -> BillingResult<UsageLimitRecord> {
            self.check(&self.flags.fail_usage_writes, USAGE_LIMIT_TABLE, "insert")?;
            self.flags.usage_writes.fetch_add(1, Ordering::SeqCst);
            self.inner
                .insert_default_usage_limit(user_id, tier, period_start, period_end)
                .await
        }

        async fn increment_usage(&self, user_id: &str) -> BillingResult<Option<u32>> {
            self.check(&self.flags.fail_usage_writes, USAGE_LIMIT_TABLE, "increment")?;
            self.flags.usage_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.increment_usage(user_id).await
        }

        async fn try_reserve_usage(&self, user_id: &str, limit: u32) -> BillingResult<UsageReservation> {
            self.check(&self.flags.fail_usage_writes, USAGE_LIMIT_TABLE, "reserve")?;
            self.inner.try_reserve_usage(user_id, limit).await
        }

        async fn release_usage(&self, user_id: &str) -> BillingResult<()> {
            self.check(&self.flags.fail_usage_writes, USAGE_LIMIT_TABLE, "release")?;
            self.inner.release_usage(user_id).await
        }
    }

    /// Store that only implements the required methods, to exercise the
    /// trait's default counter implementations.
    #[derive(Default, Clone)]
    pub struct PlainStore {
        pub inner: MemoryEntitlementStore,
    }

    #[async_trait]
    impl EntitlementStore for PlainStore {
        async fn read_subscription(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
            self.inner.read_subscription(user_id).await
        }

        async fn read_usage_limit(&self, user_id: &str) -> BillingResult<Option<UsageLimitRecord>> {
            self.inner.read_usage_limit(user_id).await
        }

        async fn write_subscription(
            &self,
            user_id: &str,
            record: &SubscriptionRecord,
        ) -> BillingResult<()> {
            self.inner.write_subscription(user_id, record).await
        }

        async fn write_usage_limit(
            &self,
            user_id: &str,
            patch: &UsageLimitPatch,
        ) -> BillingResult<Option<UsageLimitRecord>> {
            self.inner.write_usage_limit(user_id, patch).await
        }

        async fn insert_default_usage_limit(
            &self,
            user_id: &str,
            tier: Tier,
            period_start: DateTime<Utc>,
            period_end: DateTime<Utc>,
        ) -> BillingResult<UsageLimitRecord> {
            self.inner
                .insert_default_usage_limit(user_id, tier, period_start, period_end)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::{FlakyStore, PlainStore};
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_expired_subscription_reads_inactive() {
        let mut sub = SubscriptionRecord::free(t0());
        sub.tier = Tier::Premium;
        sub.active = true;
        sub.expires_at = Some(t0() - chrono::Duration::days(1));

        assert!(sub.is_expired(t0()));
        assert!(!sub.is_active_at(t0()));
        assert_eq!(sub.effective_tier(t0()), Tier::Free);
        // The stored flag is untouched
        assert!(sub.active);
    }

    #[test]
    fn test_no_expiry_means_not_expired() {
        let mut sub = SubscriptionRecord::free(t0());
        sub.tier = Tier::Basic;
        sub.active = true;
        assert!(sub.is_active_at(t0()));
        assert_eq!(sub.effective_tier(t0()), Tier::Basic);
    }

    #[test]
    fn test_monthly_window_clamps_to_month_end() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let (_, end) = monthly_window(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_patch_only_touches_set_fields() {
        let (start, end) = monthly_window(t0());
        let mut row = UsageLimitRecord::new(Tier::Basic, start, end);
        row.monthly_used = 3;

        UsageLimitPatch::tier(Tier::Standard).apply(&mut row);
        assert_eq!(row.tier, Tier::Standard);
        assert_eq!(row.monthly_limit, 15);
        assert_eq!(row.monthly_used, 3);
        assert!(UsageLimitPatch::default().is_empty());
    }

    #[tokio::test]
    async fn test_absent_rows_are_none() {
        let store = MemoryEntitlementStore::new();
        assert!(store.read_subscription("nobody").await.unwrap().is_none());
        assert!(store.read_usage_limit("nobody").await.unwrap().is_none());
        assert!(store
            .write_usage_limit("nobody", &UsageLimitPatch::tier(Tier::Basic))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_insert_default_keeps_existing_row() {
        let store = MemoryEntitlementStore::new();
        let (start, end) = monthly_window(t0());
        let mut existing = UsageLimitRecord::new(Tier::Basic, start, end);
        existing.monthly_used = 4;
        store.seed_usage_limit("u1", existing.clone());

        let row = store
            .insert_default_usage_limit("u1", Tier::Free, start, end)
            .await
            .unwrap();
        assert_eq!(row, existing);
    }

    #[tokio::test]
    async fn test_reserve_stops_at_limit() {
        let store = MemoryEntitlementStore::new();
        let (start, end) = monthly_window(t0());
        store.seed_usage_limit("u1", UsageLimitRecord::new(Tier::Basic, start, end));

        for expected in 1..=5 {
            assert_eq!(
                store.try_reserve_usage("u1", 5).await.unwrap(),
                UsageReservation::Reserved { used: expected }
            );
        }
        assert_eq!(
            store.try_reserve_usage("u1", 5).await.unwrap(),
            UsageReservation::LimitReached { used: 5, limit: 5 }
        );

        store.release_usage("u1").await.unwrap();
        assert_eq!(store.usage_limit("u1").unwrap().monthly_used, 4);
        assert_eq!(
            store.try_reserve_usage("missing", 5).await.unwrap(),
            UsageReservation::Missing
        );
    }

    #[tokio::test]
    async fn test_default_counter_methods() {
        let store = PlainStore::default();
        let (start, end) = monthly_window(t0());
        store
            .inner
            .seed_usage_limit("u1", UsageLimitRecord::new(Tier::Single, start, end));

        assert_eq!(store.increment_usage("u1").await.unwrap(), Some(1));
        assert_eq!(
            store.try_reserve_usage("u1", 1).await.unwrap(),
            UsageReservation::LimitReached { used: 1, limit: 1 }
        );
        store.release_usage("u1").await.unwrap();
        assert_eq!(
            store.try_reserve_usage("u1", 1).await.unwrap(),
            UsageReservation::Reserved { used: 1 }
        );
        assert_eq!(store.increment_usage("missing").await.unwrap(), None);

        let sub = store.insert_default_subscription("u2", t0()).await.unwrap();
        assert_eq!(sub, SubscriptionRecord::free(t0()));
        assert_eq!(store.inner.subscription("u2"), Some(sub));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_store_turns_hangs_into_retryable_errors() {
        let flaky = FlakyStore::default();
        flaky.delay_reads(std::time::Duration::from_secs(30));
        let store = TimeoutStore::new(flaky.clone(), std::time::Duration::from_secs(10));

        let err = store.read_usage_limit("u1").await.unwrap_err();
        assert_eq!(
            err,
            BillingError::Timeout {
                operation: "usage_limit.read".to_string(),
                after_ms: 10_000,
            }
        );
        assert!(err.is_retryable());

        flaky.delay_reads(std::time::Duration::ZERO);
        assert!(store.read_usage_limit("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_error_is_not_absence() {
        let flaky = FlakyStore::default();
        flaky.fail_subscription_reads(true);
        let err = flaky.read_subscription("u1").await.unwrap_err();
        assert!(matches!(err, BillingError::StoreUnavailable { .. }));
    }
}
