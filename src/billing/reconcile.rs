//! Billing reconciliation.
//!
//! Folds the billing authority's answer into the cached subscription row.
//! The authority always wins for `tier`, `active` and `expires_at`. When the
//! authority cannot be reached the cached row is left untouched and stays
//! authoritative until the next successful pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::audit::{EntitlementAuditEvent, EntitlementAuditLogger, NoOpAuditLogger};
use super::check::{BillingAuthority, DEFAULT_CHECK_TIMEOUT};
use super::clock::{Clock, SystemClock};
use super::error::BillingError;
use super::identity::IdentityToken;
use super::storage::{BillingResult, EntitlementStore, SubscriptionRecord};
use super::tier::Tier;

/// Asks the billing authority for ground truth and writes it back.
pub struct BillingReconciler<S: EntitlementStore, A: BillingAuthority> {
    store: S,
    authority: A,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn EntitlementAuditLogger>,
    check_timeout: Duration,
}

impl<S: EntitlementStore, A: BillingAuthority> BillingReconciler<S, A> {
    /// Create a reconciler using the system clock.
    #[must_use]
    pub fn new(store: S, authority: A) -> Self {
        Self {
            store,
            authority,
            clock: Arc::new(SystemClock),
            audit: Arc::new(NoOpAuditLogger),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
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

    /// Bound the billing check by `timeout`.
    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Run one reconciliation pass for `user_id`.
    ///
    /// Idempotent: with no change on the authority side, repeated calls
    /// rewrite the same values and report no differences.
    ///
    /// # Errors
    ///
    /// Returns the billing check failure unchanged. Local state is not
    /// touched in that case.
    pub async fn reconcile(
        &self,
        user_id: &str,
        token: &IdentityToken,
    ) -> BillingResult<ReconcileReport> {
        let check = match tokio::time::timeout(self.check_timeout, self.authority.check(token)).await
        {
            Ok(Ok(check)) => check,
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "hireboard::billing::reconcile",
                    user_id = %user_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Billing check failed, keeping cached subscription"
                );
                return Err(e);
            }
            Err(_elapsed) => {
                tracing::warn!(
                    target: "hireboard::billing::reconcile",
                    user_id = %user_id,
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "Billing check timed out, keeping cached subscription"
                );
                return Err(BillingError::Timeout {
                    operation: "billing_check".to_string(),
                    after_ms: self.check_timeout.as_millis() as u64,
                });
            }
        };

        let now = self.clock.now();
        let current = check.to_record(now);

        // The cached row only feeds the diff; a failed read must not block the write-back.
        let previous = match self.store.read_subscription(user_id).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(
                    target: "hireboard::billing::reconcile",
                    user_id = %user_id,
                    error = %e,
                    "Could not read cached subscription before write-back"
                );
                None
            }
        };

        let differences = match &previous {
            Some(previous) => diff(previous, &current),
            None => vec![ReconcileDifference::NoLocalRecord],
        };

        let persisted = match self.store.write_subscription(user_id, &current).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    target: "hireboard::billing::reconcile",
                    user_id = %user_id,
                    error = %e,
                    "Subscription write-back failed, continuing with billing authority answer"
                );
                false
            }
        };

        tracing::debug!(
            target: "hireboard::billing::reconcile",
            user_id = %user_id,
            tier = %current.tier,
            active = current.active,
            changes = differences.len(),
            persisted,
            "Subscription reconciled"
        );

        self.audit
            .log(EntitlementAuditEvent::SubscriptionReconciled {
                user_id: user_id.to_string(),
                tier: current.tier,
                active: current.active,
                changes: differences.len(),
            })
            .await;

        Ok(ReconcileReport {
            user_id: user_id.to_string(),
            previous,
            current,
            differences,
            persisted,
        })
    }
}

fn diff(local: &SubscriptionRecord, remote: &SubscriptionRecord) -> Vec<ReconcileDifference> {
    let mut differences = Vec::new();

    if local.tier != remote.tier {
        differences.push(ReconcileDifference::Tier {
            local: local.tier,
            remote: remote.tier,
        });
    }

    if local.active != remote.active {
        differences.push(ReconcileDifference::Active {
            local: local.active,
            remote: remote.active,
        });
    }

    if local.expires_at != remote.expires_at {
        differences.push(ReconcileDifference::ExpiresAt {
            local: local.expires_at,
            remote: remote.expires_at,
        });
    }

    if local.external_ref != remote.external_ref {
        differences.push(ReconcileDifference::ExternalRef {
            local: local.external_ref.clone(),
            remote: remote.external_ref.clone(),
        });
    }

    differences
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ReconcileReport {
    pub user_id: String,
    /// Cached row before the pass, if it could be read.
    pub previous: Option<SubscriptionRecord>,
    /// Row as written back.
    pub current: SubscriptionRecord,
    /// Fields that changed.
    pub differences: Vec<ReconcileDifference>,
    /// Whether the write-back reached the store.
    pub persisted: bool,
}

impl ReconcileReport {
    /// Whether the cache already agreed with the billing authority.
    #[must_use]
    pub fn was_in_sync(&self) -> bool {
        self.differences.is_empty()
    }

    /// Whether the pass changed the tier.
    #[must_use]
    pub fn tier_changed(&self) -> bool {
        self.differences
            .iter()
            .any(|d| matches!(d, ReconcileDifference::Tier { .. } | ReconcileDifference::NoLocalRecord))
    }
}

/// A specific difference between the cached and authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileDifference {
    /// No cached row existed (or it could not be read).
    NoLocalRecord,
    Tier { local: Tier, remote: Tier },
    Active { local: bool, remote: bool },
    ExpiresAt {
        local: Option<DateTime<Utc>>,
        remote: Option<DateTime<Utc>>,
    },
    ExternalRef {
        local: Option<String>,
        remote: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::TestAuditLogger;
    use crate::billing::check::test::MockBillingAuthority;
    use crate::billing::check::BillingCheck;
    use crate::billing::clock::ManualClock;
    use crate::billing::storage::test::FlakyStore;
    use crate::billing::storage::MemoryEntitlementStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
    }

    fn token() -> IdentityToken {
        IdentityToken::new("token")
    }

    fn reconciler(
        store: MemoryEntitlementStore,
        authority: MockBillingAuthority,
    ) -> BillingReconciler<MemoryEntitlementStore, MockBillingAuthority> {
        BillingReconciler::new(store, authority).with_clock(Arc::new(ManualClock::new(t0())))
    }

    #[tokio::test]
    async fn test_authority_overwrites_cache() {
        let store = MemoryEntitlementStore::new();
        let mut cached = SubscriptionRecord::free(t0());
        cached.tier = Tier::Basic;
        cached.active = true;
        store.seed_subscription("u1", cached);

        let period_end = t0() + chrono::Duration::days(20);
        let authority = MockBillingAuthority::always(Ok(BillingCheck::subscribed(
            Tier::Premium,
            Some(period_end),
        )
        .with_external_ref("sub_9")));

        let report = reconciler(store.clone(), authority)
            .reconcile("u1", &token())
            .await
            .unwrap();

        assert!(report.persisted);
        assert!(report.tier_changed());
        assert!(report.differences.contains(&ReconcileDifference::Tier {
            local: Tier::Basic,
            remote: Tier::Premium,
        }));
        let stored = store.subscription("u1").unwrap();
        assert_eq!(stored.tier, Tier::Premium);
        assert_eq!(stored.expires_at, Some(period_end));
        assert_eq!(stored.external_ref.as_deref(), Some("sub_9"));
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let store = MemoryEntitlementStore::new();
        let mut cached = SubscriptionRecord::free(t0());
        cached.tier = Tier::Standard;
        cached.active = true;
        store.seed_subscription("u1", cached.clone());

        let authority = MockBillingAuthority::always(Err(BillingError::BillingCheckFailed {
            message: "bad gateway".to_string(),
            http_status: Some(502),
        }));

        let err = reconciler(store.clone(), authority)
            .reconcile("u1", &token())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(store.subscription("u1"), Some(cached));
    }

    #[tokio::test]
    async fn test_repeat_pass_is_in_sync() {
        let store = MemoryEntitlementStore::new();
        let authority = MockBillingAuthority::always(Ok(BillingCheck::subscribed(Tier::Basic, None)));
        let reconciler = reconciler(store.clone(), authority);

        let first = reconciler.reconcile("u1", &token()).await.unwrap();
        assert_eq!(first.differences, vec![ReconcileDifference::NoLocalRecord]);

        let second = reconciler.reconcile("u1", &token()).await.unwrap();
        assert!(second.was_in_sync());
        assert_eq!(second.current, first.current);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_authority_times_out() {
        let store = MemoryEntitlementStore::new();
        let authority = MockBillingAuthority::always(Ok(BillingCheck::unsubscribed()))
            .with_delay(Duration::from_secs(60));

        let err = reconciler(store.clone(), authority)
            .with_check_timeout(Duration::from_secs(10))
            .reconcile("u1", &token())
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Timeout { after_ms: 10_000, .. }));
        assert!(store.subscription("u1").is_none());
    }

    #[tokio::test]
    async fn test_write_failure_still_reports_truth() {
        let flaky = FlakyStore::default();
        flaky.fail_subscription_writes(true);
        let audit = TestAuditLogger::new();
        let authority =
            MockBillingAuthority::always(Ok(BillingCheck::subscribed(Tier::Standard, None)));

        let report = BillingReconciler::new(flaky.clone(), authority)
            .with_clock(Arc::new(ManualClock::new(t0())))
            .with_audit(Arc::new(audit.clone()))
            .reconcile("u1", &token())
            .await
            .unwrap();

        assert!(!report.persisted);
        assert_eq!(report.current.tier, Tier::Standard);
        assert!(flaky.inner.subscription("u1").is_none());
        assert_eq!(audit.kinds().await, vec!["subscription_reconciled"]);
    }
}
