//! Entitlements orchestration.
//!
//! [`EntitlementsService`] wires the pieces together for one session:
//! the scheduler decides when to refresh, the reconciler fetches ground
//! truth, the resolver repairs the usage row, the projector computes the
//! bundle, and the latest bundle is published on a watch channel.
//!
//! Failures never replace the published bundle with `free`. A failed refresh
//! keeps the last known bundle and records the error next to it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EntitlementsConfig;

use super::audit::{EntitlementAuditEvent, EntitlementAuditLogger, NoOpAuditLogger};
use super::check::BillingAuthority;
use super::clock::{Clock, SystemClock};
use super::consistency::TierConsistencyResolver;
use super::entitlements::FeatureEntitlementBundle;
use super::error::BillingError;
use super::gate::{PostDecision, PostOutcome, PostingLimitGate};
use super::identity::{Identity, IdentityProvider, Session};
use super::reconcile::{BillingReconciler, ReconcileReport};
use super::scheduler::{
    strip_markers, PaymentReturnMarker, RefreshDecision, RefreshPolicy, RefreshScheduler,
    RefreshState, RefreshTicket, RefreshTrigger,
};
use super::storage::{BillingResult, EntitlementStore, TimeoutStore, UsageLimitRecord};

/// Shortest wait between re-checks of a pending delayed refresh.
const MIN_REPOLL_DELAY: Duration = Duration::from_millis(10);

/// Latest published entitlements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementsSnapshot {
    /// Identity the bundle belongs to. `None` when signed out.
    pub user_id: Option<String>,
    pub bundle: FeatureEntitlementBundle,
    /// A fetch is in flight.
    pub loading: bool,
    /// Error from the last refresh, cleared on success.
    pub last_error: Option<BillingError>,
    /// When the bundle was last computed from fresh data.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl EntitlementsSnapshot {
    fn signed_out() -> Self {
        Self::empty(None)
    }

    fn empty(user_id: Option<String>) -> Self {
        Self {
            user_id,
            bundle: FeatureEntitlementBundle::free(),
            loading: false,
            last_error: None,
            refreshed_at: None,
        }
    }

    /// Whether the bundle is from cache after a failed refresh.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.last_error.is_some()
    }
}

/// What a refresh request led to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum RefreshOutcome {
    /// Fresh data was fetched and published.
    Refreshed {
        bundle: FeatureEntitlementBundle,
        report: ReconcileReport,
        /// A usage-row write failed during the pass.
        partial: bool,
    },
    /// Throttled; a fetch will run after the delay.
    Scheduled { after: Duration },
    /// Folded into a fetch already in flight or pending.
    Coalesced,
    /// The payment-return token was already handled.
    Duplicate,
    /// The result arrived after unmount or an identity change and was dropped.
    Discarded,
    /// Nobody is signed in; the free bundle is published.
    SignedOut,
}

/// Result of inspecting a navigation URL.
#[derive(Debug)]
pub struct NavigationOutcome {
    pub marker: Option<PaymentReturnMarker>,
    /// URL with markers removed; `None` if there was nothing to strip.
    pub stripped_url: Option<url::Url>,
    /// Refresh triggered by the marker.
    pub refresh: Option<BillingResult<RefreshOutcome>>,
}

struct ServiceInner<S, A, I>
where
    S: EntitlementStore + Clone + 'static,
    A: BillingAuthority + 'static,
    I: IdentityProvider + 'static,
{
    identity: I,
    reconciler: BillingReconciler<TimeoutStore<S>, A>,
    resolver: TierConsistencyResolver<TimeoutStore<S>>,
    gate: PostingLimitGate<TimeoutStore<S>>,
    scheduler: Mutex<RefreshScheduler>,
    snapshot: watch::Sender<EntitlementsSnapshot>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn EntitlementAuditLogger>,
    poll_interval: Duration,
}

/// Session-level entitlements service.
///
/// Cheap to clone; clones share the same state.
pub struct EntitlementsService<S, A, I>
where
    S: EntitlementStore + Clone + 'static,
    A: BillingAuthority + 'static,
    I: IdentityProvider + 'static,
{
    inner: Arc<ServiceInner<S, A, I>>,
}

impl<S, A, I> Clone for EntitlementsService<S, A, I>
where
    S: EntitlementStore + Clone + 'static,
    A: BillingAuthority + 'static,
    I: IdentityProvider + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`EntitlementsService`].
#[must_use = "builder does nothing until you call build()"]
pub struct EntitlementsServiceBuilder<S, A, I> {
    store: S,
    authority: A,
    identity: I,
    config: EntitlementsConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn EntitlementAuditLogger>,
}

impl<S, A, I> EntitlementsServiceBuilder<S, A, I>
where
    S: EntitlementStore + Clone + 'static,
    A: BillingAuthority + 'static,
    I: IdentityProvider + 'static,
{
    pub fn config(mut self, config: EntitlementsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn EntitlementAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> EntitlementsService<S, A, I> {
        let store = TimeoutStore::new(self.store, self.config.request_timeout());
        let (snapshot, _) = watch::channel(EntitlementsSnapshot::signed_out());
        let (shutdown, _) = watch::channel(false);

        let inner = ServiceInner {
            identity: self.identity,
            reconciler: BillingReconciler::new(store.clone(), self.authority)
                .with_clock(self.clock.clone())
                .with_audit(self.audit.clone())
                .with_check_timeout(self.config.request_timeout()),
            resolver: TierConsistencyResolver::new(store.clone())
                .with_clock(self.clock.clone())
                .with_audit(self.audit.clone()),
            gate: PostingLimitGate::new(store)
                .with_clock(self.clock.clone())
                .with_audit(self.audit.clone()),
            scheduler: Mutex::new(RefreshScheduler::new(
                self.clock.clone(),
                RefreshPolicy::from(&self.config),
            )),
            snapshot,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            clock: self.clock,
            audit: self.audit,
            poll_interval: self.config.poll_interval(),
        };

        EntitlementsService {
            inner: Arc::new(inner),
        }
    }
}

impl<S, A, I> EntitlementsService<S, A, I>
where
    S: EntitlementStore + Clone + 'static,
    A: BillingAuthority + 'static,
    I: IdentityProvider + 'static,
{
    /// Start building a service.
    pub fn builder(store: S, authority: A, identity: I) -> EntitlementsServiceBuilder<S, A, I> {
        EntitlementsServiceBuilder {
            store,
            authority,
            identity,
            config: EntitlementsConfig::default(),
            clock: Arc::new(SystemClock),
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> EntitlementsSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Current bundle.
    pub fn bundle(&self) -> FeatureEntitlementBundle {
        self.inner.snapshot.borrow().bundle.clone()
    }

    /// Watch snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<EntitlementsSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Force the initial reconciliation.
    pub async fn mount(&self) -> BillingResult<RefreshOutcome> {
        self.refresh(RefreshTrigger::Mount).await
    }

    /// Ask for a refresh. Throttled requests run later on a spawned task.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> BillingResult<RefreshOutcome> {
        let decision = self.scheduler().request(trigger);
        match decision {
            RefreshDecision::FetchNow(ticket) => self.run_fetch(ticket).await,
            RefreshDecision::Delay { after } => {
                let service = self.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    // The injected clock may lag the timer; wait out the remainder
                    loop {
                        let due = service.scheduler().poll_due();
                        if let Some(ticket) = due {
                            if let Err(e) = service.run_fetch(ticket).await {
                                tracing::debug!(
                                    target: "hireboard::billing::scheduler",
                                    error = %e,
                                    "Delayed refresh failed"
                                );
                            }
                            break;
                        }
                        let remaining = service.scheduler().pending_delay();
                        match remaining {
                            Some(delay) => {
                                tokio::time::sleep(delay.max(MIN_REPOLL_DELAY)).await;
                            }
                            // Cancelled by a forced refresh, unmount or identity change
                            None => break,
                        }
                    }
                });
                self.track(handle);
                Ok(RefreshOutcome::Scheduled { after })
            }
            RefreshDecision::Coalesced => Ok(RefreshOutcome::Coalesced),
            RefreshDecision::Duplicate => Ok(RefreshOutcome::Duplicate),
        }
    }

    /// Handle a navigation. Consumes payment-return markers exactly once.
    pub async fn handle_navigation(&self, url: &url::Url) -> NavigationOutcome {
        let Some(marker) = PaymentReturnMarker::from_url(url) else {
            return NavigationOutcome {
                marker: None,
                stripped_url: None,
                refresh: None,
            };
        };

        tracing::info!(
            target: "hireboard::billing::scheduler",
            kind = ?marker.kind,
            token = %marker.token,
            "Payment return detected"
        );
        let refresh = self.refresh(marker.trigger()).await;

        NavigationOutcome {
            stripped_url: Some(strip_markers(url)),
            marker: Some(marker),
            refresh: Some(refresh),
        }
    }

    /// React to sign-in, sign-out or account switch.
    ///
    /// Drops whatever is in flight for the previous identity and forces a
    /// refresh for the new one.
    pub async fn on_identity_changed(
        &self,
        identity: Option<Identity>,
    ) -> BillingResult<RefreshOutcome> {
        self.scheduler().invalidate();
        let user_id = identity.as_ref().map(|i| i.id.clone());
        self.inner
            .snapshot
            .send_replace(EntitlementsSnapshot::empty(user_id));

        match identity {
            None => Ok(RefreshOutcome::SignedOut),
            Some(identity) => {
                tracing::debug!(
                    target: "hireboard::billing",
                    user_id = %identity.id,
                    "Identity changed, refreshing entitlements"
                );
                self.mount().await
            }
        }
    }

    /// Load the bundle from the cached rows without asking the billing
    /// authority.
    pub async fn load_cached(&self) -> BillingResult<FeatureEntitlementBundle> {
        let session = self.session().await?;
        let resolved = self.inner.resolver.resolve_for(&session.identity.id).await?;
        let bundle = FeatureEntitlementBundle::from_records(
            &resolved.subscription,
            &resolved.usage.usage,
            self.inner.clock.now(),
        );
        let user_id = session.identity.id;
        self.inner.snapshot.send_modify(|snapshot| {
            if snapshot.user_id.as_deref() == Some(user_id.as_str()) || snapshot.user_id.is_none() {
                snapshot.user_id = Some(user_id.clone());
                snapshot.bundle = bundle.clone();
            }
        });
        Ok(bundle)
    }

    /// Whether the signed-in identity may post now.
    pub async fn can_post(&self) -> BillingResult<PostDecision> {
        let session = self.session().await?;
        self.inner.gate.can_post(&session.identity.id).await
    }

    /// Count a post after the job insert succeeded.
    pub async fn record_post(&self) -> BillingResult<bool> {
        let session = self.session().await?;
        let counted = self.inner.gate.increment_usage(&session.identity.id).await?;
        if counted {
            self.bump_used(&session.identity.id);
        }
        Ok(counted)
    }

    /// Reserve a slot, create the job, and count it only if creation succeeds.
    pub async fn post_with<T, E, F, Fut>(&self, create: F) -> BillingResult<PostOutcome<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let session = self.session().await?;
        let outcome = self.inner.gate.post_with(&session.identity.id, create).await?;
        if matches!(outcome, PostOutcome::Posted(_)) {
            self.bump_used(&session.identity.id);
        }
        Ok(outcome)
    }

    /// Refresh on the configured interval until [`shutdown`](Self::shutdown).
    pub fn spawn_polling(&self) {
        let service = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        let period = self.inner.poll_interval.max(Duration::from_millis(100));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.refresh(RefreshTrigger::Interval).await {
                            tracing::debug!(
                                target: "hireboard::billing::scheduler",
                                error = %e,
                                "Periodic refresh failed"
                            );
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.track(handle);
    }

    /// Follow the identity provider until [`shutdown`](Self::shutdown).
    pub fn spawn_identity_watch(&self) {
        let service = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        let mut changes = self.inner.identity.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let identity = changes.borrow_and_update().clone();
                        if let Err(e) = service.on_identity_changed(identity).await {
                            tracing::debug!(
                                target: "hireboard::billing",
                                error = %e,
                                "Refresh after identity change failed"
                            );
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.track(handle);
    }

    /// Unmount: stop background tasks and discard in-flight results.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.scheduler().invalidate();
        self.inner.snapshot.send_modify(|s| s.loading = false);

        let handles: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn run_fetch(&self, ticket: RefreshTicket) -> BillingResult<RefreshOutcome> {
        let Some(session) = self.inner.identity.current_session().await else {
            if self.scheduler().complete(ticket, true) {
                self.inner
                    .snapshot
                    .send_replace(EntitlementsSnapshot::signed_out());
            }
            return Ok(RefreshOutcome::SignedOut);
        };
        let user_id = session.identity.id.clone();

        self.inner.snapshot.send_modify(|s| {
            if s.user_id.as_deref() == Some(user_id.as_str()) || s.user_id.is_none() {
                s.loading = true;
            }
        });

        match self.fetch(&session).await {
            Ok((bundle, report, partial)) => {
                if !self.scheduler().complete(ticket, true) {
                    return Ok(RefreshOutcome::Discarded);
                }
                let now = self.inner.clock.now();
                self.inner.snapshot.send_replace(EntitlementsSnapshot {
                    user_id: Some(user_id),
                    bundle: bundle.clone(),
                    loading: self.still_fetching(),
                    last_error: None,
                    refreshed_at: Some(now),
                });
                Ok(RefreshOutcome::Refreshed {
                    bundle,
                    report,
                    partial,
                })
            }
            Err(e) => {
                let fallback = self.fallback_bundle(&user_id).await;
                if !self.scheduler().complete(ticket, false) {
                    return Ok(RefreshOutcome::Discarded);
                }
                self.inner
                    .audit
                    .log(EntitlementAuditEvent::RefreshFailed {
                        user_id: user_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                let loading = self.still_fetching();
                let error = e.clone();
                self.inner.snapshot.send_modify(move |s| {
                    if s.user_id.as_deref() != Some(user_id.as_str()) {
                        *s = EntitlementsSnapshot::empty(Some(user_id));
                    }
                    if let Some(bundle) = fallback {
                        s.bundle = bundle;
                    }
                    s.loading = loading;
                    s.last_error = Some(error);
                });
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        session: &Session,
    ) -> BillingResult<(FeatureEntitlementBundle, ReconcileReport, bool)> {
        let user_id = session.identity.id.as_str();
        let report = self.inner.reconciler.reconcile(user_id, &session.token).await?;

        let (usage, partial) = match self.inner.resolver.resolve(user_id, &report.current).await {
            Ok(resolved) => (resolved.usage, resolved.partial),
            Err(e) => {
                // Subscription is fresh but the usage row is unreadable. Keep the
                // last known counter if we have one for this identity.
                let cached = self.snapshot();
                if cached.user_id.as_deref() != Some(user_id) || cached.refreshed_at.is_none() {
                    return Err(e);
                }
                tracing::warn!(
                    target: "hireboard::billing",
                    user_id = %user_id,
                    error = %e,
                    "Usage row unreadable after reconciliation, keeping last known usage"
                );
                let now = self.inner.clock.now();
                let mut usage = UsageLimitRecord::new(report.current.tier, now, now);
                usage.monthly_used = cached.bundle.monthly_posts_used;
                (usage, true)
            }
        };

        let bundle =
            FeatureEntitlementBundle::from_records(&report.current, &usage, self.inner.clock.now());
        Ok((bundle, report, partial))
    }

    /// Last-known-good bundle for `user_id` after a failed refresh.
    async fn fallback_bundle(&self, user_id: &str) -> Option<FeatureEntitlementBundle> {
        let cached = self.snapshot();
        if cached.user_id.as_deref() == Some(user_id) && cached.refreshed_at.is_some() {
            return Some(cached.bundle);
        }
        match self.inner.resolver.resolve_for(user_id).await {
            Ok(resolved) => Some(FeatureEntitlementBundle::from_records(
                &resolved.subscription,
                &resolved.usage.usage,
                self.inner.clock.now(),
            )),
            Err(e) => {
                tracing::warn!(
                    target: "hireboard::billing",
                    user_id = %user_id,
                    error = %e,
                    "No cached entitlements to fall back on"
                );
                None
            }
        }
    }

    async fn session(&self) -> BillingResult<Session> {
        self.inner
            .identity
            .current_session()
            .await
            .ok_or(BillingError::NoIdentity)
    }

    fn bump_used(&self, user_id: &str) {
        self.inner.snapshot.send_modify(|s| {
            if s.user_id.as_deref() == Some(user_id) {
                s.bundle.monthly_posts_used = s.bundle.monthly_posts_used.saturating_add(1);
            }
        });
    }

    fn still_fetching(&self) -> bool {
        self.scheduler().state() == RefreshState::Fetching
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn scheduler(&self) -> MutexGuard<'_, RefreshScheduler> {
        self.inner.scheduler.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "hireboard::billing::scheduler", "Scheduler lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
