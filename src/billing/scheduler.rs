//! Refresh scheduling.
//!
//! Decides when a reconciliation pass should run. The scheduler is a plain
//! state machine: it never sleeps or spawns. Callers feed it triggers and
//! completions, and it answers with what to do and when. Time comes from the
//! injected [`Clock`].
//!
//! ```text
//! Idle ──request──► Throttled ──due──► Fetching ──► Succeeded | Failed ──► (Idle)
//!   └───────────── forced / outside interval ─────►┘
//! ```
//!
//! Every fetch carries a [`RefreshTicket`]. Unmounting or switching identity
//! bumps the generation, and results for an older generation are discarded,
//! as are results that complete after a newer fetch already landed.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::clock::Clock;

/// Why a refresh was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The consumer mounted. Always forced.
    Mount,
    /// Periodic tick.
    Interval,
    /// Returned from the external payment flow. Forced, once per token.
    PaymentReturn { token: String },
    /// Explicit request, e.g. a retry button.
    Manual { force: bool },
}

impl RefreshTrigger {
    /// Whether this trigger bypasses throttling.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        match self {
            Self::Mount | Self::PaymentReturn { .. } => true,
            Self::Manual { force } => *force,
            Self::Interval => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Interval => "interval",
            Self::PaymentReturn { .. } => "payment_return",
            Self::Manual { .. } => "manual",
        }
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    /// A delayed fetch is pending.
    Throttled { ready_at: DateTime<Utc> },
    Fetching,
    Succeeded,
    Failed,
}

/// Identifies one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    generation: u64,
    seq: u64,
}

impl RefreshTicket {
    /// Generation this fetch was started in.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the caller should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum RefreshDecision {
    /// Start the fetch now.
    FetchNow(RefreshTicket),
    /// A delayed fetch was scheduled; call [`RefreshScheduler::poll_due`]
    /// after `after`.
    Delay { after: Duration },
    /// Folded into a fetch that is already in flight or pending.
    Coalesced,
    /// Payment-return token already handled.
    Duplicate,
}

/// Throttling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Non-forced requests within this interval of the last completed fetch
    /// are delayed.
    pub min_interval: Duration,
    /// Delay added per request in the current burst.
    pub backoff_step: Duration,
    /// Delay cap.
    pub max_backoff: Duration,
    /// How many payment-return tokens to remember.
    pub processed_marker_capacity: usize,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(2_000),
            backoff_step: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(10_000),
            processed_marker_capacity: 64,
        }
    }
}

impl From<&crate::config::EntitlementsConfig> for RefreshPolicy {
    fn from(config: &crate::config::EntitlementsConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_refresh_interval_ms),
            backoff_step: Duration::from_millis(config.backoff_step_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            processed_marker_capacity: config.processed_marker_capacity,
        }
    }
}

impl RefreshPolicy {
    /// Backoff for the `burst`-th request in a burst.
    #[must_use]
    pub fn backoff(&self, burst: u32) -> Duration {
        self.backoff_step
            .saturating_mul(burst.max(1))
            .min(self.max_backoff)
    }
}

/// Bounded first-in-first-out set of processed tokens.
#[derive(Debug, Clone, Default)]
struct ProcessedTokens {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl ProcessedTokens {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the token was already recorded.
    fn insert(&mut self, token: &str) -> bool {
        if self.seen.contains(token) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(token.to_string());
        self.seen.insert(token.to_string());
        true
    }

    fn contains(&self, token: &str) -> bool {
        self.seen.contains(token)
    }
}

/// Coordinates when reconciliation runs.
///
/// One per session; share it behind a lock.
pub struct RefreshScheduler {
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    state: RefreshState,
    last_outcome: RefreshState,
    generation: u64,
    next_seq: u64,
    last_applied_seq: u64,
    in_flight: u32,
    last_fetch_time: Option<DateTime<Utc>>,
    burst_count: u32,
    pending: Option<DateTime<Utc>>,
    processed: ProcessedTokens,
}

impl RefreshScheduler {
    /// Create a scheduler.
    pub fn new(clock: Arc<dyn Clock>, policy: RefreshPolicy) -> Self {
        Self {
            clock,
            processed: ProcessedTokens::new(policy.processed_marker_capacity),
            policy,
            state: RefreshState::Idle,
            last_outcome: RefreshState::Idle,
            generation: 0,
            next_seq: 0,
            last_applied_seq: 0,
            in_flight: 0,
            last_fetch_time: None,
            burst_count: 0,
            pending: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> RefreshState {
        self.state
    }

    #[must_use]
    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Requests seen in the current burst.
    #[must_use]
    pub fn burst_count(&self) -> u32 {
        self.burst_count
    }

    /// Completion time of the last applied fetch.
    #[must_use]
    pub fn last_fetch_time(&self) -> Option<DateTime<Utc>> {
        self.last_fetch_time
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a payment-return token has been handled already.
    #[must_use]
    pub fn has_processed(&self, token: &str) -> bool {
        self.processed.contains(token)
    }

    /// Ask for a refresh.
    pub fn request(&mut self, trigger: RefreshTrigger) -> RefreshDecision {
        if let RefreshTrigger::PaymentReturn { token } = &trigger {
            if !self.processed.insert(token) {
                tracing::debug!(
                    target: "hireboard::billing::scheduler",
                    token = %token,
                    "Payment return marker already processed"
                );
                return RefreshDecision::Duplicate;
            }
        }

        let now = self.clock.now();

        if trigger.is_forced() {
            // A forced fetch subsumes anything pending.
            self.pending = None;
            tracing::debug!(
                target: "hireboard::billing::scheduler",
                trigger = trigger.label(),
                "Forced refresh"
            );
            return RefreshDecision::FetchNow(self.start_fetch());
        }

        if self.state == RefreshState::Fetching {
            self.burst_count = self.burst_count.saturating_add(1);
            return RefreshDecision::Coalesced;
        }

        if let Some(ready_at) = self.pending {
            if now >= ready_at {
                // Nobody picked up the delayed fetch in time
                self.pending = None;
                tracing::debug!(
                    target: "hireboard::billing::scheduler",
                    trigger = trigger.label(),
                    ready_at = %ready_at,
                    "Overdue pending refresh started"
                );
                return RefreshDecision::FetchNow(self.start_fetch());
            }
            self.burst_count = self.burst_count.saturating_add(1);
            tracing::trace!(
                target: "hireboard::billing::scheduler",
                trigger = trigger.label(),
                ready_at = %ready_at,
                "Refresh coalesced into pending fetch"
            );
            return RefreshDecision::Coalesced;
        }

        if self.within_min_interval(now) {
            self.burst_count = self.burst_count.saturating_add(1);
            let after = self.policy.backoff(self.burst_count);
            let ready_at = now + to_chrono(after);
            self.pending = Some(ready_at);
            self.state = RefreshState::Throttled { ready_at };
            tracing::debug!(
                target: "hireboard::billing::scheduler",
                trigger = trigger.label(),
                burst = self.burst_count,
                delay_ms = after.as_millis() as u64,
                "Refresh throttled"
            );
            return RefreshDecision::Delay { after };
        }

        self.burst_count = 0;
        RefreshDecision::FetchNow(self.start_fetch())
    }

    /// Start the pending delayed fetch if it is due.
    pub fn poll_due(&mut self) -> Option<RefreshTicket> {
        let ready_at = self.pending?;
        let now = self.clock.now();
        if now < ready_at {
            return None;
        }
        self.pending = None;
        Some(self.start_fetch())
    }

    /// Time left until the pending fetch is due.
    #[must_use]
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending
            .map(|ready_at| (ready_at - self.clock.now()).to_std().unwrap_or_default())
    }

    /// Whether a result for `ticket` would still be applied.
    #[must_use]
    pub fn is_current(&self, ticket: &RefreshTicket) -> bool {
        ticket.generation == self.generation && ticket.seq > self.last_applied_seq
    }

    /// Record the end of a fetch.
    ///
    /// Returns `false` when the result is stale and must be discarded.
    pub fn complete(&mut self, ticket: RefreshTicket, success: bool) -> bool {
        if ticket.generation != self.generation {
            tracing::debug!(
                target: "hireboard::billing::scheduler",
                ticket_generation = ticket.generation,
                generation = self.generation,
                "Discarding refresh result from an earlier generation"
            );
            return false;
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        if ticket.seq <= self.last_applied_seq {
            tracing::debug!(
                target: "hireboard::billing::scheduler",
                seq = ticket.seq,
                last_applied = self.last_applied_seq,
                "Discarding refresh result overtaken by a newer fetch"
            );
            self.settle_state();
            return false;
        }

        self.last_applied_seq = ticket.seq;
        self.last_fetch_time = Some(self.clock.now());
        self.last_outcome = if success {
            RefreshState::Succeeded
        } else {
            RefreshState::Failed
        };
        self.settle_state();
        true
    }

    /// Forget everything in flight. Later completions are discarded.
    ///
    /// Processed payment-return tokens are kept.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.in_flight = 0;
        self.pending = None;
        self.burst_count = 0;
        self.last_fetch_time = None;
        self.last_outcome = RefreshState::Idle;
        self.state = RefreshState::Idle;
    }

    fn start_fetch(&mut self) -> RefreshTicket {
        self.next_seq += 1;
        self.in_flight += 1;
        self.state = RefreshState::Fetching;
        RefreshTicket {
            generation: self.generation,
            seq: self.next_seq,
        }
    }

    fn settle_state(&mut self) {
        if self.in_flight > 0 {
            self.state = RefreshState::Fetching;
        } else if let Some(ready_at) = self.pending {
            self.state = RefreshState::Throttled { ready_at };
        } else {
            self.state = self.last_outcome;
        }
    }

    fn within_min_interval(&self, now: DateTime<Utc>) -> bool {
        self.last_fetch_time
            .is_some_and(|last| now - last < to_chrono(self.policy.min_interval))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Query parameter set after a completed checkout.
pub const PAYMENT_SUCCESS_PARAM: &str = "payment_success";
/// Query parameter set after a plan change.
pub const SUBSCRIPTION_UPDATED_PARAM: &str = "subscription_updated";
/// Query parameter carrying the one-shot timestamp token.
pub const MARKER_TOKEN_PARAM: &str = "t";

/// What the payment flow reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentReturnKind {
    PaymentSuccess,
    SubscriptionUpdated,
}

/// One-shot marker left in the URL by the external payment flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReturnMarker {
    pub kind: PaymentReturnKind,
    pub token: String,
}

impl PaymentReturnMarker {
    /// Read a marker from the query string, if present.
    ///
    /// A marker without a `t` token is keyed by the full URL.
    #[must_use]
    pub fn from_url(url: &url::Url) -> Option<Self> {
        let mut kind = None;
        let mut token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                PAYMENT_SUCCESS_PARAM if is_set(&value) => {
                    kind = Some(PaymentReturnKind::PaymentSuccess);
                }
                SUBSCRIPTION_UPDATED_PARAM if is_set(&value) => {
                    kind.get_or_insert(PaymentReturnKind::SubscriptionUpdated);
                }
                MARKER_TOKEN_PARAM if !value.is_empty() => token = Some(value.into_owned()),
                _ => {}
            }
        }
        kind.map(|kind| Self {
            kind,
            token: token.unwrap_or_else(|| url.as_str().to_string()),
        })
    }

    /// The trigger to hand to the scheduler.
    #[must_use]
    pub fn trigger(&self) -> RefreshTrigger {
        RefreshTrigger::PaymentReturn {
            token: self.token.clone(),
        }
    }
}

fn is_set(value: &str) -> bool {
    !matches!(value, "false" | "0")
}

/// Remove payment-return markers from a URL, keeping other parameters.
#[must_use]
pub fn strip_markers(url: &url::Url) -> url::Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            !matches!(
                key.as_ref(),
                PAYMENT_SUCCESS_PARAM | SUBSCRIPTION_UPDATED_PARAM | MARKER_TOKEN_PARAM
            )
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::clock::ManualClock;
    use chrono::TimeZone;

    fn scheduler() -> (RefreshScheduler, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap());
        let scheduler = RefreshScheduler::new(Arc::new(clock.clone()), RefreshPolicy::default());
        (scheduler, clock)
    }

    fn ticket(decision: RefreshDecision) -> RefreshTicket {
        match decision {
            RefreshDecision::FetchNow(ticket) => ticket,
            other => panic!("expected FetchNow, got {:?}", other),
        }
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[test]
    fn test_first_interval_tick_fetches() {
        let (mut s, _) = scheduler();
        assert_eq!(s.state(), RefreshState::Idle);
        let t = ticket(s.request(RefreshTrigger::Interval));
        assert_eq!(s.state(), RefreshState::Fetching);
        assert!(s.complete(t, true));
        assert_eq!(s.state(), RefreshState::Succeeded);
    }

    #[test]
    fn test_requests_while_fetching_coalesce() {
        let (mut s, _) = scheduler();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert_eq!(s.request(RefreshTrigger::Interval), RefreshDecision::Coalesced);
        assert_eq!(
            s.request(RefreshTrigger::Manual { force: false }),
            RefreshDecision::Coalesced
        );
        assert!(s.complete(t, false));
        assert_eq!(s.state(), RefreshState::Failed);
    }

    #[test]
    fn test_throttle_then_due() {
        let (mut s, clock) = scheduler();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert!(s.complete(t, true));

        clock.advance(ms(500));
        let decision = s.request(RefreshTrigger::Manual { force: false });
        assert_eq!(decision, RefreshDecision::Delay { after: Duration::from_secs(1) });
        assert!(matches!(s.state(), RefreshState::Throttled { .. }));

        // Later requests fold into the pending fetch
        assert_eq!(s.request(RefreshTrigger::Interval), RefreshDecision::Coalesced);
        assert_eq!(s.burst_count(), 2);

        assert!(s.poll_due().is_none());
        assert_eq!(s.pending_delay(), Some(Duration::from_secs(1)));
        clock.advance(ms(1_000));
        let t = s.poll_due().unwrap();
        assert_eq!(s.state(), RefreshState::Fetching);
        assert!(s.complete(t, true));
    }

    #[test]
    fn test_overdue_pending_fetch_starts_on_next_request() {
        let (mut s, clock) = scheduler();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert!(s.complete(t, true));
        clock.advance(ms(200));
        assert!(matches!(
            s.request(RefreshTrigger::Interval),
            RefreshDecision::Delay { .. }
        ));

        // The delayed fetch was never polled
        clock.advance(ms(60_000));
        let t = ticket(s.request(RefreshTrigger::Interval));
        assert!(s.pending_delay().is_none());
        assert!(s.complete(t, true));
        assert_eq!(s.state(), RefreshState::Succeeded);
    }

    #[test]
    fn test_backoff_grows_with_burst_and_caps() {
        let (mut s, clock) = scheduler();
        let mut delays = Vec::new();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert!(s.complete(t, true));

        for _ in 0..14 {
            clock.advance(ms(100));
            match s.request(RefreshTrigger::Manual { force: false }) {
                RefreshDecision::Delay { after } => delays.push(after),
                RefreshDecision::Coalesced => {}
                other => panic!("unexpected {:?}", other),
            }
            // Drain the delayed fetch right away to open the next burst slot
            if let Some(pending) = s.pending_delay() {
                clock.advance(to_chrono(pending));
                let t = s.poll_due().unwrap();
                assert!(s.complete(t, true));
            }
        }

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_quiet_period_resets_burst() {
        let (mut s, clock) = scheduler();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert!(s.complete(t, true));
        let _ = s.request(RefreshTrigger::Interval);
        assert_eq!(s.burst_count(), 1);

        clock.advance(ms(5_000));
        let t = s.poll_due().unwrap();
        assert!(s.complete(t, true));
        clock.advance(ms(5_000));
        let _ = ticket(s.request(RefreshTrigger::Interval));
        assert_eq!(s.burst_count(), 0);
    }

    #[test]
    fn test_forced_bypasses_throttle_and_cancels_pending() {
        let (mut s, clock) = scheduler();
        let t = ticket(s.request(RefreshTrigger::Mount));
        assert!(s.complete(t, true));
        clock.advance(ms(100));
        assert!(matches!(
            s.request(RefreshTrigger::Interval),
            RefreshDecision::Delay { .. }
        ));

        let t = ticket(s.request(RefreshTrigger::Manual { force: true }));
        assert!(s.pending_delay().is_none());
        assert!(s.complete(t, true));
    }

    #[test]
    fn test_payment_token_processed_once() {
        let (mut s, _) = scheduler();
        let trigger = RefreshTrigger::PaymentReturn {
            token: "1760000000".to_string(),
        };
        let t = ticket(s.request(trigger.clone()));
        assert!(s.complete(t, true));
        assert_eq!(s.request(trigger), RefreshDecision::Duplicate);
        assert!(s.has_processed("1760000000"));
    }

    #[test]
    fn test_processed_tokens_are_bounded() {
        let mut tokens = ProcessedTokens::new(2);
        assert!(tokens.insert("a"));
        assert!(tokens.insert("b"));
        assert!(!tokens.insert("a"));
        assert!(tokens.insert("c"));
        assert!(!tokens.contains("a"));
        assert!(tokens.contains("b") && tokens.contains("c"));
    }

    #[test]
    fn test_invalidate_discards_in_flight_result() {
        let (mut s, _) = scheduler();
        let stale = ticket(s.request(RefreshTrigger::Mount));
        s.invalidate();
        assert!(!s.is_current(&stale));
        assert!(!s.complete(stale, true));
        assert_eq!(s.state(), RefreshState::Idle);
        assert!(s.last_fetch_time().is_none());
    }

    #[test]
    fn test_out_of_order_completion_keeps_newest() {
        let (mut s, _) = scheduler();
        let older = ticket(s.request(RefreshTrigger::Mount));
        let newer = ticket(s.request(RefreshTrigger::Manual { force: true }));

        assert!(s.complete(newer, true));
        assert!(!s.complete(older, false));
        assert_eq!(s.state(), RefreshState::Succeeded);
    }

    #[test]
    fn test_marker_from_url() {
        let url = url::Url::parse("https://app.example.com/billing?payment_success=true&t=1760000000&tab=plans")
            .unwrap();
        let marker = PaymentReturnMarker::from_url(&url).unwrap();
        assert_eq!(marker.kind, PaymentReturnKind::PaymentSuccess);
        assert_eq!(marker.token, "1760000000");

        let url = url::Url::parse("https://app.example.com/billing?subscription_updated=1&t=42").unwrap();
        assert_eq!(
            PaymentReturnMarker::from_url(&url).unwrap().kind,
            PaymentReturnKind::SubscriptionUpdated
        );

        let url = url::Url::parse("https://app.example.com/billing?payment_success=false").unwrap();
        assert!(PaymentReturnMarker::from_url(&url).is_none());
        let url = url::Url::parse("https://app.example.com/jobs?t=42").unwrap();
        assert!(PaymentReturnMarker::from_url(&url).is_none());
    }

    #[test]
    fn test_strip_markers_keeps_other_params() {
        let url = url::Url::parse("https://app.example.com/billing?payment_success=true&t=1&tab=plans")
            .unwrap();
        assert_eq!(
            strip_markers(&url).as_str(),
            "https://app.example.com/billing?tab=plans"
        );

        let url = url::Url::parse("https://app.example.com/billing?subscription_updated=true&t=1").unwrap();
        assert_eq!(strip_markers(&url).as_str(), "https://app.example.com/billing");
    }
}
