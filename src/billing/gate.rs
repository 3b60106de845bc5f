//! Posting-limit gate.
//!
//! The checkpoint every job-creation path goes through. Two ways to use it:
//!
//! - [`can_post`](PostingLimitGate::can_post) before the job insert and
//!   [`increment_usage`](PostingLimitGate::increment_usage) after it succeeds.
//!   Check-then-act: two sessions can both pass the check before either
//!   increments, and the identity ends the month one post over its limit.
//! - [`reserve`](PostingLimitGate::reserve) then
//!   [`commit`](PostReservation::commit) or
//!   [`release`](PostReservation::release), or simply
//!   [`post_with`](PostingLimitGate::post_with). The reservation takes the
//!   slot through [`EntitlementStore::try_reserve_usage`], which is atomic on
//!   stores that support it.
//!
//! A denial is a normal answer, not an error. `Err(..)` always means the
//! decision could not be made.

use std::future::Future;
use std::sync::Arc;

use super::audit::{EntitlementAuditEvent, EntitlementAuditLogger, NoOpAuditLogger};
use super::clock::{Clock, SystemClock};
use super::consistency::TierConsistencyResolver;
use super::error::BillingError;
use super::storage::{BillingResult, EntitlementStore, UsageReservation, USAGE_LIMIT_TABLE};
use super::tier::Tier;

/// Answer from the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "post decision must be used to enforce the posting limit"]
pub enum PostDecision {
    /// Posting is allowed.
    Allowed { remaining: u32 },
    /// The effective tier cannot post at all.
    UpgradeRequired { tier: Tier },
    /// The monthly allowance is used up.
    LimitReached { used: u32, limit: u32 },
}

impl PostDecision {
    /// Check if posting is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Short machine-readable reason.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::UpgradeRequired { .. } => "upgrade_required",
            Self::LimitReached { .. } => "limit_reached",
        }
    }
}

/// Result of [`PostingLimitGate::reserve`].
#[must_use]
pub enum ReserveOutcome<'a, S: EntitlementStore + Clone> {
    Reserved(PostReservation<'a, S>),
    Denied(PostDecision),
}

/// Result of [`PostingLimitGate::post_with`].
#[derive(Debug)]
#[must_use]
pub enum PostOutcome<T, E> {
    /// Job created and counted.
    Posted(T),
    /// The gate refused; the job was not attempted.
    Denied(PostDecision),
    /// The job creation failed; the reserved slot was given back.
    Failed(E),
}

/// Enforces the monthly posting allowance.
pub struct PostingLimitGate<S: EntitlementStore + Clone> {
    store: S,
    resolver: TierConsistencyResolver<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn EntitlementAuditLogger>,
}

impl<S: EntitlementStore + Clone> PostingLimitGate<S> {
    /// Create a gate using the system clock.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            resolver: TierConsistencyResolver::new(store.clone()),
            store,
            clock: Arc::new(SystemClock),
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Use a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.resolver = self.resolver.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Send audit events to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn EntitlementAuditLogger>) -> Self {
        self.resolver = self.resolver.with_audit(audit.clone());
        self.audit = audit;
        self
    }

    /// Decide whether `user_id` may create a job post now.
    ///
    /// Runs a consistency pass first, so an ended period is rolled over and
    /// the post allowed.
    ///
    /// # Errors
    ///
    /// Returns an error when the rows cannot be read. That is never reported
    /// as a denial.
    pub async fn can_post(&self, user_id: &str) -> BillingResult<PostDecision> {
        let resolved = self.resolver.resolve_for(user_id).await?;
        let now = self.clock.now();
        let tier = resolved.subscription.effective_tier(now);
        let usage = &resolved.usage.usage;

        let decision = if !tier.can_post() {
            PostDecision::UpgradeRequired { tier }
        } else if usage.has_capacity() {
            PostDecision::Allowed {
                remaining: usage.remaining(),
            }
        } else {
            PostDecision::LimitReached {
                used: usage.monthly_used,
                limit: usage.monthly_limit,
            }
        };

        if !decision.is_allowed() {
            self.log_denied(user_id, &decision).await;
        }
        Ok(decision)
    }

    /// Count one post. Call only after the job insert has succeeded.
    ///
    /// Returns `false` if there was no usage row to count against.
    pub async fn increment_usage(&self, user_id: &str) -> BillingResult<bool> {
        match self.store.increment_usage(user_id).await? {
            Some(monthly_used) => {
                self.log_incremented(user_id, monthly_used).await;
                Ok(true)
            }
            None => {
                tracing::warn!(
                    target: "hireboard::billing::gate",
                    user_id = %user_id,
                    "No usage row to increment"
                );
                Ok(false)
            }
        }
    }

    /// Take one posting slot ahead of the job insert.
    pub async fn reserve(&self, user_id: &str) -> BillingResult<ReserveOutcome<'_, S>> {
        let resolved = self.resolver.resolve_for(user_id).await?;
        let tier = resolved.subscription.effective_tier(self.clock.now());

        if !tier.can_post() {
            let decision = PostDecision::UpgradeRequired { tier };
            self.log_denied(user_id, &decision).await;
            return Ok(ReserveOutcome::Denied(decision));
        }

        let limit = resolved.usage.usage.monthly_limit;
        match self.store.try_reserve_usage(user_id, limit).await? {
            UsageReservation::Reserved { used } => {
                tracing::debug!(
                    target: "hireboard::billing::gate",
                    user_id = %user_id,
                    used,
                    limit,
                    "Posting slot reserved"
                );
                Ok(ReserveOutcome::Reserved(PostReservation {
                    gate: self,
                    user_id: user_id.to_string(),
                    used,
                    settled: false,
                }))
            }
            UsageReservation::LimitReached { used, limit } => {
                let decision = PostDecision::LimitReached { used, limit };
                self.log_denied(user_id, &decision).await;
                Ok(ReserveOutcome::Denied(decision))
            }
            UsageReservation::Missing => Err(BillingError::store(
                USAGE_LIMIT_TABLE,
                "reserve",
                "usage row missing after consistency pass",
            )),
        }
    }

    /// Reserve a slot, run `create`, and keep the slot only if it succeeds.
    pub async fn post_with<T, E, F, Fut>(
        &self,
        user_id: &str,
        create: F,
    ) -> BillingResult<PostOutcome<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let reservation = match self.reserve(user_id).await? {
            ReserveOutcome::Reserved(reservation) => reservation,
            ReserveOutcome::Denied(decision) => return Ok(PostOutcome::Denied(decision)),
        };

        match create().await {
            Ok(value) => {
                reservation.commit().await;
                Ok(PostOutcome::Posted(value))
            }
            Err(e) => {
                if let Err(release_err) = reservation.release().await {
                    tracing::warn!(
                        target: "hireboard::billing::gate",
                        user_id = %user_id,
                        error = %release_err,
                        "Could not release posting slot after failed job creation"
                    );
                }
                Ok(PostOutcome::Failed(e))
            }
        }
    }

    async fn log_denied(&self, user_id: &str, decision: &PostDecision) {
        tracing::debug!(
            target: "hireboard::billing::gate",
            user_id = %user_id,
            reason = decision.reason(),
            "Post denied"
        );
        self.audit
            .log(EntitlementAuditEvent::PostDenied {
                user_id: user_id.to_string(),
                reason: decision.reason().to_string(),
            })
            .await;
    }

    async fn log_incremented(&self, user_id: &str, monthly_used: u32) {
        tracing::debug!(
            target: "hireboard::billing::gate",
            user_id = %user_id,
            monthly_used,
            "Usage incremented"
        );
        self.audit
            .log(EntitlementAuditEvent::UsageIncremented {
                user_id: user_id.to_string(),
                monthly_used,
            })
            .await;
    }
}

/// A posting slot taken by [`PostingLimitGate::reserve`].
///
/// Settle it with [`commit`](Self::commit) once the job exists or
/// [`release`](Self::release) if it was not created. Dropping it unsettled
/// keeps the slot counted.
#[must_use = "reservation must be committed or released"]
pub struct PostReservation<'a, S: EntitlementStore + Clone> {
    gate: &'a PostingLimitGate<S>,
    user_id: String,
    used: u32,
    settled: bool,
}

impl<S: EntitlementStore + Clone> PostReservation<'_, S> {
    /// Usage count including this reservation.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Keep the slot. Returns the usage count.
    pub async fn commit(mut self) -> u32 {
        self.settled = true;
        self.gate.log_incremented(&self.user_id, self.used).await;
        self.used
    }

    /// Give the slot back.
    pub async fn release(mut self) -> BillingResult<()> {
        self.settled = true;
        self.gate.store.release_usage(&self.user_id).await?;
        tracing::debug!(
            target: "hireboard::billing::gate",
            user_id = %self.user_id,
            "Posting slot released"
        );
        Ok(())
    }
}

impl<S: EntitlementStore + Clone> Drop for PostReservation<'_, S> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                target: "hireboard::billing::gate",
                user_id = %self.user_id,
                "Posting reservation dropped without commit or release, slot stays counted"
            );
        }
    }
}
