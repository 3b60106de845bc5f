//! Audit logging for entitlement changes.
//!
//! Records every mutation the subsystem makes to the entitlement tables and
//! every refused post, so support can answer "why can't I post?" after the
//! fact.

use async_trait::async_trait;
use std::fmt;

use super::tier::Tier;

/// Audit event types for entitlement operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementAuditEvent {
    /// Billing authority answer written back to the subscription row.
    SubscriptionReconciled {
        user_id: String,
        tier: Tier,
        active: bool,
        changes: usize,
    },
    /// Usage row tier/limit repaired to match the subscription.
    UsageTierCorrected {
        user_id: String,
        from: Tier,
        to: Tier,
        monthly_limit: u32,
    },
    /// Usage counter zeroed on period roll-over.
    UsageReset {
        user_id: String,
        previous_used: u32,
    },
    /// A post was counted.
    UsageIncremented { user_id: String, monthly_used: u32 },
    /// A post attempt was refused.
    PostDenied { user_id: String, reason: String },
    /// A refresh did not complete.
    RefreshFailed { user_id: String, error: String },
}

impl fmt::Display for EntitlementAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionReconciled { user_id, tier, active, changes } => {
                write!(f, "Subscription reconciled: user={}, tier={}, active={}, changes={}", user_id, tier, active, changes)
            }
            Self::UsageTierCorrected { user_id, from, to, monthly_limit } => {
                write!(f, "Usage tier corrected: user={}, from={}, to={}, limit={}", user_id, from, to, monthly_limit)
            }
            Self::UsageReset { user_id, previous_used } => {
                write!(f, "Usage reset: user={}, previous_used={}", user_id, previous_used)
            }
            Self::UsageIncremented { user_id, monthly_used } => {
                write!(f, "Usage incremented: user={}, used={}", user_id, monthly_used)
            }
            Self::PostDenied { user_id, reason } => {
                write!(f, "Post denied: user={}, reason={}", user_id, reason)
            }
            Self::RefreshFailed { user_id, error } => {
                write!(f, "Refresh failed: user={}, error={}", user_id, error)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should swallow their own failures; auditing must never
/// block an entitlement decision.
#[async_trait]
pub trait EntitlementAuditLogger: Send + Sync {
    /// Log an entitlement audit event.
    async fn log(&self, event: EntitlementAuditEvent);
}

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl EntitlementAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: EntitlementAuditEvent) {}
}

/// Tracing-based audit logger.
///
/// Logs audit events using the `tracing` crate at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl EntitlementAuditLogger for TracingAuditLogger {
    async fn log(&self, event: EntitlementAuditEvent) {
        tracing::info!(
            target: "billing::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

/// Get the event kind as a string for structured logging.
pub fn event_kind(event: &EntitlementAuditEvent) -> &'static str {
    match event {
        EntitlementAuditEvent::SubscriptionReconciled { .. } => "subscription_reconciled",
        EntitlementAuditEvent::UsageTierCorrected { .. } => "usage_tier_corrected",
        EntitlementAuditEvent::UsageReset { .. } => "usage_reset",
        EntitlementAuditEvent::UsageIncremented { .. } => "usage_incremented",
        EntitlementAuditEvent::PostDenied { .. } => "post_denied",
        EntitlementAuditEvent::RefreshFailed { .. } => "refresh_failed",
    }
}
