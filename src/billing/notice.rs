//! User-facing notices.
//!
//! Transient failures become dismissible notices with a retry action. Gate
//! denials become upgrade prompts. Nothing is ever a silent no-op.

use serde::Serialize;

use super::error::BillingError;
use super::gate::PostDecision;
use super::tier::Tier;

/// How the notice should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Something failed and retrying may help.
    RetryableError,
    /// Something failed and retrying will not help.
    Error,
    /// The action needs a better plan.
    UpgradePrompt,
}

/// What the notice offers to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoticeAction {
    Retry,
    Upgrade { suggested: Tier },
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
    pub dismissible: bool,
    pub action: Option<NoticeAction>,
}

impl Notice {
    /// Notice for a failed refresh or gate check.
    pub fn from_error(error: &BillingError) -> Self {
        if error.is_retryable() {
            return Self {
                kind: NoticeKind::RetryableError,
                title: "Couldn't check your subscription".to_string(),
                message: "We're showing your last known plan. Try again in a moment.".to_string(),
                dismissible: true,
                action: Some(NoticeAction::Retry),
            };
        }

        let message = match error {
            BillingError::NoIdentity => "Sign in to see your subscription.".to_string(),
            BillingError::BillingCheckRejected { message } => message.clone(),
            _ => "Something went wrong while checking your subscription.".to_string(),
        };
        Self {
            kind: NoticeKind::Error,
            title: "Subscription unavailable".to_string(),
            message,
            dismissible: true,
            action: None,
        }
    }

    /// Upgrade prompt for a gate denial. `None` when posting is allowed.
    pub fn upgrade_prompt(decision: &PostDecision, current: Tier) -> Option<Self> {
        let (title, message) = match decision {
            PostDecision::Allowed { .. } => return None,
            PostDecision::UpgradeRequired { .. } => (
                "Upgrade to post jobs".to_string(),
                "Your current plan doesn't include job posts. Pick a plan to publish your listing."
                    .to_string(),
            ),
            PostDecision::LimitReached { used, limit } => (
                "Monthly post limit reached".to_string(),
                format!(
                    "You've used {} of {} job posts this month. Upgrade for more, or wait for your allowance to reset.",
                    used, limit
                ),
            ),
        };
        Some(Self {
            kind: NoticeKind::UpgradePrompt,
            title,
            message,
            dismissible: true,
            action: Some(NoticeAction::Upgrade {
                suggested: suggested_upgrade(current),
            }),
        })
    }
}

/// Next plan up with a larger allowance.
#[must_use]
pub fn suggested_upgrade(current: Tier) -> Tier {
    match current {
        Tier::Free | Tier::Single => Tier::Basic,
        Tier::Basic => Tier::Standard,
        Tier::Standard | Tier::Premium => Tier::Premium,
    }
}
