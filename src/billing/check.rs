//! External billing check.
//!
//! The billing authority is the ground truth for whether an identity is
//! subscribed. It is reached through a single invoked function that takes
//! `{identityToken}` and answers with either the subscription state or
//! `{error}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::BillingError;
use super::identity::IdentityToken;
use super::storage::{BillingResult, SubscriptionRecord};
use super::tier::Tier;

/// Default timeout for billing check requests.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the billing authority says is true right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingCheck {
    pub subscribed: bool,
    pub tier: Tier,
    /// Raw status string from the authority (`active`, `past_due`, ...).
    /// Informational only.
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
}

impl BillingCheck {
    /// A live subscription on `tier`.
    pub fn subscribed(tier: Tier, current_period_end: Option<DateTime<Utc>>) -> Self {
        Self {
            subscribed: true,
            tier,
            status: "active".to_string(),
            current_period_end,
            external_ref: None,
        }
    }

    /// No subscription.
    pub fn unsubscribed() -> Self {
        Self {
            subscribed: false,
            tier: Tier::Free,
            status: "none".to_string(),
            current_period_end: None,
            external_ref: None,
        }
    }

    /// Set the billing-authority reference.
    #[must_use]
    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    /// The subscription row this answer should be written back as.
    ///
    /// `active` follows `subscribed`; the status string does not change it.
    pub fn to_record(&self, now: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            tier: self.tier,
            active: self.subscribed,
            expires_at: self.current_period_end,
            external_ref: self.external_ref.clone(),
            updated_at: now,
        }
    }
}

/// Success body as sent on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckBody {
    subscribed: bool,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    external_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CheckResponse {
    Error { error: String },
    Ok(CheckBody),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest<'a> {
    identity_token: &'a str,
}

impl From<CheckBody> for BillingCheck {
    fn from(body: CheckBody) -> Self {
        let tier = body
            .tier
            .as_deref()
            .map(Tier::from_remote)
            .unwrap_or_default();
        Self {
            subscribed: body.subscribed,
            tier,
            status: body.status.unwrap_or_default(),
            current_period_end: body.current_period_end,
            external_ref: body.external_ref,
        }
    }
}

/// Decode a billing check response body.
///
/// `{error}` becomes [`BillingError::BillingCheckRejected`]; anything that is
/// neither shape is a failed check.
pub fn decode_check_response(body: &str) -> BillingResult<BillingCheck> {
    match serde_json::from_str::<CheckResponse>(body) {
        Ok(CheckResponse::Ok(body)) => Ok(body.into()),
        Ok(CheckResponse::Error { error }) => {
            Err(BillingError::BillingCheckRejected { message: error })
        }
        Err(e) => Err(BillingError::BillingCheckFailed {
            message: format!("malformed billing check response: {}", e),
            http_status: None,
        }),
    }
}

/// Ground-truth source for subscription state.
#[async_trait]
pub trait BillingAuthority: Send + Sync {
    /// Ask what is true right now for the holder of `token`.
    async fn check(&self, token: &IdentityToken) -> BillingResult<BillingCheck>;
}

/// Billing authority reached over HTTP.
///
/// Posts `{"identityToken": ..}` as JSON with the token as bearer auth.
#[derive(Clone)]
pub struct HttpBillingAuthority {
    url: url::Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpBillingAuthority {
    /// Create a client for the check function at `url`.
    pub fn new(url: url::Url) -> Self {
        Self::with_timeout(url, DEFAULT_CHECK_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(url: url::Url, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            client: Self::build_client(timeout),
        }
    }

    /// Create a client from entitlements configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no billing check URL is configured or it does not
    /// parse.
    pub fn from_config(config: &crate::config::EntitlementsConfig) -> crate::error::Result<Self> {
        let url = config.billing_check_url()?.ok_or_else(|| {
            crate::error::HireboardError::bad_request("No billing check URL configured")
        })?;
        Ok(Self::with_timeout(url, config.request_timeout()))
    }

    fn build_client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("hireboard-entitlements")
            .build()
            .unwrap_or_default()
    }

    /// Endpoint being called.
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    fn map_transport_error(&self, err: reqwest::Error) -> BillingError {
        if err.is_timeout() {
            BillingError::Timeout {
                operation: "billing_check".to_string(),
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            BillingError::BillingCheckFailed {
                message: err.to_string(),
                http_status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl std::fmt::Debug for HttpBillingAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBillingAuthority")
            .field("url", &self.url.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BillingAuthority for HttpBillingAuthority {
    async fn check(&self, token: &IdentityToken) -> BillingResult<BillingCheck> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(token.expose())
            .json(&CheckRequest {
                identity_token: token.expose(),
            })
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            let message = match decode_check_response(&body) {
                Err(BillingError::BillingCheckRejected { message }) => message,
                _ => status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            };
            tracing::warn!(
                target: "hireboard::billing::reconcile",
                status = status.as_u16(),
                message = %message,
                "Billing check returned an error status"
            );
            return Err(BillingError::BillingCheckFailed {
                message,
                http_status: Some(status.as_u16()),
            });
        }

        decode_check_response(&body)
    }
}
