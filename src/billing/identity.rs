//! Identity collaborator.
//!
//! Authentication lives elsewhere. The entitlement subsystem only needs to
//! know who is signed in, the bearer token to present to the billing check,
//! and when either changes.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id, the key of both entitlement tables.
    pub id: String,
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

/// Opaque bearer token for the billing check.
///
/// Never printed in debug output.
#[derive(Clone)]
pub struct IdentityToken(SecretString);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Raw token value, for building the request.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentityToken([REDACTED])")
    }
}

/// An identity together with its current token.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub token: IdentityToken,
}

/// Source of the current identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The signed-in session, if any.
    async fn current_session(&self) -> Option<Session>;

    /// The signed-in identity, if any.
    async fn current_identity(&self) -> Option<Identity> {
        self.current_session().await.map(|s| s.identity)
    }

    /// Stream of identity changes. The receiver sees the latest value only.
    fn subscribe(&self) -> watch::Receiver<Option<Identity>>;
}

/// Identity provider driven by explicit sign-in and sign-out calls.
///
/// Useful for tests and for hosts that manage sessions themselves.
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    session: std::sync::Arc<std::sync::RwLock<Option<Session>>>,
    changes: std::sync::Arc<watch::Sender<Option<Identity>>>,
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            session: std::sync::Arc::default(),
            changes: std::sync::Arc::new(tx),
        }
    }
}

impl StaticIdentityProvider {
    /// Provider with nobody signed in.
    #[must_use]
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Provider with `identity` already signed in.
    #[must_use]
    pub fn signed_in(identity: Identity, token: IdentityToken) -> Self {
        let provider = Self::default();
        provider.sign_in(identity, token);
        provider
    }

    /// Replace the current session and notify subscribers.
    pub fn sign_in(&self, identity: Identity, token: IdentityToken) {
        self.set(Some(Session {
            identity: identity.clone(),
            token,
        }));
        self.changes.send_replace(Some(identity));
    }

    /// Clear the current session and notify subscribers.
    pub fn sign_out(&self) {
        self.set(None);
        self.changes.send_replace(None);
    }

    fn set(&self, session: Option<Session>) {
        let mut guard = self.session.write().unwrap_or_else(|p| p.into_inner());
        *guard = session;
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn current_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = IdentityToken::new("eyJhbGciOi.secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("secret"));
        assert_eq!(token.expose(), "eyJhbGciOi.secret");
    }

    #[tokio::test]
    async fn test_sign_in_and_out_notify_subscribers() {
        let provider = StaticIdentityProvider::signed_out();
        let mut rx = provider.subscribe();
        assert!(provider.current_identity().await.is_none());

        provider.sign_in(Identity::new("u1", "a@example.com"), IdentityToken::new("t"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|i| i.id.as_str()), Some("u1"));
        assert_eq!(provider.current_identity().await.unwrap().id, "u1");

        provider.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(provider.current_session().await.is_none());
    }
}
