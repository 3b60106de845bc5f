//! Hireboard - subscription entitlements for a job board
//!
//! Reconciles cached subscription state against an external billing
//! authority, keeps per-identity posting allowances consistent with the
//! subscribed tier, and gates job posting on the result.
//!
//! # Features
//!
//! - **Reconciliation**: the billing authority's answer is written back over the cache
//! - **Consistency**: usage rows follow the subscription tier and roll over monthly
//! - **Entitlements**: feature flags derived from tier, status, and expiry
//! - **Gating**: monthly posting limits enforced with atomic reservations
//! - **Refresh scheduling**: throttled, coalesced, and deduplicated refreshes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hireboard::billing::{
//!     EntitlementsService, HttpBillingAuthority, Identity, IdentityToken,
//!     MemoryEntitlementStore, StaticIdentityProvider,
//! };
//! use hireboard::ConfigBuilder;
//!
//! #[tokio::main]
//! async fn main() -> hireboard::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     hireboard::init_tracing_with_config(&config);
//!
//!     let identity = StaticIdentityProvider::signed_in(
//!         Identity::new("user-1", "poster@example.com"),
//!         IdentityToken::new("session-token"),
//!     );
//!     let authority = HttpBillingAuthority::from_config(&config.entitlements)?;
//!     let service = EntitlementsService::builder(MemoryEntitlementStore::new(), authority, identity)
//!         .config(config.entitlements.clone())
//!         .build();
//!
//!     let outcome = service.mount().await?;
//!     println!("{:?} {:?}", outcome, service.bundle());
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
mod error;
mod utils;

// Re-exports for public API
pub use config::{Config, ConfigBuilder, EntitlementsConfig, EntitlementsConfigBuilder, LoggingConfig};
pub use error::{HireboardError, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "hireboard::billing=debug")
/// - `HIREBOARD_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install(env_filter, json_logs);
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    install(env_filter, config.logging.json);
}

fn install(env_filter: EnvFilter, json: bool) {
    // try_init: a subscriber may already be installed by the host or a test
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
