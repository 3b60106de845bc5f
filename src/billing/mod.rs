//! Subscription entitlements for job posters.
//!
//! Keeps the cached subscription and usage-limit rows honest against an
//! external billing authority, derives feature flags from them, and enforces
//! the monthly job-posting allowance.
//!
//! # Example
//!
//! ```rust,ignore
//! use hireboard::billing::{
//!     EntitlementsService, HttpBillingAuthority, MemoryEntitlementStore, StaticIdentityProvider,
//! };
//!
//! let authority = HttpBillingAuthority::from_config(&config.entitlements)?;
//! let service = EntitlementsService::builder(store, authority, identity)
//!     .config(config.entitlements.clone())
//!     .audit(Arc::new(TracingAuditLogger))
//!     .build();
//!
//! service.mount().await?;
//! service.spawn_polling();
//!
//! match service.can_post().await? {
//!     decision if decision.is_allowed() => { /* show the form */ }
//!     decision => show(Notice::upgrade_prompt(&decision, service.bundle().tier)),
//! }
//! ```

pub mod audit;
pub mod check;
pub mod clock;
pub mod consistency;
pub mod entitlements;
pub mod error;
pub mod gate;
pub mod identity;
pub mod notice;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod tier;

// Tier exports
pub use tier::{Tier, UNBOUNDED_POST_LIMIT, limit_for_tier};

// Storage exports
pub use storage::{
    BillingResult, EntitlementStore, MemoryEntitlementStore, SubscriptionRecord, TimeoutStore,
    UsageLimitPatch, UsageLimitRecord, UsageReservation, monthly_window,
};

// Billing authority exports
pub use check::{BillingAuthority, BillingCheck, HttpBillingAuthority, decode_check_response};

// Identity exports
pub use identity::{Identity, IdentityProvider, IdentityToken, Session, StaticIdentityProvider};

// Reconciliation exports
pub use reconcile::{BillingReconciler, ReconcileDifference, ReconcileReport};
pub use consistency::{
    ResolveAction, ResolvedEntitlements, ResolvedUsage, TierConsistencyResolver,
};

// Entitlement exports
pub use entitlements::{Feature, FeatureCheckResult, FeatureEntitlementBundle, project};
pub use gate::{PostDecision, PostOutcome, PostReservation, PostingLimitGate, ReserveOutcome};

// Refresh exports
pub use scheduler::{
    PaymentReturnKind, PaymentReturnMarker, RefreshDecision, RefreshPolicy, RefreshScheduler,
    RefreshState, RefreshTicket, RefreshTrigger, strip_markers,
};
pub use service::{
    EntitlementsService, EntitlementsServiceBuilder, EntitlementsSnapshot, NavigationOutcome,
    RefreshOutcome,
};

// Supporting exports
pub use audit::{EntitlementAuditEvent, EntitlementAuditLogger, NoOpAuditLogger, TracingAuditLogger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::BillingError;
pub use notice::{Notice, NoticeAction, NoticeKind, suggested_upgrade};
