//! Subscription lifecycle and entitlement ledger for metered SaaS billing.
//!
//! The engine owns the billing model (products, slots, balances, proration)
//! and delegates all money movement to an external provider behind a client
//! trait. Operations either complete, complete with a required customer
//! action (checkout, 3-D Secure, payment retry), or fail without partial
//! writes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::{AttachRequest, BillingEngine, CacheMode, UsageEvent};
//!
//! let engine = BillingEngine::new(catalog, customers, ledger, lock, provider);
//!
//! // Show the customer what an upgrade costs before charging.
//! let preview = engine.preview_attach(&AttachRequest::new("cus_1", "pro")).await?;
//!
//! // Execute it.
//! let outcome = engine.attach(AttachRequest::new("cus_1", "pro")).await?;
//!
//! // Meter usage against the granted entitlements.
//! engine.track_usage(UsageEvent::new("cus_1", "api_calls", 25)).await?;
//! let balances = engine.balances("cus_1", CacheMode::Cached).await?;
//! ```

pub mod attach;
pub mod cache;
pub mod catalog;
pub mod customer;
pub mod discount;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod outcome;
pub mod proration;
pub mod provider;
pub mod schedule;
pub mod webhook;

// Catalog exports
pub use catalog::{
    Allowance, BillingInterval, CatalogStore, Entitlement, Price, Product, ResetInterval,
    RolloverPolicy, Tier, TierBound, TierMode, UsageModel,
};

// Customer exports
pub use customer::{
    Customer, CustomerProduct, CustomerStore, FeatureOptions, ProductStatus, SlotKey,
};

// Attach exports
pub use attach::{AttachPreview, AttachRequest, AttachScenario};

// Proration exports
pub use proration::{
    BillingPlan, CycleWindow, PlanAction, PlanItem, ProductConfig, ProrationBehavior,
};

// Ledger exports
pub use ledger::{
    BalanceKey, FeatureBalance, LedgerManager, LedgerStore, OverageBehavior, Rollover,
};

// Discount exports
pub use discount::{DiscountInput, DiscountScope, ResolvedDiscount};

// Lock exports
pub use lock::{InMemorySlotLock, SlotGuard, SlotLock};

// Provider exports
pub use provider::{
    BillingProviderClient, CheckoutRequest, CheckoutSession, ProviderAdapter, ProviderInvoice,
    ProviderSubscription, ScheduleRequest, SubscriptionRequest,
};

// Outcome exports
pub use outcome::{PaymentState, RequiredAction, RequiredActionKind};

// Schedule exports
pub use schedule::{SwitchKind, SwitchOptions};

// Cache exports
pub use cache::{CacheMode, CachedBalances};

// Webhook exports
pub use webhook::{parse_callback, CallbackEvent};

// Engine exports
pub use engine::{AttachOutcome, BillingEngine, EngineConfig, UsageEvent};

// Error exports
pub use error::{EngineError, Result};
