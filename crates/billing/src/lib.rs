// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::OrphanedPayment carries session context
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stowage Billing Module
//!
//! Keeps each account's subscription state consistent with the payment
//! provider across signups, webhooks and user-invoked billing commands.
//!
//! ## Features
//!
//! - **Signup Checkout**: Stage a signup behind a provider checkout and create
//!   the account exactly once when it is paid
//! - **Webhooks**: Verified, replay-safe ingestion of provider events
//! - **Reconciliation**: Provider snapshots drive a guarded subscription lifecycle
//! - **Auto-renewal**: Toggle cancel-at-period-end on the live subscription
//! - **Cancellation**: Immediate cancel with a refund inside the first 7 days
//! - **Reactivation**: New checkout for canceled accounts
//! - **Upgrades**: Replace the subscription, crediting the old payment inside 7 days
//! - **Side Effects**: Rate-limited, best-effort notification delivery
//! - **Invariants**: Runnable consistency checks over stored accounts

pub mod accounts;
pub mod checkout;
pub mod client;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod provider;
pub mod reconciler;
pub mod refund;
pub mod staging;
pub mod stripe_provider;
pub mod subscriptions;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{
    AccountStore, AccountUpdate, ExpectedState, InMemoryAccountStore, NewAccount, PeriodUpdate,
    PgAccountStore,
};

// Checkout
pub use checkout::{CheckoutService, CompletedSignup, SignupRequest};

// Client
pub use client::{PlanEntry, PriceIds, StripeClient, StripeConfig};

// Context
pub use context::{BillingDeps, BillingSettings};

// Dispatcher
pub use dispatcher::{
    HttpNotificationSink, SideEffectDispatcher, SideEffectIntent, SideEffectSink, TracingSink,
};

// Error
pub use error::{BillingError, BillingResult, ProviderError, ProviderErrorKind};

// Events
pub use events::{AuditLog, BillingAction, MemoryAuditLog, PgAuditLog, TracingAuditLog};

// Invariants
pub use invariants::{
    check_accounts, InvariantCheckSummary, InvariantChecker, InvariantViolation,
    ViolationSeverity,
};

// Ledger
pub use ledger::{EventOutcome, InMemoryEventLedger, LedgerClaim, PgEventLedger, WebhookEventLedger};

// Provider
pub use provider::{
    CheckoutHandle, CheckoutSessionSnapshot, InvoiceSnapshot, PaymentProvider,
    ProviderSubscriptionStatus, RefundInfo, SubscriptionSnapshot,
};
pub use stripe_provider::StripeProvider;

// Reconciler
pub use reconciler::{status_from_snapshot, SubscriptionReconciler};

// Refund
pub use refund::{RefundOutcome, REFUND_WINDOW_DAYS};

// Staging
pub use staging::{
    EnterpriseTerms, InMemorySignupStaging, PendingSignup, RedisSignupStaging, SignupStaging,
};

// Subscriptions
pub use subscriptions::{
    BillingCommandService, CancellationResult, ReactivationResult, RenewalToggleResult,
    SubscriptionView, UpgradeResult,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub deps: BillingDeps,
    pub checkout: CheckoutService,
    pub commands: BillingCommandService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service backed by Stripe, Postgres and Redis, reading
    /// configuration from environment variables
    pub async fn from_env(pool: PgPool, dispatcher: SideEffectDispatcher) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| BillingError::Config("REDIS_URL not set".to_string()))?;
        let staging = RedisSignupStaging::connect(&redis_url).await?;

        let settings = BillingSettings::from_stripe_config(stripe.config());
        let reconciler = SubscriptionReconciler::new(stripe.config().prices.clone());

        // BILLING_AUDIT_SINK=tracing keeps the audit trail in the logs only
        let audit: Arc<dyn AuditLog> = match std::env::var("BILLING_AUDIT_SINK").as_deref() {
            Ok("tracing") => Arc::new(TracingAuditLog),
            _ => Arc::new(PgAuditLog::new(pool.clone())),
        };

        Ok(Self::new(BillingDeps {
            provider: Arc::new(StripeProvider::new(stripe)),
            accounts: Arc::new(PgAccountStore::new(pool.clone())),
            staging: Arc::new(staging),
            ledger: Arc::new(PgEventLedger::new(pool)),
            audit,
            dispatcher,
            reconciler,
            settings,
        }))
    }

    /// Create a billing service over explicit collaborators
    pub fn new(deps: BillingDeps) -> Self {
        Self {
            checkout: CheckoutService::new(deps.clone()),
            commands: BillingCommandService::new(deps.clone()),
            webhooks: WebhookHandler::new(deps.clone()),
            deps,
        }
    }
}
