//! Shared collaborators for the billing services

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stowage_shared::Account;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::accounts::AccountStore;
use crate::client::{PriceIds, StripeConfig};
use crate::dispatcher::SideEffectDispatcher;
use crate::error::BillingResult;
use crate::events::{record_quietly, AuditLog, BillingAction};
use crate::ledger::WebhookEventLedger;
use crate::provider::{CheckoutSessionSnapshot, PaymentProvider};
use crate::reconciler::{Reconciliation, SubscriptionReconciler};
use crate::staging::SignupStaging;

/// Default lifetime of a staged signup (24 hours)
pub const DEFAULT_SIGNUP_TTL: Duration = Duration::from_secs(86_400);

/// Lookups after a lost staging claim: 50ms, 100ms, 200ms, 400ms, 800ms
pub const DEFAULT_LOOKUP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub signup_ttl: Duration,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    /// Retries when waiting for a concurrently created account to appear
    pub account_lookup_attempts: usize,
}

impl BillingSettings {
    pub fn from_stripe_config(config: &StripeConfig) -> Self {
        Self {
            checkout_success_url: config.checkout_success_url.clone(),
            checkout_cancel_url: config.checkout_cancel_url.clone(),
            signup_ttl: std::env::var("SIGNUP_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SIGNUP_TTL),
            webhook_secret: config.webhook_secret.clone(),
            webhook_tolerance_secs: config.webhook_tolerance_secs,
            account_lookup_attempts: DEFAULT_LOOKUP_ATTEMPTS,
        }
    }
}

/// Everything a billing service talks to
#[derive(Clone)]
pub struct BillingDeps {
    pub provider: Arc<dyn PaymentProvider>,
    pub accounts: Arc<dyn AccountStore>,
    pub staging: Arc<dyn SignupStaging>,
    pub ledger: Arc<dyn WebhookEventLedger>,
    pub audit: Arc<dyn AuditLog>,
    pub dispatcher: SideEffectDispatcher,
    pub reconciler: SubscriptionReconciler,
    pub settings: BillingSettings,
}

impl BillingDeps {
    pub fn prices(&self) -> &PriceIds {
        self.reconciler.prices()
    }

    /// Account a completed checkout belongs to: explicit account id in the
    /// session metadata, then the checkout email, then the provider customer.
    pub(crate) async fn resolve_checkout_account(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<Option<Account>> {
        if let Some(id) = session
            .metadata
            .get("account_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            if let Some(account) = self.accounts.get(id).await? {
                return Ok(Some(account));
            }
        }

        if let Some(email) = checkout_email(session) {
            if let Some(account) = self.accounts.find_by_email(&email).await? {
                return Ok(Some(account));
            }
        }

        match &session.customer_id {
            Some(customer_id) => self.accounts.find_by_customer_id(customer_id).await,
            None => Ok(None),
        }
    }

    /// Wait briefly for an account that another claimant is creating
    pub(crate) async fn find_account_with_backoff(
        &self,
        email: &str,
    ) -> BillingResult<Option<Account>> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(25)
            .take(self.settings.account_lookup_attempts);

        let result = Retry::spawn(strategy, || async {
            match self.accounts.find_by_email(email).await {
                Ok(Some(account)) => Ok(account),
                Ok(None) => Err(None),
                Err(e) => Err(Some(e)),
            }
        })
        .await;

        match result {
            Ok(account) => Ok(Some(account)),
            Err(None) => Ok(None),
            Err(Some(e)) => Err(e),
        }
    }

    /// Write a reconciliation: persist the update, audit it, then queue its
    /// side effects. Returns the account as stored afterwards.
    pub(crate) async fn commit(
        &self,
        account: &Account,
        reconciliation: Reconciliation,
        action: BillingAction,
        metadata: serde_json::Value,
    ) -> BillingResult<Account> {
        if let Some(rejection) = reconciliation.rejected {
            record_quietly(
                self.audit.as_ref(),
                account.id,
                BillingAction::TransitionRejected,
                json!({
                    "from": rejection.from,
                    "to": rejection.to,
                    "attempted": action,
                    "context": metadata.clone(),
                }),
            )
            .await;
        }

        if let Some(reason) = reconciliation.skipped {
            tracing::info!(
                account_id = %account.id,
                action = %action,
                reason = reason,
                "Skipped reconciliation"
            );
            return Ok(account.clone());
        }

        let updated = if reconciliation.update.is_empty() {
            account.clone()
        } else {
            let update = reconciliation.update.expecting(account);
            self.accounts.update(account.id, &update).await?
        };

        if updated.subscription_status != account.subscription_status {
            tracing::info!(
                account_id = %account.id,
                from = %account.subscription_status,
                to = %updated.subscription_status,
                action = %action,
                "Subscription status changed"
            );
        }

        record_quietly(self.audit.as_ref(), account.id, action, metadata).await;

        for intent in reconciliation.intents {
            self.dispatcher.send(intent);
        }

        Ok(updated)
    }
}

/// Email the customer checked out with
pub(crate) fn checkout_email(session: &CheckoutSessionSnapshot) -> Option<String> {
    session
        .customer_email
        .clone()
        .or_else(|| session.metadata.get("email").cloned())
        .filter(|e| !e.is_empty())
}
