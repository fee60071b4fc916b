//! Subscription commands
//!
//! User-invoked operations on the caller's own subscription. Each one calls
//! the provider first and writes locally only from the snapshot the provider
//! returned.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use stowage_shared::{Account, Plan, SubscriptionStatus};
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::accounts::AccountStore;
use crate::context::BillingDeps;
use crate::error::{BillingError, BillingResult, ProviderError};
use crate::events::{record_quietly, BillingAction};
use crate::provider::{
    CheckoutHandle, CheckoutRequest, NewSubscription, PaymentProvider, RefundInfo,
    SubscriptionSnapshot,
};
use crate::refund::{
    days_since_period_start, latest_paid_invoice, refund_latest_payment, within_refund_window,
    RefundOutcome,
};

/// Credit currency when the invoice does not name one
const DEFAULT_CURRENCY: &str = "usd";

/// Cancel attempts for the subscription an upgrade replaced
const REPLACED_CANCEL_RETRIES: usize = 3;

/// Metadata key marking a checkout started by reactivation
pub const FLOW_REACTIVATION: &str = "reactivation";

/// Billing state exposed to the UI and other billing-gated callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub plan: Plan,
    pub plan_label: &'static str,
    pub subscription_status: SubscriptionStatus,
    pub auto_renewal: bool,
    pub price_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub storage_quota_bytes: i64,
}

impl From<&Account> for SubscriptionView {
    fn from(account: &Account) -> Self {
        Self {
            plan: account.plan,
            plan_label: account.plan.label(),
            subscription_status: account.subscription_status,
            auto_renewal: matches!(
                account.subscription_status,
                SubscriptionStatus::Active | SubscriptionStatus::PastDue
            ),
            price_id: account.price_id.clone(),
            current_period_start: account.current_period_start,
            current_period_end: account.current_period_end,
            storage_quota_bytes: account.storage_quota_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalToggleResult {
    pub auto_renewal: bool,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationResult {
    pub refund_eligible: bool,
    pub days_since_start: i64,
    pub refund: Option<RefundInfo>,
    /// Set when an eligible refund could not be issued
    pub refund_error: Option<String>,
    pub subscription_status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactivationResult {
    pub price_id: String,
    pub checkout: CheckoutHandle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResult {
    pub subscription_id: String,
    pub plan: Plan,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub price_id: String,
    /// What the provider actually charged for the new subscription's first
    /// invoice. `None` if the invoice could not be read back.
    pub prorated_amount: Option<i64>,
    pub credit_applied: i64,
}

/// The three upgrade paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradePath {
    /// Customer exists, no subscription on record
    Fresh,
    /// Subscription on record is gone or already canceled upstream
    Stale,
    /// Subscription is live and gets replaced
    Replace,
}

impl UpgradePath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Replace => "replace",
        }
    }
}

/// Billing commands scoped to a single account
#[derive(Clone)]
pub struct BillingCommandService {
    deps: BillingDeps,
}

impl BillingCommandService {
    pub fn new(deps: BillingDeps) -> Self {
        Self { deps }
    }

    /// Current billing state of an account
    pub async fn get_subscription(&self, account_id: Uuid) -> BillingResult<SubscriptionView> {
        let account = self.deps.accounts.require(account_id).await?;
        Ok(SubscriptionView::from(&account))
    }

    /// Turn renewal at period end on or off
    pub async fn toggle_auto_renewal(
        &self,
        account_id: Uuid,
        enable: bool,
    ) -> BillingResult<RenewalToggleResult> {
        let account = self.deps.accounts.require(account_id).await?;

        let subscription_id = match (
            &account.external_customer_id,
            &account.external_subscription_id,
            account.subscription_status,
        ) {
            (
                _,
                _,
                SubscriptionStatus::None | SubscriptionStatus::Canceled | SubscriptionStatus::Incomplete,
            )
            | (None, _, _)
            | (_, None, _) => return Err(BillingError::NoActiveSubscription),
            (Some(_), Some(subscription_id), _) => subscription_id.clone(),
        };

        let snapshot = self
            .deps
            .provider
            .update_subscription(&subscription_id, !enable)
            .await?;

        let latest = self.deps.accounts.require(account_id).await?;
        let reconciliation = self.deps.reconciler.renewal_toggled(&latest, &snapshot);
        let action = if enable {
            BillingAction::AutoRenewalEnabled
        } else {
            BillingAction::AutoRenewalDisabled
        };
        let updated = self
            .deps
            .commit(
                &latest,
                reconciliation,
                action,
                json!({
                    "subscription_id": subscription_id,
                    "cancel_at_period_end": snapshot.cancel_at_period_end,
                }),
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription_id,
            auto_renewal = enable,
            "Updated auto-renewal"
        );

        Ok(RenewalToggleResult {
            auto_renewal: enable,
            subscription_status: updated.subscription_status,
            current_period_end: snapshot.current_period_end,
        })
    }

    /// Cancel immediately, refunding the latest payment inside the window
    pub async fn cancel(&self, account_id: Uuid) -> BillingResult<CancellationResult> {
        let account = self.deps.accounts.require(account_id).await?;

        if account.subscription_status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(
                "Subscription is already canceled".to_string(),
            ));
        }
        let Some(subscription_id) = account.external_subscription_id.clone() else {
            return Err(BillingError::NoActiveSubscription);
        };

        let snapshot = match self.deps.provider.cancel_subscription(&subscription_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    account_id = %account_id,
                    subscription_id = %subscription_id,
                    "Subscription already gone upstream; canceling locally"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        let period_start = snapshot
            .as_ref()
            .and_then(|s| s.current_period_start)
            .or(account.current_period_start);
        let days_since_start = days_since_period_start(period_start, OffsetDateTime::now_utc());
        // Nothing upstream to refund against once the subscription is gone
        let refund_eligible = snapshot.is_some() && within_refund_window(days_since_start);

        let outcome = if refund_eligible {
            refund_latest_payment(self.deps.provider.as_ref(), &subscription_id).await
        } else {
            RefundOutcome::NotEligible
        };

        // Re-read: the deletion webhook may already have landed
        let latest = self.deps.accounts.require(account_id).await?;
        let reconciliation = self.deps.reconciler.canceled(&latest);
        let updated = self
            .deps
            .commit(
                &latest,
                reconciliation,
                BillingAction::SubscriptionCanceled,
                json!({
                    "subscription_id": subscription_id,
                    "days_since_start": days_since_start,
                    "refund_eligible": refund_eligible,
                }),
            )
            .await?;

        match &outcome {
            RefundOutcome::Issued(info) => {
                record_quietly(
                    self.deps.audit.as_ref(),
                    account_id,
                    BillingAction::RefundIssued,
                    json!({
                        "refund_id": info.refund_id,
                        "amount_cents": info.amount_cents,
                    }),
                )
                .await;
            }
            RefundOutcome::Failed { message } => {
                record_quietly(
                    self.deps.audit.as_ref(),
                    account_id,
                    BillingAction::RefundFailed,
                    json!({ "error": message }),
                )
                .await;
            }
            RefundOutcome::NotEligible | RefundOutcome::NothingToRefund => {}
        }

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription_id,
            days_since_start = days_since_start,
            refund_eligible = refund_eligible,
            "Canceled subscription"
        );

        Ok(CancellationResult {
            refund_eligible,
            days_since_start,
            refund: outcome.refund().cloned(),
            refund_error: match outcome {
                RefundOutcome::Failed { message } => Some(message),
                _ => None,
            },
            subscription_status: updated.subscription_status,
        })
    }

    /// Start a checkout that brings a canceled account back. The account is
    /// only touched once that checkout is paid.
    pub async fn reactivate(&self, account_id: Uuid) -> BillingResult<ReactivationResult> {
        let account = self.deps.accounts.require(account_id).await?;

        if account.subscription_status != SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "Only canceled subscriptions can be reactivated (current status: {})",
                account.subscription_status
            )));
        }

        let price_id = account
            .price_id
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| {
                self.deps
                    .prices()
                    .price_id_for(account.plan)
                    .map(String::from)
            })
            .ok_or_else(|| BillingError::PlanResolution(account.plan.to_string()))?;

        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account.id.to_string());
        metadata.insert("flow".to_string(), FLOW_REACTIVATION.to_string());
        metadata.insert("plan".to_string(), account.plan.to_string());

        let checkout = self
            .deps
            .provider
            .create_checkout_session(CheckoutRequest {
                price_id: price_id.clone(),
                customer_email: match account.external_customer_id {
                    Some(_) => None,
                    None => Some(account.email.clone()),
                },
                customer_id: account.external_customer_id.clone(),
                metadata,
                success_url: self.deps.settings.checkout_success_url.clone(),
                cancel_url: self.deps.settings.checkout_cancel_url.clone(),
            })
            .await?;

        record_quietly(
            self.deps.audit.as_ref(),
            account_id,
            BillingAction::ReactivationStarted,
            json!({
                "price_id": price_id,
                "session_id": checkout.session_id,
            }),
        )
        .await;

        tracing::info!(
            account_id = %account_id,
            session_id = %checkout.session_id,
            "Started reactivation checkout"
        );

        Ok(ReactivationResult { price_id, checkout })
    }

    /// Move to a different plan, replacing the subscription upstream
    pub async fn upgrade(&self, account_id: Uuid, new_plan: Plan) -> BillingResult<UpgradeResult> {
        let account = self.deps.accounts.require(account_id).await?;

        let entry = self
            .deps
            .prices()
            .entry(new_plan)
            .ok_or_else(|| BillingError::PlanResolution(new_plan.to_string()))?;

        if new_plan == account.plan {
            return Err(BillingError::NoOp(format!("Already on the {} plan", new_plan)));
        }

        let Some(customer_id) = account.external_customer_id.clone() else {
            return Err(BillingError::InvalidState(
                "No billing customer on file; complete a checkout first".to_string(),
            ));
        };

        let current = match &account.external_subscription_id {
            None => None,
            Some(subscription_id) => {
                match self.deps.provider.retrieve_subscription(subscription_id).await {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(
                            account_id = %account_id,
                            subscription_id = %subscription_id,
                            "Stored subscription no longer exists upstream"
                        );
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let path = match (&account.external_subscription_id, &current) {
            (None, _) => UpgradePath::Fresh,
            (Some(_), Some(snapshot)) if snapshot.status.is_live() => UpgradePath::Replace,
            (Some(_), _) => UpgradePath::Stale,
        };

        let payment_method = match path {
            UpgradePath::Fresh => self
                .deps
                .provider
                .customer_default_payment_method(&customer_id)
                .await?,
            UpgradePath::Stale | UpgradePath::Replace => Some(
                self.resolve_payment_method(
                    current.as_ref(),
                    &customer_id,
                    account.external_subscription_id.as_deref(),
                )
                .await?,
            ),
        };

        let mut credit_applied = 0;
        if let (UpgradePath::Replace, Some(old)) = (path, &current) {
            if let Some(pm) = &payment_method {
                self.deps
                    .provider
                    .set_customer_default_payment_method(&customer_id, pm)
                    .await?;
            }

            let days_since_start = days_since_period_start(
                old.current_period_start.or(account.current_period_start),
                OffsetDateTime::now_utc(),
            );
            if within_refund_window(days_since_start) {
                credit_applied = self.apply_upgrade_credit(&account, &customer_id, old).await?;
            } else {
                tracing::debug!(
                    account_id = %account_id,
                    days_since_start = days_since_start,
                    "Outside credit window; no upgrade credit"
                );
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account.id.to_string());
        metadata.insert("plan".to_string(), new_plan.to_string());

        // The replacement is created and recorded before the old subscription
        // is canceled, so the old one's deletion event finds it superseded
        let snapshot = match self
            .deps
            .provider
            .create_subscription(NewSubscription {
                customer_id: customer_id.clone(),
                price_id: entry.price_id.clone(),
                payment_method,
                metadata,
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_unspent_credit(account_id, &customer_id, credit_applied);
                return Err(e.into());
            }
        };

        if !snapshot.status.is_paid() {
            tracing::warn!(
                account_id = %account_id,
                subscription_id = %snapshot.id,
                status = ?snapshot.status,
                "Replacement subscription was not paid; keeping the current plan"
            );
            self.discard_replacement(account_id, &snapshot.id).await;
            self.report_unspent_credit(account_id, &customer_id, credit_applied);
            return Err(BillingError::Provider(
                ProviderError::declined(format!(
                    "Payment for the {} plan did not go through",
                    new_plan
                ))
                .with_status(402),
            ));
        }

        // Re-read: a webhook may have moved the account while we were upstream
        let latest = self.deps.accounts.require(account_id).await?;
        let reconciliation = self.deps.reconciler.upgraded(&latest, new_plan, &snapshot);
        let committed = self
            .deps
            .commit(
                &latest,
                reconciliation,
                BillingAction::PlanUpgraded,
                json!({
                    "from_plan": account.plan,
                    "to_plan": new_plan,
                    "path": path.as_str(),
                    "subscription_id": snapshot.id,
                    "credit_applied": credit_applied,
                }),
            )
            .await;
        let updated = match committed {
            Ok(updated)
                if updated.external_subscription_id.as_deref() == Some(snapshot.id.as_str()) =>
            {
                updated
            }
            Ok(_) => {
                self.discard_replacement(account_id, &snapshot.id).await;
                self.report_unspent_credit(account_id, &customer_id, credit_applied);
                return Err(BillingError::InvalidState(
                    "Subscription changed during the upgrade; try again".to_string(),
                ));
            }
            Err(e) => {
                self.discard_replacement(account_id, &snapshot.id).await;
                self.report_unspent_credit(account_id, &customer_id, credit_applied);
                return Err(e);
            }
        };

        if let (UpgradePath::Replace, Some(old)) = (path, &current) {
            self.cancel_replaced(account_id, &old.id).await;
        }

        let prorated_amount = self.first_invoice_amount(&snapshot).await;

        tracing::info!(
            account_id = %account_id,
            from_plan = %account.plan,
            to_plan = %new_plan,
            path = path.as_str(),
            credit_applied = credit_applied,
            "Upgraded plan"
        );

        Ok(UpgradeResult {
            subscription_id: snapshot.id.clone(),
            plan: new_plan,
            subscription_status: updated.subscription_status,
            period_start: snapshot.current_period_start,
            period_end: snapshot.current_period_end,
            price_id: entry.price_id,
            prorated_amount,
            credit_applied,
        })
    }

    /// Subscription default, then customer default, then the payment
    /// method behind the latest paid invoice.
    async fn resolve_payment_method(
        &self,
        subscription: Option<&SubscriptionSnapshot>,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> BillingResult<String> {
        if let Some(pm) = subscription.and_then(|s| s.default_payment_method.clone()) {
            return Ok(pm);
        }

        if let Some(pm) = self
            .deps
            .provider
            .customer_default_payment_method(customer_id)
            .await?
        {
            return Ok(pm);
        }

        if let Some(subscription_id) = subscription_id {
            let invoice =
                match latest_paid_invoice(self.deps.provider.as_ref(), subscription_id).await {
                    Ok(invoice) => invoice,
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e.into()),
                };

            if let Some(intent_id) = invoice.and_then(|i| i.payment_intent_id) {
                if let Some(pm) = self
                    .deps
                    .provider
                    .payment_intent_payment_method(&intent_id)
                    .await?
                {
                    return Ok(pm);
                }
            }
        }

        Err(BillingError::NoPaymentMethod(customer_id.to_string()))
    }

    /// Credit the old subscription's latest paid amount to the customer balance
    async fn apply_upgrade_credit(
        &self,
        account: &Account,
        customer_id: &str,
        old: &SubscriptionSnapshot,
    ) -> BillingResult<i64> {
        let Some(invoice) = latest_paid_invoice(self.deps.provider.as_ref(), &old.id).await? else {
            return Ok(0);
        };
        if invoice.amount_paid <= 0 {
            return Ok(0);
        }

        let transaction_id = self
            .deps
            .provider
            .create_balance_credit(
                customer_id,
                invoice.amount_paid,
                invoice.currency.as_deref().unwrap_or(DEFAULT_CURRENCY),
                &format!("Unused {} plan credit on upgrade", account.plan.label()),
            )
            .await?;

        record_quietly(
            self.deps.audit.as_ref(),
            account.id,
            BillingAction::CreditApplied,
            json!({
                "amount_cents": invoice.amount_paid,
                "currency": invoice.currency,
                "invoice_id": invoice.id,
                "balance_transaction_id": transaction_id,
            }),
        )
        .await;

        Ok(invoice.amount_paid)
    }

    /// Cancel the subscription an upgrade replaced. Transient failures are
    /// retried briefly; anything left over is alerted on since the customer
    /// would otherwise be billed twice.
    async fn cancel_replaced(&self, account_id: Uuid, subscription_id: &str) {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .take(REPLACED_CANCEL_RETRIES);
        let result = RetryIf::spawn(
            strategy,
            || self.deps.provider.cancel_subscription(subscription_id),
            |e: &ProviderError| e.is_transient(),
        )
        .await;

        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::error!(
                    alert = true,
                    account_id = %account_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Upgraded, but the replaced subscription is still live upstream"
                );
            }
        }
    }

    /// Best-effort cancel of a replacement the account will not use
    async fn discard_replacement(&self, account_id: Uuid, subscription_id: &str) {
        if let Err(e) = self.deps.provider.cancel_subscription(subscription_id).await {
            tracing::error!(
                alert = true,
                account_id = %account_id,
                subscription_id = %subscription_id,
                error = %e,
                "Could not cancel unused replacement subscription"
            );
        }
    }

    fn report_unspent_credit(&self, account_id: Uuid, customer_id: &str, credit_applied: i64) {
        if credit_applied > 0 {
            tracing::error!(
                alert = true,
                account_id = %account_id,
                customer_id = %customer_id,
                amount_cents = credit_applied,
                "Upgrade failed after crediting the customer balance; credit left in place"
            );
        }
    }

    async fn first_invoice_amount(&self, snapshot: &SubscriptionSnapshot) -> Option<i64> {
        let invoice_id = snapshot.latest_invoice_id.as_deref()?;
        match self.deps.provider.retrieve_invoice(invoice_id).await {
            Ok(invoice) => Some(invoice.amount_due),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %snapshot.id,
                    invoice_id = %invoice_id,
                    error = %e,
                    "Could not read back first invoice of upgraded subscription"
                );
                None
            }
        }
    }
}
