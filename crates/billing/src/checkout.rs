//! Paid signup
//!
//! A signup is staged against a checkout session and only becomes an account
//! once the checkout is paid. Two paths can observe the payment: the client
//! calling back right after checkout, and the provider's checkout webhook.
//! Whichever claims the staged signup first creates the account; the other
//! finds it by email.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use stowage_shared::{Account, Plan};

use crate::accounts::{AccountStore, NewAccount};
use crate::context::{checkout_email, BillingDeps};
use crate::error::{BillingError, BillingResult};
use crate::events::{record_quietly, BillingAction};
use crate::provider::{
    CheckoutHandle, CheckoutRequest, CheckoutSessionSnapshot, PaymentProvider,
    SubscriptionSnapshot,
};
use crate::staging::{EnterpriseTerms, PendingSignup, SignupStaging};

pub const FLOW_SIGNUP: &str = "signup";

/// Validated signup details. The credential is already hashed.
#[derive(Debug, Clone)]
pub struct SignupRequest {
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub plan: Plan,
    pub enterprise: Option<EnterpriseTerms>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSignup {
    pub account: Account,
    /// False when the other claimant created the account
    pub created: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    deps: BillingDeps,
}

impl CheckoutService {
    pub fn new(deps: BillingDeps) -> Self {
        Self { deps }
    }

    /// Open a checkout for a new account and stage the signup behind it
    pub async fn begin_signup(&self, req: SignupRequest) -> BillingResult<CheckoutHandle> {
        let email = req.email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::Validation("A valid email is required".to_string()));
        }

        if self.deps.accounts.find_by_email(&email).await?.is_some() {
            return Err(BillingError::Conflict(format!(
                "An account already exists for {}",
                email
            )));
        }

        let custom_price = req
            .enterprise
            .as_ref()
            .and_then(|terms| terms.price_id.clone())
            .filter(|_| req.plan == Plan::Enterprise);
        let price_id = custom_price
            .or_else(|| self.deps.prices().price_id_for(req.plan).map(String::from))
            .ok_or_else(|| BillingError::PlanResolution(req.plan.to_string()))?;

        let storage_quota_bytes = req
            .enterprise
            .as_ref()
            .and_then(|terms| terms.storage_quota_bytes)
            .unwrap_or_else(|| req.plan.storage_quota_bytes());

        let mut metadata = HashMap::new();
        metadata.insert("email".to_string(), email.clone());
        metadata.insert("plan".to_string(), req.plan.to_string());
        metadata.insert("flow".to_string(), FLOW_SIGNUP.to_string());

        let handle = self
            .deps
            .provider
            .create_checkout_session(CheckoutRequest {
                price_id,
                customer_email: Some(email.clone()),
                customer_id: None,
                metadata,
                success_url: self.deps.settings.checkout_success_url.clone(),
                cancel_url: self.deps.settings.checkout_cancel_url.clone(),
            })
            .await?;

        let pending = PendingSignup {
            email: email.clone(),
            password_hash: req.password_hash,
            display_name: req.display_name,
            plan: req.plan,
            storage_quota_bytes,
            enterprise: req.enterprise,
        };
        self.deps
            .staging
            .stage(&handle.session_id, &pending, self.deps.settings.signup_ttl)
            .await?;

        tracing::info!(
            session_id = %handle.session_id,
            plan = %pending.plan,
            "Started signup checkout"
        );
        Ok(handle)
    }

    /// Client callback after checkout. Returns the account whichever path
    /// created it.
    pub async fn complete(&self, session_id: &str) -> BillingResult<CompletedSignup> {
        let session = self
            .deps
            .provider
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BillingError::NotFound(format!("Checkout session {} not found", session_id))
                } else {
                    BillingError::from(e)
                }
            })?;
        if !session.is_paid() {
            return Err(BillingError::InvalidState(
                "Checkout has not been paid".to_string(),
            ));
        }

        match self.deps.staging.claim(session_id).await? {
            Some(pending) => {
                let account = self.create_from_pending(session_id, pending).await?;
                let account = self.activate_quietly(account, &session).await;
                Ok(CompletedSignup {
                    account,
                    created: true,
                })
            }
            None => {
                let email = checkout_email(&session).ok_or_else(|| {
                    BillingError::NotFound(format!("No pending signup for {}", session_id))
                })?;
                match self.deps.find_account_with_backoff(&email).await? {
                    Some(account) => Ok(CompletedSignup {
                        account,
                        created: false,
                    }),
                    None => Err(BillingError::NotFound(format!(
                        "No pending signup for {}",
                        session_id
                    ))),
                }
            }
        }
    }

    /// Checkout webhook. Finds or creates the account and activates it,
    /// queuing welcome, receipt and admin notifications unless the client
    /// callback already did.
    pub(crate) async fn on_checkout_completed(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<Option<Account>> {
        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed without payment yet; waiting"
            );
            return Ok(None);
        }

        let account = match self.deps.resolve_checkout_account(session).await? {
            Some(account) => account,
            None => self.claim_or_find(session).await?,
        };

        let subscription_id = session.subscription_id.as_deref().ok_or_else(|| {
            BillingError::Internal(format!("Checkout {} has no subscription", session.id))
        })?;
        let subscription = self
            .deps
            .provider
            .retrieve_subscription(subscription_id)
            .await?;

        let amount_paid = self.first_payment(&subscription).await?;

        let reconciliation =
            self.deps
                .reconciler
                .checkout_completed(&account, session, &subscription, amount_paid);
        let updated = self
            .deps
            .commit(
                &account,
                reconciliation,
                BillingAction::SubscriptionActivated,
                json!({
                    "session_id": session.id,
                    "subscription_id": subscription.id,
                    "amount_paid": amount_paid,
                    "flow": session.metadata.get("flow"),
                }),
            )
            .await?;

        Ok(Some(updated))
    }

    async fn first_payment(&self, subscription: &SubscriptionSnapshot) -> BillingResult<i64> {
        match subscription.latest_invoice_id.as_deref() {
            Some(invoice_id) => Ok(self
                .deps
                .provider
                .retrieve_invoice(invoice_id)
                .await?
                .amount_paid),
            None => Ok(0),
        }
    }

    /// No account exists yet: take the staged signup, or wait for whoever did
    async fn claim_or_find(&self, session: &CheckoutSessionSnapshot) -> BillingResult<Account> {
        if let Some(pending) = self.deps.staging.claim(&session.id).await? {
            return self.create_from_pending(&session.id, pending).await;
        }

        let email = checkout_email(session);
        if let Some(email) = &email {
            if let Some(account) = self.deps.find_account_with_backoff(email).await? {
                return Ok(account);
            }
        }

        tracing::error!(
            alert = true,
            session_id = %session.id,
            customer_id = ?session.customer_id,
            email = ?email,
            "Payment completed with no pending signup and no account"
        );
        Err(BillingError::OrphanedPayment {
            session_id: session.id.clone(),
            email,
        })
    }

    /// Create the account for a claimed signup. On failure the signup is put
    /// back so a retry can claim it again.
    async fn create_from_pending(
        &self,
        session_id: &str,
        pending: PendingSignup,
    ) -> BillingResult<Account> {
        let new = NewAccount {
            email: pending.email.clone(),
            password_hash: pending.password_hash.clone(),
            display_name: pending.display_name.clone(),
            plan: pending.plan,
            storage_quota_bytes: pending.storage_quota_bytes,
        };

        match self.deps.accounts.create(new).await {
            Ok(account) => {
                tracing::info!(
                    account_id = %account.id,
                    session_id = %session_id,
                    plan = %account.plan,
                    "Created account from paid signup"
                );
                record_quietly(
                    self.deps.audit.as_ref(),
                    account.id,
                    BillingAction::SignupCompleted,
                    json!({ "session_id": session_id, "plan": account.plan }),
                )
                .await;
                Ok(account)
            }
            Err(e) => {
                if let Err(restage) = self
                    .deps
                    .staging
                    .stage(session_id, &pending, self.deps.settings.signup_ttl)
                    .await
                {
                    tracing::error!(
                        session_id = %session_id,
                        error = %restage,
                        "Failed to restore pending signup after account creation failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Attach the subscription right away so the client sees an active
    /// account, and send the activation notifications if this call is the one
    /// that activates it. The checkout webhook repeats this if it fails here.
    async fn activate_quietly(&self, account: Account, session: &CheckoutSessionSnapshot) -> Account {
        let Some(subscription_id) = session.subscription_id.as_deref() else {
            return account;
        };

        let result = async {
            let subscription = self
                .deps
                .provider
                .retrieve_subscription(subscription_id)
                .await?;
            let amount_paid = self.first_payment(&subscription).await?;
            let reconciliation = self.deps.reconciler.checkout_completed(
                &account,
                session,
                &subscription,
                amount_paid,
            );
            self.deps
                .commit(
                    &account,
                    reconciliation,
                    BillingAction::SubscriptionActivated,
                    json!({
                        "session_id": session.id,
                        "subscription_id": subscription.id,
                        "source": "checkout_callback",
                    }),
                )
                .await
        }
        .await;

        match result {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(
                    account_id = %account.id,
                    session_id = %session.id,
                    error = %e,
                    "Could not activate at checkout callback; webhook will finish it"
                );
                match self.deps.accounts.get(account.id).await {
                    Ok(Some(latest)) => latest,
                    _ => account,
                }
            }
        }
    }
}
