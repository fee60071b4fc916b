//! Scriptable in-memory payment provider
//!
//! Behaves like the provider for the calls billing makes: subscriptions,
//! invoices, customer balance, refunds and checkout sessions. Every mutating
//! call is recorded so tests can assert on what was sent upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

use crate::accounts::InMemoryAccountStore;
use crate::client::PriceIds;
use crate::context::{BillingDeps, BillingSettings, DEFAULT_SIGNUP_TTL};
use crate::dispatcher::{SideEffectDispatcher, SideEffectIntent};
use crate::error::ProviderError;
use crate::events::MemoryAuditLog;
use crate::ledger::InMemoryEventLedger;
use crate::reconciler::SubscriptionReconciler;
use crate::staging::InMemorySignupStaging;
use crate::provider::{
    CheckoutHandle, CheckoutRequest, CheckoutSessionSnapshot, InvoiceSnapshot, NewSubscription,
    PaymentProvider, PaymentReference, ProviderResult, ProviderSubscriptionStatus, RefundInfo,
    SubscriptionSnapshot,
};

const PERIOD_DAYS: i64 = 30;

/// Signing secret used by [`test_deps`]
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

pub const STARTER_CENTS: i64 = 500;
pub const PRO_CENTS: i64 = 1500;
pub const BUSINESS_CENTS: i64 = 4900;

pub fn test_prices() -> PriceIds {
    PriceIds {
        starter: "price_starter".into(),
        pro: "price_pro".into(),
        business: "price_business".into(),
        enterprise: None,
    }
}

/// In-memory collaborators plus handles to inspect each of them
pub struct TestHarness {
    pub deps: BillingDeps,
    pub provider: Arc<MockPaymentProvider>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub staging: Arc<InMemorySignupStaging>,
    pub ledger: Arc<InMemoryEventLedger>,
    pub audit: Arc<MemoryAuditLog>,
    /// Side effects queued by the services, in order
    pub intents: mpsc::Receiver<SideEffectIntent>,
}

pub fn test_deps() -> TestHarness {
    let provider = Arc::new(MockPaymentProvider::new());
    provider.set_price("price_starter", STARTER_CENTS);
    provider.set_price("price_pro", PRO_CENTS);
    provider.set_price("price_business", BUSINESS_CENTS);

    let accounts = Arc::new(InMemoryAccountStore::new());
    let staging = Arc::new(InMemorySignupStaging::new());
    let ledger = Arc::new(InMemoryEventLedger::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let (dispatcher, intents) = SideEffectDispatcher::channel(256);

    let deps = BillingDeps {
        provider: provider.clone(),
        accounts: accounts.clone(),
        staging: staging.clone(),
        ledger: ledger.clone(),
        audit: audit.clone(),
        dispatcher,
        reconciler: SubscriptionReconciler::new(test_prices()),
        settings: BillingSettings {
            checkout_success_url: "https://app.test/signup/complete".into(),
            checkout_cancel_url: "https://app.test/signup".into(),
            signup_ttl: DEFAULT_SIGNUP_TTL,
            webhook_secret: TEST_WEBHOOK_SECRET.into(),
            webhook_tolerance_secs: crate::client::DEFAULT_WEBHOOK_TOLERANCE_SECS,
            account_lookup_attempts: 3,
        },
    };

    TestHarness {
        deps,
        provider,
        accounts,
        staging,
        ledger,
        audit,
        intents,
    }
}

/// Drain every intent queued so far
pub fn drain_intents(rx: &mut mpsc::Receiver<SideEffectIntent>) -> Vec<SideEffectIntent> {
    let mut out = Vec::new();
    while let Ok(intent) = rx.try_recv() {
        out.push(intent);
    }
    out
}

#[derive(Default)]
struct MockState {
    counter: u64,
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    invoices: HashMap<String, InvoiceSnapshot>,
    prices: HashMap<String, i64>,
    balances: HashMap<String, i64>,
    customer_pms: HashMap<String, String>,
    intent_pms: HashMap<String, String>,
    sessions: HashMap<String, CheckoutSessionSnapshot>,

    fail_refunds: bool,
    fail_next_create: Option<ProviderError>,
    fail_next_cancel: Option<ProviderError>,
    next_create_status: Option<ProviderSubscriptionStatus>,

    credits: Vec<(String, i64)>,
    credit_currencies: Vec<(String, String)>,
    refunds: Vec<PaymentReference>,
    created: Vec<NewSubscription>,
    canceled: Vec<String>,
    updates: Vec<(String, bool)>,
    checkouts: Vec<CheckoutRequest>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_mock_{}", prefix, self.counter)
    }

    /// Issue a paid invoice for `amount` and return its id
    fn issue_invoice(
        &mut self,
        subscription_id: &str,
        customer_id: &str,
        amount: i64,
        billing_reason: &str,
        period_start: OffsetDateTime,
    ) -> String {
        let id = self.next_id("in");
        let charge_id = (amount > 0).then(|| self.next_id("ch"));
        self.invoices.insert(
            id.clone(),
            InvoiceSnapshot {
                id: id.clone(),
                subscription_id: Some(subscription_id.to_string()),
                customer_id: Some(customer_id.to_string()),
                paid: true,
                amount_paid: amount,
                amount_due: amount,
                currency: Some("usd".into()),
                billing_reason: Some(billing_reason.to_string()),
                charge_id,
                payment_intent_id: None,
                period_start: Some(period_start),
                period_end: Some(period_start + Duration::days(PERIOD_DAYS)),
                created: Some(OffsetDateTime::now_utc()),
            },
        );
        id
    }
}

#[derive(Default)]
pub struct MockPaymentProvider {
    state: Mutex<MockState>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Monthly amount charged for a price
    pub fn set_price(&self, price_id: &str, amount_cents: i64) {
        self.state().prices.insert(price_id.to_string(), amount_cents);
    }

    pub fn insert_subscription(&self, snapshot: SubscriptionSnapshot) {
        self.state()
            .subscriptions
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn insert_invoice(&self, invoice: InvoiceSnapshot) {
        self.state().invoices.insert(invoice.id.clone(), invoice);
    }

    pub fn set_customer_default_pm(&self, customer_id: &str, payment_method: &str) {
        self.state()
            .customer_pms
            .insert(customer_id.to_string(), payment_method.to_string());
    }

    pub fn set_payment_intent_pm(&self, payment_intent_id: &str, payment_method: &str) {
        self.state()
            .intent_pms
            .insert(payment_intent_id.to_string(), payment_method.to_string());
    }

    pub fn insert_checkout_session(&self, session: CheckoutSessionSnapshot) {
        self.state().sessions.insert(session.id.clone(), session);
    }

    /// An active subscription whose first invoice was paid at `period_start`
    pub fn seed_active_subscription(
        &self,
        subscription_id: &str,
        customer_id: &str,
        price_id: &str,
        period_start: OffsetDateTime,
        amount_paid: i64,
    ) -> SubscriptionSnapshot {
        let mut state = self.state();
        let invoice_id = state.issue_invoice(
            subscription_id,
            customer_id,
            amount_paid,
            "subscription_create",
            period_start,
        );
        let snapshot = SubscriptionSnapshot {
            id: subscription_id.to_string(),
            customer_id: customer_id.to_string(),
            status: ProviderSubscriptionStatus::Active,
            cancel_at_period_end: false,
            price_id: Some(price_id.to_string()),
            current_period_start: Some(period_start),
            current_period_end: Some(period_start + Duration::days(PERIOD_DAYS)),
            default_payment_method: None,
            latest_invoice_id: Some(invoice_id),
        };
        state
            .subscriptions
            .insert(subscription_id.to_string(), snapshot.clone());
        snapshot
    }

    /// Simulate the customer paying a checkout session. Creates the customer's
    /// subscription and first invoice and returns the paid subscription.
    pub fn complete_checkout_session(
        &self,
        session_id: &str,
        customer_id: &str,
    ) -> Option<SubscriptionSnapshot> {
        let (price_id, metadata) = {
            let state = self.state();
            let session = state.sessions.get(session_id)?;
            let price_id = session.metadata.get("price_id").cloned()?;
            (price_id, session.metadata.clone())
        };

        let amount = self.state().prices.get(&price_id).copied().unwrap_or(0);
        let subscription_id = self.state().next_id("sub");
        let snapshot = self.seed_active_subscription(
            &subscription_id,
            customer_id,
            &price_id,
            OffsetDateTime::now_utc(),
            amount,
        );

        let mut state = self.state();
        let session = state.sessions.get_mut(session_id)?;
        session.customer_id = Some(customer_id.to_string());
        session.subscription_id = Some(subscription_id);
        session.status = Some("complete".into());
        session.payment_status = Some("paid".into());
        session.metadata = metadata;
        Some(snapshot)
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    pub fn fail_refunds(&self) {
        self.state().fail_refunds = true;
    }

    pub fn fail_next_create(&self, error: ProviderError) {
        self.state().fail_next_create = Some(error);
    }

    pub fn fail_next_cancel(&self, error: ProviderError) {
        self.state().fail_next_cancel = Some(error);
    }

    /// Status of the next created subscription. Anything other than active or
    /// trialing leaves its first invoice unpaid and the balance untouched.
    pub fn create_next_with_status(&self, status: ProviderSubscriptionStatus) {
        self.state().next_create_status = Some(status);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn subscription(&self, id: &str) -> Option<SubscriptionSnapshot> {
        self.state().subscriptions.get(id).cloned()
    }

    pub fn invoice(&self, id: &str) -> Option<InvoiceSnapshot> {
        self.state().invoices.get(id).cloned()
    }

    /// Customer balance in cents. Negative means credit.
    pub fn balance(&self, customer_id: &str) -> i64 {
        self.state().balances.get(customer_id).copied().unwrap_or(0)
    }

    pub fn credits(&self) -> Vec<(String, i64)> {
        self.state().credits.clone()
    }

    /// Currency of each balance credit, in order
    pub fn credit_currencies(&self) -> Vec<(String, String)> {
        self.state().credit_currencies.clone()
    }

    pub fn refunds(&self) -> Vec<PaymentReference> {
        self.state().refunds.clone()
    }

    pub fn created(&self) -> Vec<NewSubscription> {
        self.state().created.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state().canceled.clone()
    }

    pub fn updates(&self) -> Vec<(String, bool)> {
        self.state().updates.clone()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.state().checkouts.clone()
    }

    pub fn customer_default_pm(&self, customer_id: &str) -> Option<String> {
        self.state().customer_pms.get(customer_id).cloned()
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_subscription(
        &self,
        req: NewSubscription,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        state.created.push(req.clone());
        let status = state
            .next_create_status
            .take()
            .unwrap_or(ProviderSubscriptionStatus::Active);

        let price = state.prices.get(&req.price_id).copied().unwrap_or(0);
        let balance = state.balances.get(&req.customer_id).copied().unwrap_or(0);
        let amount_due = (price + balance).max(0);
        if status.is_paid() {
            state
                .balances
                .insert(req.customer_id.clone(), (price + balance).min(0));
        }

        let now = OffsetDateTime::now_utc();
        let subscription_id = state.next_id("sub");
        let invoice_id = state.issue_invoice(
            &subscription_id,
            &req.customer_id,
            amount_due,
            "subscription_create",
            now,
        );
        if !status.is_paid() {
            if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
                invoice.paid = false;
                invoice.amount_paid = 0;
                invoice.charge_id = None;
            }
        }

        let snapshot = SubscriptionSnapshot {
            id: subscription_id.clone(),
            customer_id: req.customer_id,
            status,
            cancel_at_period_end: false,
            price_id: Some(req.price_id),
            current_period_start: Some(now),
            current_period_end: Some(now + Duration::days(PERIOD_DAYS)),
            default_payment_method: req.payment_method,
            latest_invoice_id: Some(invoice_id),
        };
        state.subscriptions.insert(subscription_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> ProviderResult<SubscriptionSnapshot> {
        self.subscription(subscription_id).ok_or_else(|| {
            ProviderError::not_found(format!("No such subscription: {}", subscription_id))
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_cancel.take() {
            return Err(err);
        }
        let snapshot = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            ProviderError::not_found(format!("No such subscription: {}", subscription_id))
        })?;
        snapshot.status = ProviderSubscriptionStatus::Canceled;
        let snapshot = snapshot.clone();
        state.canceled.push(subscription_id.to_string());
        Ok(snapshot)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let mut state = self.state();
        let snapshot = state.subscriptions.get_mut(subscription_id).ok_or_else(|| {
            ProviderError::not_found(format!("No such subscription: {}", subscription_id))
        })?;
        snapshot.cancel_at_period_end = cancel_at_period_end;
        let snapshot = snapshot.clone();
        state
            .updates
            .push((subscription_id.to_string(), cancel_at_period_end));
        Ok(snapshot)
    }

    async fn list_paid_invoices(
        &self,
        subscription_id: &str,
        limit: u64,
    ) -> ProviderResult<Vec<InvoiceSnapshot>> {
        let mut invoices: Vec<_> = self
            .state()
            .invoices
            .values()
            .filter(|i| i.paid && i.subscription_id.as_deref() == Some(subscription_id))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        invoices.truncate(limit as usize);
        Ok(invoices)
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProviderResult<InvoiceSnapshot> {
        self.invoice(invoice_id)
            .ok_or_else(|| ProviderError::not_found(format!("No such invoice: {}", invoice_id)))
    }

    async fn refund_payment(&self, payment: &PaymentReference) -> ProviderResult<RefundInfo> {
        let mut state = self.state();
        if state.fail_refunds {
            return Err(ProviderError::permanent("Charge has already been refunded").with_status(400));
        }

        let amount = state
            .invoices
            .values()
            .find(|i| match payment {
                PaymentReference::Charge(id) => i.charge_id.as_deref() == Some(id.as_str()),
                PaymentReference::PaymentIntent(id) => {
                    i.payment_intent_id.as_deref() == Some(id.as_str())
                }
            })
            .map(|i| i.amount_paid)
            .unwrap_or(0);

        state.refunds.push(payment.clone());
        let refund_id = state.next_id("re");
        Ok(RefundInfo {
            refund_id,
            amount_cents: amount,
            status: "succeeded".into(),
        })
    }

    async fn create_balance_credit(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        _reason: &str,
    ) -> ProviderResult<String> {
        let mut state = self.state();
        *state.balances.entry(customer_id.to_string()).or_insert(0) -= amount_cents;
        state.credits.push((customer_id.to_string(), amount_cents));
        state
            .credit_currencies
            .push((customer_id.to_string(), currency.to_string()));
        Ok(state.next_id("cbtxn"))
    }

    async fn customer_default_payment_method(
        &self,
        customer_id: &str,
    ) -> ProviderResult<Option<String>> {
        Ok(self.customer_default_pm(customer_id))
    }

    async fn set_customer_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> ProviderResult<()> {
        self.set_customer_default_pm(customer_id, payment_method_id);
        Ok(())
    }

    async fn payment_intent_payment_method(
        &self,
        payment_intent_id: &str,
    ) -> ProviderResult<Option<String>> {
        Ok(self.state().intent_pms.get(payment_intent_id).cloned())
    }

    async fn create_checkout_session(
        &self,
        req: CheckoutRequest,
    ) -> ProviderResult<CheckoutHandle> {
        let mut state = self.state();
        let session_id = state.next_id("cs");

        let mut metadata = req.metadata.clone();
        metadata.insert("price_id".into(), req.price_id.clone());
        state.sessions.insert(
            session_id.clone(),
            CheckoutSessionSnapshot {
                id: session_id.clone(),
                customer_id: req.customer_id.clone(),
                subscription_id: None,
                customer_email: req.customer_email.clone(),
                status: Some("open".into()),
                payment_status: Some("unpaid".into()),
                metadata,
            },
        );
        state.checkouts.push(req);

        Ok(CheckoutHandle {
            url: Some(format!("https://checkout.test/{}", session_id)),
            session_id,
            expires_at: Some(OffsetDateTime::now_utc() + Duration::hours(24)),
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> ProviderResult<CheckoutSessionSnapshot> {
        self.state().sessions.get(session_id).cloned().ok_or_else(|| {
            ProviderError::not_found(format!("No such checkout session: {}", session_id))
        })
    }
}
