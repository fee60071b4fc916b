//! Stripe webhook handling
//!
//! Verifies the signature, claims the event in the ledger so each event id is
//! processed once, then routes it through the reconciler. Payloads are parsed
//! loosely into the few fields billing reads, so newer API versions that move
//! or add fields do not break ingestion.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::accounts::AccountStore;
use crate::checkout::CheckoutService;
use crate::context::BillingDeps;
use crate::error::{BillingError, BillingResult};
use crate::events::BillingAction;
use crate::ledger::{EventOutcome, LedgerClaim, WebhookEventLedger};
use crate::provider::{
    CheckoutSessionSnapshot, InvoiceSnapshot, ProviderSubscriptionStatus, SubscriptionSnapshot,
};

type HmacSha256 = Hmac<Sha256>;

/// Signed `t=<unix>,v1=<hex>` header value for a payload
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> String {
    // The whole secret, "whsec_" prefix included, is the key
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Header value the provider would send for `payload` signed at `timestamp`
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> String {
    format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload))
}

/// A verified webhook event
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// What happened to a verified event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Already handled by an earlier delivery
    Duplicate,
    /// Handler failed in a way a redelivery cannot fix. Recorded and alerted.
    Failed { error: String },
}

// =============================================================================
// Wire shapes
// =============================================================================

/// Either an id or an expanded object carrying one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

fn ids(value: Option<Expandable>) -> Option<String> {
    value.map(Expandable::into_id).filter(|id| !id.is_empty())
}

fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

#[derive(Debug, Default, Deserialize)]
struct WirePrice {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSubscriptionItem {
    #[serde(default)]
    price: Option<WirePrice>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    id: String,
    customer: Option<Expandable>,
    status: ProviderSubscriptionStatus,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    items: Option<WireList<WireSubscriptionItem>>,
    default_payment_method: Option<Expandable>,
    latest_invoice: Option<Expandable>,
}

impl From<WireSubscription> for SubscriptionSnapshot {
    fn from(wire: WireSubscription) -> Self {
        let first_item = wire.items.and_then(|items| items.data.into_iter().next());
        let (item_price, item_start, item_end) = match first_item {
            Some(item) => (
                item.price.and_then(|p| p.id),
                item.current_period_start,
                item.current_period_end,
            ),
            None => (None, None, None),
        };

        SubscriptionSnapshot {
            id: wire.id,
            customer_id: ids(wire.customer).unwrap_or_default(),
            status: wire.status,
            cancel_at_period_end: wire.cancel_at_period_end,
            price_id: item_price,
            // Newer API versions only carry the period on the item
            current_period_start: timestamp(wire.current_period_start.or(item_start)),
            current_period_end: timestamp(wire.current_period_end.or(item_end)),
            default_payment_method: ids(wire.default_payment_method),
            latest_invoice_id: ids(wire.latest_invoice),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WirePeriod {
    start: Option<i64>,
    end: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireInvoiceLine {
    period: Option<WirePeriod>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSubscriptionDetails {
    subscription: Option<Expandable>,
}

#[derive(Debug, Default, Deserialize)]
struct WireInvoiceParent {
    subscription_details: Option<WireSubscriptionDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct WireError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireInvoice {
    id: String,
    subscription: Option<Expandable>,
    #[serde(default)]
    parent: Option<WireInvoiceParent>,
    customer: Option<Expandable>,
    paid: Option<bool>,
    status: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    currency: Option<String>,
    billing_reason: Option<String>,
    charge: Option<Expandable>,
    payment_intent: Option<Expandable>,
    period_start: Option<i64>,
    period_end: Option<i64>,
    created: Option<i64>,
    #[serde(default)]
    lines: Option<WireList<WireInvoiceLine>>,
    last_finalization_error: Option<WireError>,
}

impl WireInvoice {
    fn into_snapshot(self) -> (InvoiceSnapshot, Option<String>) {
        let subscription_id = ids(self.subscription).or_else(|| {
            ids(self
                .parent
                .and_then(|p| p.subscription_details)
                .and_then(|d| d.subscription))
        });

        // Line periods describe the service period; the invoice's own
        // period fields describe the previous one on renewals.
        let line_period = self
            .lines
            .and_then(|lines| lines.data.into_iter().next())
            .and_then(|line| line.period);
        let (start, end) = match line_period {
            Some(period) => (period.start, period.end),
            None => (self.period_start, self.period_end),
        };

        let snapshot = InvoiceSnapshot {
            id: self.id,
            subscription_id,
            customer_id: ids(self.customer),
            paid: self
                .paid
                .unwrap_or_else(|| self.status.as_deref() == Some("paid")),
            amount_paid: self.amount_paid,
            amount_due: self.amount_due,
            currency: self.currency,
            billing_reason: self.billing_reason,
            charge_id: ids(self.charge),
            payment_intent_id: ids(self.payment_intent),
            period_start: timestamp(start),
            period_end: timestamp(end),
            created: timestamp(self.created),
        };
        let failure_reason = self.last_finalization_error.and_then(|e| e.message);
        (snapshot, failure_reason)
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireCustomerDetails {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCheckoutSession {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    customer_email: Option<String>,
    customer_details: Option<WireCustomerDetails>,
    status: Option<String>,
    payment_status: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

impl From<WireCheckoutSession> for CheckoutSessionSnapshot {
    fn from(wire: WireCheckoutSession) -> Self {
        CheckoutSessionSnapshot {
            id: wire.id,
            customer_id: ids(wire.customer),
            subscription_id: ids(wire.subscription),
            customer_email: wire
                .customer_email
                .or_else(|| wire.customer_details.and_then(|d| d.email)),
            status: wire.status,
            payment_status: wire.payment_status,
            metadata: wire.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCustomer {
    id: String,
    email: Option<String>,
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::Validation(format!(
            "Malformed {} payload in event {}: {}",
            event.event_type, event.id, e
        ))
    })
}

// =============================================================================
// Handler
// =============================================================================

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    deps: BillingDeps,
    checkout: CheckoutService,
}

impl WebhookHandler {
    pub fn new(deps: BillingDeps) -> Self {
        let checkout = CheckoutService::new(deps.clone());
        Self { deps, checkout }
    }

    /// Verify and process one delivery
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Verify the signature header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::SignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in webhook signature header");
            return Err(BillingError::SignatureInvalid);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > self.deps.settings.webhook_tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let expected = compute_signature(&self.deps.settings.webhook_secret, timestamp, payload);
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::Validation(format!("Malformed webhook event: {}", e))
        })
    }

    /// Process a verified event at most once.
    ///
    /// Transient failures come back as errors so the provider redelivers.
    /// Anything else is recorded as failed, alerted on, and acknowledged.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        match self.deps.ledger.begin(&event.id, &event.event_type).await? {
            LedgerClaim::Claimed => {}
            LedgerClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event; already processed"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            LedgerClaim::InFlight => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event is being processed by another delivery"
                );
                return Err(BillingError::Conflict(format!(
                    "event {} is already being processed",
                    event.id
                )));
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process_event(&event).await;

        let (outcome, error) = match &result {
            Ok(()) => (EventOutcome::Success, None),
            Err(e) => (EventOutcome::Failed, Some(e.to_string())),
        };
        if let Err(e) = self
            .deps
            .ledger
            .finish(&event.id, outcome, error.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook outcome; event may look stuck until the processing timeout"
            );
        }

        match result {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed transiently; provider will redeliver"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    alert = true,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed permanently; acknowledged without retry"
                );
                Ok(WebhookOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                self.handle_checkout_completed(event).await
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_changed(event).await
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,
            "invoice.payment_succeeded" => self.handle_invoice_paid(event).await,
            "invoice.payment_failed" => self.handle_invoice_failed(event).await,
            "customer.updated" => self.handle_customer_updated(event).await,
            _ => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled webhook event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let session: CheckoutSessionSnapshot = parse_object::<WireCheckoutSession>(event)?.into();
        self.checkout.on_checkout_completed(&session).await?;
        Ok(())
    }

    async fn handle_subscription_changed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let snapshot: SubscriptionSnapshot = parse_object::<WireSubscription>(event)?.into();
        let Some(account) = self.account_for_customer(event, &snapshot.customer_id).await? else {
            return Ok(());
        };

        let reconciliation = self.deps.reconciler.subscription_changed(&account, &snapshot);
        self.deps
            .commit(
                &account,
                reconciliation,
                BillingAction::SubscriptionSynced,
                json!({
                    "event_id": event.id,
                    "subscription_id": snapshot.id,
                    "provider_status": snapshot.status,
                    "cancel_at_period_end": snapshot.cancel_at_period_end,
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<()> {
        let snapshot: SubscriptionSnapshot = parse_object::<WireSubscription>(event)?.into();
        let Some(account) = self.account_for_customer(event, &snapshot.customer_id).await? else {
            return Ok(());
        };

        let reconciliation = self.deps.reconciler.subscription_deleted(&account, &snapshot);
        self.deps
            .commit(
                &account,
                reconciliation,
                BillingAction::SubscriptionCanceled,
                json!({
                    "event_id": event.id,
                    "subscription_id": snapshot.id,
                    "source": "webhook",
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<()> {
        let (invoice, _) = parse_object::<WireInvoice>(event)?.into_snapshot();
        if invoice.subscription_id.is_none() {
            tracing::debug!(invoice_id = %invoice.id, "One-time invoice paid; nothing to reconcile");
            return Ok(());
        }
        let Some(customer_id) = invoice.customer_id.clone() else {
            return Ok(());
        };
        let Some(account) = self.account_for_customer(event, &customer_id).await? else {
            return Ok(());
        };

        let reconciliation = self.deps.reconciler.invoice_paid(&account, &invoice);
        self.deps
            .commit(
                &account,
                reconciliation,
                BillingAction::PaymentSucceeded,
                json!({
                    "event_id": event.id,
                    "invoice_id": invoice.id,
                    "amount_paid": invoice.amount_paid,
                    "billing_reason": invoice.billing_reason,
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_invoice_failed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let (invoice, reason) = parse_object::<WireInvoice>(event)?.into_snapshot();
        let Some(customer_id) = invoice.customer_id.clone() else {
            return Ok(());
        };
        let Some(account) = self.account_for_customer(event, &customer_id).await? else {
            return Ok(());
        };

        let reconciliation = self.deps.reconciler.invoice_failed(&account, &invoice, reason);
        self.deps
            .commit(
                &account,
                reconciliation,
                BillingAction::PaymentFailed,
                json!({
                    "event_id": event.id,
                    "invoice_id": invoice.id,
                    "amount_due": invoice.amount_due,
                }),
            )
            .await?;
        Ok(())
    }

    /// Informational only
    async fn handle_customer_updated(&self, event: &WebhookEvent) -> BillingResult<()> {
        let customer: WireCustomer = parse_object(event)?;
        let Some(account) = self.account_for_customer(event, &customer.id).await? else {
            return Ok(());
        };

        if let Some(email) = &customer.email {
            if !email.eq_ignore_ascii_case(&account.email) {
                tracing::warn!(
                    account_id = %account.id,
                    customer_id = %customer.id,
                    "Billing email differs from account email"
                );
            }
        }
        Ok(())
    }

    async fn account_for_customer(
        &self,
        event: &WebhookEvent,
        customer_id: &str,
    ) -> BillingResult<Option<stowage_shared::Account>> {
        if customer_id.is_empty() {
            return Ok(None);
        }
        let account = self.deps.accounts.find_by_customer_id(customer_id).await?;
        if account.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                customer_id = %customer_id,
                "No account for provider customer; ignoring event"
            );
        }
        Ok(account)
    }
}
