//! Stripe implementation of [`PaymentProvider`]
//!
//! Subscription, invoice, refund, customer and payment intent calls go through
//! async-stripe. Balance transactions, customer default payment method updates
//! and checkout sessions are sent as raw form requests because the typed client
//! does not cover the parameters we need.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CreateRefund, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, Invoice, InvoiceId, InvoiceStatus, ListInvoices, PaymentIntent, PaymentIntentId,
    Refund, RefundReasonFilter, StripeError, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{classify_status, ProviderError};
use crate::provider::{
    CheckoutHandle, CheckoutRequest, CheckoutSessionSnapshot, InvoiceSnapshot, NewSubscription,
    PaymentProvider, PaymentReference, ProviderResult, ProviderSubscriptionStatus, RefundInfo,
    SubscriptionSnapshot,
};

impl From<StripeError> for ProviderError {
    fn from(err: StripeError) -> Self {
        match &err {
            StripeError::Stripe(request_error) => {
                let status = request_error.http_status;
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| err.to_string());
                ProviderError::new(classify_status(status), message).with_status(status)
            }
            StripeError::Timeout | StripeError::ClientError(_) => {
                ProviderError::transient(err.to_string())
            }
            _ => ProviderError::permanent(err.to_string()),
        }
    }
}

/// Payment provider backed by the Stripe API
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Send a form-encoded request to an endpoint async-stripe does not model
    async fn send_form<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        form: &[(String, String)],
    ) -> ProviderResult<T> {
        let url = format!("{}{}", self.stripe.config().api_base, path);
        let mut request = self
            .stripe
            .http()
            .request(method.clone(), &url)
            .bearer_auth(&self.stripe.config().secret_key);
        if method != reqwest::Method::GET {
            request = request.form(form);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("Failed to call Stripe API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                path = %path,
                error_body = %error_body,
                "Stripe API request failed"
            );
            return Err(ProviderError::new(
                classify_status(status.as_u16()),
                format!("Stripe API error ({}): {}", status, error_body),
            )
            .with_status(status.as_u16()));
        }

        response.json::<T>().await.map_err(|e| {
            ProviderError::permanent(format!("Failed to parse Stripe response: {}", e))
        })
    }
}

fn parse_id<T>(raw: &str, what: &str) -> ProviderResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ProviderError::permanent(format!("Invalid {} '{}': {}", what, raw, e)))
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Wire name of a generated Stripe enum, e.g. `subscription_cycle`
fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
}

fn subscription_snapshot(subscription: &Subscription) -> SubscriptionSnapshot {
    let status = match subscription.status {
        StripeSubStatus::Active => ProviderSubscriptionStatus::Active,
        StripeSubStatus::Trialing => ProviderSubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => ProviderSubscriptionStatus::PastDue,
        StripeSubStatus::Unpaid => ProviderSubscriptionStatus::Unpaid,
        StripeSubStatus::Canceled => ProviderSubscriptionStatus::Canceled,
        StripeSubStatus::Incomplete => ProviderSubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => ProviderSubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => ProviderSubscriptionStatus::Paused,
    };

    SubscriptionSnapshot {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        status,
        cancel_at_period_end: subscription.cancel_at_period_end,
        price_id: subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string()),
        current_period_start: timestamp(subscription.current_period_start),
        current_period_end: timestamp(subscription.current_period_end),
        default_payment_method: subscription
            .default_payment_method
            .as_ref()
            .map(|pm| pm.id().to_string()),
        latest_invoice_id: subscription
            .latest_invoice
            .as_ref()
            .map(|inv| inv.id().to_string()),
    }
}

fn invoice_snapshot(invoice: &Invoice) -> InvoiceSnapshot {
    InvoiceSnapshot {
        id: invoice.id.to_string(),
        subscription_id: invoice.subscription.as_ref().map(|s| s.id().to_string()),
        customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
        paid: invoice.paid.unwrap_or(false),
        amount_paid: invoice.amount_paid.unwrap_or(0),
        amount_due: invoice.amount_due.unwrap_or(0),
        currency: invoice.currency.as_ref().and_then(wire_name),
        billing_reason: invoice.billing_reason.as_ref().and_then(wire_name),
        charge_id: invoice.charge.as_ref().map(|c| c.id().to_string()),
        payment_intent_id: invoice.payment_intent.as_ref().map(|p| p.id().to_string()),
        period_start: invoice.period_start.and_then(timestamp),
        period_end: invoice.period_end.and_then(timestamp),
        created: invoice.created.and_then(timestamp),
    }
}

#[derive(Debug, Deserialize)]
struct BalanceTransactionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionResponse {
    id: String,
    url: Option<String>,
    expires_at: Option<i64>,
    customer: Option<String>,
    subscription: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CheckoutCustomerDetails>,
    status: Option<String>,
    payment_status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutCustomerDetails {
    email: Option<String>,
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_subscription(
        &self,
        req: NewSubscription,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let customer_id: CustomerId = parse_id(&req.customer_id, "customer id")?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(req.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.default_payment_method = req.payment_method.as_deref();
        // Credits are applied explicitly as balance transactions
        params.proration_behavior = Some(SubscriptionProrationBehavior::None);
        params.metadata = Some(req.metadata.clone());

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        tracing::info!(
            customer_id = %req.customer_id,
            subscription_id = %subscription.id,
            price_id = %req.price_id,
            "Created Stripe subscription"
        );

        Ok(subscription_snapshot(&subscription))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription id")?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(subscription_snapshot(&subscription))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription id")?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = Subscription::cancel(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(subscription_id = %subscription.id, "Cancelled Stripe subscription");

        Ok(subscription_snapshot(&subscription))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> ProviderResult<SubscriptionSnapshot> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription id")?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel_at_period_end),
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        Ok(subscription_snapshot(&subscription))
    }

    async fn list_paid_invoices(
        &self,
        subscription_id: &str,
        limit: u64,
    ) -> ProviderResult<Vec<InvoiceSnapshot>> {
        let mut params = ListInvoices::new();
        params.subscription = Some(parse_id(subscription_id, "subscription id")?);
        params.status = Some(InvoiceStatus::Paid);
        params.limit = Some(limit);

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;
        Ok(invoices.data.iter().map(invoice_snapshot).collect())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProviderResult<InvoiceSnapshot> {
        let id: InvoiceId = parse_id(invoice_id, "invoice id")?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &id, &[]).await?;
        Ok(invoice_snapshot(&invoice))
    }

    async fn refund_payment(&self, payment: &PaymentReference) -> ProviderResult<RefundInfo> {
        let mut params = CreateRefund::new();
        match payment {
            PaymentReference::Charge(charge_id) => {
                params.charge = Some(parse_id(charge_id, "charge id")?);
            }
            PaymentReference::PaymentIntent(pi_id) => {
                params.payment_intent = Some(parse_id(pi_id, "payment intent id")?);
            }
        }
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let refund = Refund::create(self.stripe.inner(), params).await?;

        Ok(RefundInfo {
            refund_id: refund.id.to_string(),
            amount_cents: refund.amount,
            status: wire_name(&refund.status).unwrap_or_else(|| "pending".to_string()),
        })
    }

    async fn create_balance_credit(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        reason: &str,
    ) -> ProviderResult<String> {
        // Negative amounts reduce what the customer owes on the next invoice
        let form = vec![
            ("amount".to_string(), (-amount_cents.abs()).to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("description".to_string(), reason.to_string()),
        ];

        let txn: BalanceTransactionResponse = self
            .send_form(
                reqwest::Method::POST,
                &format!("/customers/{}/balance_transactions", customer_id),
                &form,
            )
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            amount_cents = amount_cents,
            currency = %currency,
            balance_transaction_id = %txn.id,
            "Applied customer balance credit"
        );

        Ok(txn.id)
    }

    async fn customer_default_payment_method(
        &self,
        customer_id: &str,
    ) -> ProviderResult<Option<String>> {
        let id: CustomerId = parse_id(customer_id, "customer id")?;
        let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;

        Ok(customer
            .invoice_settings
            .as_ref()
            .and_then(|settings| settings.default_payment_method.as_ref())
            .map(|pm| pm.id().to_string()))
    }

    async fn set_customer_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> ProviderResult<()> {
        let form = vec![(
            "invoice_settings[default_payment_method]".to_string(),
            payment_method_id.to_string(),
        )];

        let customer: CustomerResponse = self
            .send_form(
                reqwest::Method::POST,
                &format!("/customers/{}", customer_id),
                &form,
            )
            .await?;

        tracing::debug!(customer_id = %customer.id, "Updated default payment method");
        Ok(())
    }

    async fn payment_intent_payment_method(
        &self,
        payment_intent_id: &str,
    ) -> ProviderResult<Option<String>> {
        let id: PaymentIntentId = parse_id(payment_intent_id, "payment intent id")?;
        let intent = PaymentIntent::retrieve(self.stripe.inner(), &id, &[]).await?;
        Ok(intent.payment_method.as_ref().map(|pm| pm.id().to_string()))
    }

    async fn create_checkout_session(
        &self,
        req: CheckoutRequest,
    ) -> ProviderResult<CheckoutHandle> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("line_items[0][price]".to_string(), req.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), req.success_url.clone()),
            ("cancel_url".to_string(), req.cancel_url.clone()),
        ];
        match (&req.customer_id, &req.customer_email) {
            (Some(customer), _) => form.push(("customer".to_string(), customer.clone())),
            (None, Some(email)) => form.push(("customer_email".to_string(), email.clone())),
            (None, None) => {}
        }
        for (key, value) in &req.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
            form.push((format!("subscription_data[metadata][{}]", key), value.clone()));
        }

        let session: CheckoutSessionResponse = self
            .send_form(reqwest::Method::POST, "/checkout/sessions", &form)
            .await?;

        Ok(CheckoutHandle {
            session_id: session.id,
            url: session.url,
            expires_at: session.expires_at.and_then(timestamp),
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> ProviderResult<CheckoutSessionSnapshot> {
        let session: CheckoutSessionResponse = self
            .send_form(
                reqwest::Method::GET,
                &format!("/checkout/sessions/{}", session_id),
                &[],
            )
            .await?;

        let customer_email = session
            .customer_details
            .and_then(|d| d.email)
            .or(session.customer_email);

        Ok(CheckoutSessionSnapshot {
            id: session.id,
            customer_id: session.customer,
            subscription_id: session.subscription,
            customer_email,
            status: session.status,
            payment_status: session.payment_status,
            metadata: session.metadata,
        })
    }
}
