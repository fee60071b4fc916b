//! Payment provider boundary
//!
//! Every outbound call to the payment provider goes through [`PaymentProvider`].
//! Implementations return the provider's own view of each object as a snapshot;
//! callers never assume it agrees with what is stored locally.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ProviderError;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Subscription status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl ProviderSubscriptionStatus {
    /// Whether the provider still considers this subscription usable
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Whether the first payment went through
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// Provider view of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub status: ProviderSubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub default_payment_method: Option<String>,
    pub latest_invoice_id: Option<String>,
}

/// Where the money for an invoice came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PaymentReference {
    Charge(String),
    PaymentIntent(String),
}

/// Provider view of an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub paid: bool,
    pub amount_paid: i64,
    pub amount_due: i64,
    /// Lowercase ISO code, e.g. "usd"
    pub currency: Option<String>,
    pub billing_reason: Option<String>,
    pub charge_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub created: Option<OffsetDateTime>,
}

impl InvoiceSnapshot {
    /// Charge first, then payment intent
    pub fn payment_reference(&self) -> Option<PaymentReference> {
        self.charge_id
            .clone()
            .map(PaymentReference::Charge)
            .or_else(|| self.payment_intent_id.clone().map(PaymentReference::PaymentIntent))
    }
}

/// Result of a refund issued by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundInfo {
    pub refund_id: String,
    pub amount_cents: i64,
    pub status: String,
}

/// Parameters for a new subscription. Proration is always disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub payment_method: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Parameters for a provider-hosted checkout session
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub customer_email: Option<String>,
    pub customer_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// Handle the client uses to continue a checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutHandle {
    pub session_id: String,
    pub url: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// Provider view of a checkout session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_email: Option<String>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionSnapshot {
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        )
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_subscription(&self, req: NewSubscription)
        -> ProviderResult<SubscriptionSnapshot>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> ProviderResult<SubscriptionSnapshot>;

    /// Immediate cancellation, not cancel-at-period-end
    async fn cancel_subscription(&self, subscription_id: &str)
        -> ProviderResult<SubscriptionSnapshot>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> ProviderResult<SubscriptionSnapshot>;

    /// Paid invoices for a subscription, newest first
    async fn list_paid_invoices(
        &self,
        subscription_id: &str,
        limit: u64,
    ) -> ProviderResult<Vec<InvoiceSnapshot>>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> ProviderResult<InvoiceSnapshot>;

    /// Full refund of the referenced payment
    async fn refund_payment(&self, payment: &PaymentReference) -> ProviderResult<RefundInfo>;

    /// Credit the customer's balance. Returns the balance transaction id.
    async fn create_balance_credit(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        reason: &str,
    ) -> ProviderResult<String>;

    async fn customer_default_payment_method(
        &self,
        customer_id: &str,
    ) -> ProviderResult<Option<String>>;

    async fn set_customer_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> ProviderResult<()>;

    async fn payment_intent_payment_method(
        &self,
        payment_intent_id: &str,
    ) -> ProviderResult<Option<String>>;

    async fn create_checkout_session(&self, req: CheckoutRequest)
        -> ProviderResult<CheckoutHandle>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> ProviderResult<CheckoutSessionSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice() -> InvoiceSnapshot {
        InvoiceSnapshot {
            id: "in_1".into(),
            subscription_id: Some("sub_1".into()),
            customer_id: Some("cus_1".into()),
            paid: true,
            amount_paid: 2000,
            amount_due: 2000,
            currency: Some("usd".into()),
            billing_reason: Some("subscription_create".into()),
            charge_id: None,
            payment_intent_id: None,
            period_start: None,
            period_end: None,
            created: None,
        }
    }

    #[test]
    fn test_payment_reference_prefers_charge() {
        let mut inv = invoice();
        assert_eq!(inv.payment_reference(), None);

        inv.payment_intent_id = Some("pi_1".into());
        assert_eq!(
            inv.payment_reference(),
            Some(PaymentReference::PaymentIntent("pi_1".into()))
        );

        inv.charge_id = Some("ch_1".into());
        assert_eq!(inv.payment_reference(), Some(PaymentReference::Charge("ch_1".into())));
    }

    #[test]
    fn test_canceled_subscriptions_are_not_live() {
        assert!(ProviderSubscriptionStatus::Active.is_live());
        assert!(ProviderSubscriptionStatus::PastDue.is_live());
        assert!(!ProviderSubscriptionStatus::Canceled.is_live());
        assert!(!ProviderSubscriptionStatus::IncompleteExpired.is_live());
    }
}
