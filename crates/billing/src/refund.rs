//! Refund and credit window
//!
//! A paid period is refundable on cancel, and creditable on upgrade, for the
//! first [`REFUND_WINDOW_DAYS`] whole days after it starts. Both money
//! movements use the most recent paid invoice of the subscription as their
//! basis.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::ProviderError;
use crate::provider::{InvoiceSnapshot, PaymentProvider, RefundInfo};

/// Last whole day (inclusive) on which a period still qualifies
pub const REFUND_WINDOW_DAYS: i64 = 7;

/// Used when the period start is unknown. Never within the window.
pub const UNKNOWN_PERIOD_DAYS: i64 = 999;

/// Whole days elapsed since the period started, floored
pub fn days_since_period_start(start: Option<OffsetDateTime>, now: OffsetDateTime) -> i64 {
    match start {
        Some(start) => (now - start).whole_days(),
        None => UNKNOWN_PERIOD_DAYS,
    }
}

pub fn within_refund_window(days_since_start: i64) -> bool {
    days_since_start <= REFUND_WINDOW_DAYS
}

/// The invoice that money movements are based on
pub async fn latest_paid_invoice(
    provider: &dyn PaymentProvider,
    subscription_id: &str,
) -> Result<Option<InvoiceSnapshot>, ProviderError> {
    let invoices = provider.list_paid_invoices(subscription_id, 1).await?;
    Ok(invoices.into_iter().next())
}

/// Outcome of the best-effort refund attached to a cancellation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    /// Outside the window
    NotEligible,
    Issued(RefundInfo),
    /// Eligible but there was nothing paid to refund
    NothingToRefund,
    Failed { message: String },
}

impl RefundOutcome {
    pub fn refund(&self) -> Option<&RefundInfo> {
        match self {
            Self::Issued(info) => Some(info),
            _ => None,
        }
    }
}

/// Refund the most recent paid invoice in full. Never fails: problems are
/// reported in the outcome so the caller can still finish the cancellation.
pub async fn refund_latest_payment(
    provider: &dyn PaymentProvider,
    subscription_id: &str,
) -> RefundOutcome {
    let invoice = match latest_paid_invoice(provider, subscription_id).await {
        Ok(Some(invoice)) => invoice,
        Ok(None) => return RefundOutcome::NothingToRefund,
        Err(e) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Could not list paid invoices for refund"
            );
            return RefundOutcome::Failed {
                message: e.to_string(),
            };
        }
    };

    let Some(payment) = invoice.payment_reference() else {
        // $0 invoices have no charge behind them
        return RefundOutcome::NothingToRefund;
    };

    match provider.refund_payment(&payment).await {
        Ok(info) => {
            tracing::info!(
                subscription_id = %subscription_id,
                invoice_id = %invoice.id,
                refund_id = %info.refund_id,
                amount_cents = info.amount_cents,
                "Issued refund"
            );
            RefundOutcome::Issued(info)
        }
        Err(e) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                invoice_id = %invoice.id,
                error = %e,
                "Refund failed; cancellation proceeds"
            );
            RefundOutcome::Failed {
                message: e.to_string(),
            }
        }
    }
}
