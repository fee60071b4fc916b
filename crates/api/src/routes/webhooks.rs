//! Payment provider webhook ingress
//!
//! Status codes drive the provider's redelivery: 200 acknowledges, 400 means
//! the delivery will never verify, 500 asks for a retry.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stowage_billing::{BillingError, WebhookOutcome};

use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// POST /webhooks/billing
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        tracing::warn!("Webhook delivery without a signature header");
        return rejection(StatusCode::BAD_REQUEST, "Missing signature header");
    };

    match state.billing.webhooks.handle(&body, signature).await {
        Ok(outcome) => {
            match &outcome {
                WebhookOutcome::Processed => tracing::debug!("Webhook processed"),
                WebhookOutcome::Duplicate => tracing::debug!("Webhook acknowledged as duplicate"),
                WebhookOutcome::Failed { error } => {
                    tracing::debug!(error = %error, "Webhook acknowledged after permanent failure")
                }
            }
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(BillingError::SignatureInvalid) => {
            rejection(StatusCode::BAD_REQUEST, "Invalid webhook signature")
        }
        Err(BillingError::Validation(message)) => rejection(StatusCode::BAD_REQUEST, &message),
        Err(e) => {
            if !e.is_transient() {
                tracing::error!(alert = true, error = %e, "Webhook failed outside any handler");
            }
            rejection(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Webhook processing failed; retry later",
            )
        }
    }
}

fn rejection(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "status": "error",
            "message": message,
        })),
    )
        .into_response()
}
