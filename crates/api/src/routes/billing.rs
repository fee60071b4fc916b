//! Billing routes for the signed-in account
//!
//! Every handler acts on the account named by the access token. Changes are
//! limited to owners and admins by the router.

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_billing::SubscriptionView;
use stowage_shared::{Plan, SubscriptionStatus};
use time::OffsetDateTime;

use super::success;
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiJson, ApiResult},
    state::AppState,
};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRenewalRequest {
    pub auto_renewal: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub new_plan: String,
}

/// Read model for billing-gated clients
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub plan_id: Plan,
    pub storage_quota: i64,
    pub subscription: SubscriptionView,
}

impl From<SubscriptionView> for SubscriptionResponse {
    fn from(view: SubscriptionView) -> Self {
        Self {
            subscription_status: view.subscription_status,
            current_period_end: view.current_period_end,
            plan_id: view.plan,
            storage_quota: view.storage_quota_bytes,
            subscription: view,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let view = state
        .billing
        .commands
        .get_subscription(auth_user.account_id)
        .await?;

    success("Subscription retrieved", SubscriptionResponse::from(view))
}

/// POST /billing/toggle-renewal
pub async fn toggle_renewal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ApiJson(req): ApiJson<ToggleRenewalRequest>,
) -> ApiResult<Json<Value>> {
    let result = state
        .billing
        .commands
        .toggle_auto_renewal(auth_user.account_id, req.auto_renewal)
        .await?;

    let message = if result.auto_renewal {
        "Auto-renewal enabled"
    } else {
        "Auto-renewal disabled; the subscription ends with the current period"
    };
    success(message, result)
}

/// POST /billing/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    tracing::info!(
        account_id = %auth_user.account_id,
        requested_by = %auth_user.email,
        "Cancellation requested"
    );

    let result = state.billing.commands.cancel(auth_user.account_id).await?;

    let message = match (&result.refund, &result.refund_error) {
        (Some(_), _) => "Subscription canceled and refunded",
        (None, Some(_)) => "Subscription canceled; the refund could not be issued and will be handled by support",
        (None, None) => "Subscription canceled",
    };
    success(message, result)
}

/// POST /billing/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let result = state
        .billing
        .commands
        .reactivate(auth_user.account_id)
        .await?;

    success("Checkout created for reactivation", result)
}

/// POST /billing/upgrade
pub async fn upgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ApiJson(req): ApiJson<UpgradeRequest>,
) -> ApiResult<Json<Value>> {
    let new_plan: Plan = req.new_plan.parse().map_err(ApiError::Validation)?;

    let result = state
        .billing
        .commands
        .upgrade(auth_user.account_id, new_plan)
        .await?;

    success(&format!("Upgraded to {}", new_plan.label()), result)
}
