//! Signup and sign-in routes
//!
//! Signup is paid up front: `/signup/checkout` stages the signup behind a
//! provider checkout, and `/signup/complete` is the client's return from that
//! checkout. The account itself may already exist by then if the webhook won.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_billing::{AccountStore, SignupRequest, SubscriptionView};
use stowage_shared::{Account, Plan};
use time::OffsetDateTime;
use uuid::Uuid;

use super::success;
use crate::{
    auth::{hash_password, validate_password_strength, verify_password, ROLE_OWNER},
    error::{ApiError, ApiJson, ApiResult},
    state::AppState,
};

const MAX_DISPLAY_NAME_LEN: usize = 100;

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupCheckoutRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
    pub plan: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSignupRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub account_id: Uuid,
    pub access_token: String,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub subscription: SubscriptionView,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /signup/checkout
pub async fn begin_checkout(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SignupCheckoutRequest>,
) -> ApiResult<Json<Value>> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }

    let plan: Plan = req.plan.parse().map_err(ApiError::Validation)?;

    validate_password_strength(&req.password)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let display_name = req
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    if display_name
        .as_ref()
        .is_some_and(|name| name.chars().count() > MAX_DISPLAY_NAME_LEN)
    {
        return Err(ApiError::Validation(format!(
            "Display name must be at most {} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }

    // Argon2 is CPU bound
    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("Password hashing task failed: {}", e)))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let handle = state
        .billing
        .checkout
        .begin_signup(SignupRequest {
            email,
            password_hash,
            display_name,
            plan,
            enterprise: None,
        })
        .await?;

    success("Checkout created", handle)
}

/// POST /signup/complete
pub async fn complete_signup(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CompleteSignupRequest>,
) -> ApiResult<Json<Value>> {
    let session_id = req.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::Validation("sessionId is required".to_string()));
    }

    let completed = state.billing.checkout.complete(session_id).await?;

    tracing::info!(
        account_id = %completed.account.id,
        session_id = %session_id,
        created = completed.created,
        "Signup completed"
    );

    let session = issue_session(&state, &completed.account)?;
    let message = if completed.created {
        "Account created"
    } else {
        "Account ready"
    };
    success(message, session)
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let email = req.email.trim().to_lowercase();

    let account = state
        .billing
        .deps
        .accounts
        .find_by_email(&email)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let password = req.password;
    let stored_hash = account.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|e| ApiError::Internal(format!("Password verification task failed: {}", e)))?;

    if !valid {
        tracing::warn!(account_id = %account.id, "Login failed: wrong password");
        return Err(ApiError::Unauthorized);
    }

    let session = issue_session(&state, &account)?;
    success("Signed in", session)
}

fn issue_session(state: &AppState, account: &Account) -> ApiResult<SessionResponse> {
    let issued = state
        .jwt_manager
        .generate_access_token(account.id, ROLE_OWNER, &account.email)
        .map_err(|e| ApiError::Internal(format!("Failed to sign access token: {}", e)))?;

    Ok(SessionResponse {
        account_id: account.id,
        access_token: issued.token,
        token_type: "Bearer",
        expires_at: issued.expires_at,
        subscription: SubscriptionView::from(account),
    })
}
