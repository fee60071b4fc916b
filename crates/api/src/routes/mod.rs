//! HTTP routes

pub mod billing;
pub mod signup;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    auth::{require_auth, require_billing_manager},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Owner or admin only
    let billing_changes = Router::new()
        .route("/billing/toggle-renewal", post(billing::toggle_renewal))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .route("/billing/reactivate", post(billing::reactivate_subscription))
        .route("/billing/upgrade", post(billing::upgrade_plan))
        .route_layer(middleware::from_fn(require_billing_manager));

    let protected = Router::new()
        .route("/billing/subscription", get(billing::get_subscription))
        .merge(billing_changes)
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(signup::login))
        .route("/signup/checkout", post(signup::begin_checkout))
        .route("/signup/complete", post(signup::complete_signup))
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .merge(protected)
        .with_state(state)
}

/// Liveness probe
async fn health() -> ApiResult<Json<Value>> {
    success(
        "ok",
        json!({
            "service": "stowage-api",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Wrap a payload in the success envelope. Object fields are merged next to
/// `status` and `message`; anything else lands under `data`.
pub(crate) fn success<T: Serialize>(message: &str, data: T) -> ApiResult<Json<Value>> {
    let value = serde_json::to_value(data)
        .map_err(|e| ApiError::Internal(format!("Failed to serialize response: {}", e)))?;

    let mut body = match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    body.insert("status".to_string(), json!("success"));
    body.insert("message".to_string(), json!(message));

    Ok(Json(Value::Object(body)))
}
