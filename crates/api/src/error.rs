//! API error types and the JSON error envelope

use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stowage_billing::{BillingError, ProviderErrorKind};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PaymentRequired(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Infrastructure details stay in the logs
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "status": "error",
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(_) | BillingError::NoOp(_) | BillingError::PlanResolution(_) => {
                ApiError::Validation(err.to_string())
            }
            BillingError::SignatureInvalid => ApiError::Validation(err.to_string()),
            BillingError::NotFound(_) => ApiError::NotFound(err.to_string()),
            BillingError::InvalidState(_)
            | BillingError::NoActiveSubscription
            | BillingError::NoPaymentMethod(_)
            | BillingError::Conflict(_) => ApiError::Conflict(err.to_string()),
            BillingError::Provider(ref provider) => match provider.kind {
                ProviderErrorKind::Declined => ApiError::PaymentRequired(err.to_string()),
                ProviderErrorKind::Transient => ApiError::ServiceUnavailable(
                    "Payment provider is temporarily unavailable".to_string(),
                ),
                ProviderErrorKind::NotFound | ProviderErrorKind::Permanent => {
                    ApiError::Internal(err.to_string())
                }
            },
            BillingError::Database(detail) => ApiError::Database(detail),
            BillingError::OrphanedPayment { .. }
            | BillingError::Staging(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

/// JSON body extractor whose rejections use the error envelope
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);
