//! Billing error types

use serde::Serialize;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// How an upstream payment provider failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network failure, timeout, rate limit or provider-side 5xx. Safe to retry.
    Transient,
    /// The customer's payment was declined.
    Declined,
    /// The referenced provider object does not exist.
    NotFound,
    /// Anything else. Retrying will not help.
    Permanent,
}

/// Normalized error from the payment provider boundary
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Declined, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// Map an HTTP status returned by the provider to a retry classification
pub fn classify_status(status: u16) -> ProviderErrorKind {
    match status {
        404 => ProviderErrorKind::NotFound,
        402 => ProviderErrorKind::Declined,
        408 | 409 | 429 => ProviderErrorKind::Transient,
        s if s >= 500 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Permanent,
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Nothing to change: {0}")]
    NoOp(String),

    #[error("No payment method on file for customer {0}")]
    NoPaymentMethod(String),

    #[error("Cannot resolve a price for plan {0}")]
    PlanResolution(String),

    #[error("Payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Checkout session {session_id} completed with no pending signup and no account")]
    OrphanedPayment {
        session_id: String,
        email: Option<String>,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Signup staging error: {0}")]
    Staging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the same request could succeed if it were delivered again later.
    ///
    /// Webhook ingress uses this to decide between a retryable 500 and a
    /// logged 200. Orphaned payments and conflicts count as transient: the
    /// competing writer may still be creating the account.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Database(_)
            | Self::Staging(_)
            | Self::Conflict(_)
            | Self::OrphanedPayment { .. } => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Staging(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

/// A best-effort side effect (email, notification) that could not be delivered.
///
/// Never converted into `BillingError`: callers log it and move on.
#[derive(Debug, Error)]
#[error("side effect '{intent}' failed: {message}")]
pub struct SideEffectFailure {
    pub intent: &'static str,
    pub message: String,
}
