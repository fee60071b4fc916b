//! Common types used across Stowage

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

const GIB: i64 = 1024 * 1024 * 1024;

// =============================================================================
// Plans
// =============================================================================

/// Paid plan an account is subscribed to.
///
/// Storage quota and label live here; the provider price for each plan is
/// configured per deployment (see `stowage_billing::PriceIds`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Business,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Starter, Plan::Pro, Plan::Business, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
        }
    }

    /// Human readable name used in receipts and notifications
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starter => "Starter",
            Self::Pro => "Pro",
            Self::Business => "Business",
            Self::Enterprise => "Enterprise",
        }
    }

    /// Default storage quota in bytes. Enterprise signups may override it.
    pub fn storage_quota_bytes(&self) -> i64 {
        match self {
            Self::Starter => 10 * GIB,
            Self::Pro => 100 * GIB,
            Self::Business => 1024 * GIB,
            Self::Enterprise => 5 * 1024 * GIB,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Local lifecycle state of an account's paid subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    None,
    Active,
    Canceling,
    PastDue,
    Canceled,
    Incomplete,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::Canceling => "canceling",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
        }
    }

    /// Whether moving from `self` to `next` is an edge of the lifecycle.
    ///
    /// Staying in the same state is always allowed so that replayed events
    /// are no-ops. `Canceled -> Active` is allowed here; callers must also
    /// check that a fresh subscription is being attached.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (None, Active)
                | (None, Incomplete)
                | (Active, Canceling)
                | (Canceling, Active)
                | (Active, PastDue)
                | (Canceling, PastDue)
                | (PastDue, Active)
                | (Active, Canceled)
                | (Canceling, Canceled)
                | (PastDue, Canceled)
                | (Canceled, Active)
                | (Incomplete, Active)
                | (Incomplete, Canceled)
        )
    }

    /// States that still hold a live provider subscription
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Canceling | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Account
// =============================================================================

/// Durable record of a tenant and its billing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: Option<String>,
    pub plan: Plan,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub storage_quota_bytes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Account {
    pub fn has_subscription(&self) -> bool {
        self.external_subscription_id.is_some()
    }
}
