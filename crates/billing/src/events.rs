//! Billing audit log
//!
//! Write-only trail of what billing did to each account. Nothing in this crate
//! reads it back.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Auditable billing actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingAction {
    SignupCompleted,
    SubscriptionActivated,
    SubscriptionSynced,
    AutoRenewalEnabled,
    AutoRenewalDisabled,
    SubscriptionCanceled,
    RefundIssued,
    RefundFailed,
    ReactivationStarted,
    PlanUpgraded,
    CreditApplied,
    PaymentSucceeded,
    PaymentFailed,
    TransitionRejected,
}

impl std::fmt::Display for BillingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingAction::SignupCompleted => "SIGNUP_COMPLETED",
            BillingAction::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingAction::SubscriptionSynced => "SUBSCRIPTION_SYNCED",
            BillingAction::AutoRenewalEnabled => "AUTO_RENEWAL_ENABLED",
            BillingAction::AutoRenewalDisabled => "AUTO_RENEWAL_DISABLED",
            BillingAction::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingAction::RefundIssued => "REFUND_ISSUED",
            BillingAction::RefundFailed => "REFUND_FAILED",
            BillingAction::ReactivationStarted => "REACTIVATION_STARTED",
            BillingAction::PlanUpgraded => "PLAN_UPGRADED",
            BillingAction::CreditApplied => "CREDIT_APPLIED",
            BillingAction::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingAction::PaymentFailed => "PAYMENT_FAILED",
            BillingAction::TransitionRejected => "TRANSITION_REJECTED",
        };
        write!(f, "{}", s)
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        account_id: Uuid,
        action: BillingAction,
        metadata: serde_json::Value,
    ) -> BillingResult<()>;
}

/// Record an audit entry, logging instead of failing the caller
pub(crate) async fn record_quietly(
    audit: &dyn AuditLog,
    account_id: Uuid,
    action: BillingAction,
    metadata: serde_json::Value,
) {
    if let Err(e) = audit.record(account_id, action, metadata).await {
        tracing::warn!(
            account_id = %account_id,
            action = %action,
            error = %e,
            "Failed to record billing audit event"
        );
    }
}

/// Appends to the `billing_events` table
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(
        &self,
        account_id: Uuid,
        action: BillingAction,
        metadata: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (account_id, action, metadata)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(account_id)
        .bind(action.to_string())
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Emits audit entries as structured log lines
#[derive(Debug, Clone, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(
        &self,
        account_id: Uuid,
        action: BillingAction,
        metadata: serde_json::Value,
    ) -> BillingResult<()> {
        tracing::info!(
            target: "stowage::audit",
            account_id = %account_id,
            action = %action,
            metadata = %metadata,
            "billing audit"
        );
        Ok(())
    }
}

/// Keeps audit entries in memory for assertions
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<(Uuid, BillingAction, serde_json::Value)>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<BillingAction> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, action, _)| *action)
            .collect()
    }

    pub fn entries_for(&self, action: BillingAction) -> Vec<serde_json::Value> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, a, _)| *a == action)
            .map(|(_, _, metadata)| metadata.clone())
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(
        &self,
        account_id: Uuid,
        action: BillingAction,
        metadata: serde_json::Value,
    ) -> BillingResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((account_id, action, metadata));
        Ok(())
    }
}
