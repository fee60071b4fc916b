//! Billing Invariants Module
//!
//! Runnable consistency checks over stored accounts. Safe to run at any time,
//! including after a webhook replay: checks only read.
//!
//! Each check exists twice: as SQL for the scheduled worker, and as a pure
//! function over loaded accounts for tests and in-memory stores. Both report
//! the same invariant names.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use stowage_shared::{Account, Plan, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// How long a subscription may sit in `INCOMPLETE` before it is flagged
pub const INCOMPLETE_GRACE_HOURS: i64 = 24;

const SUBSCRIPTION_MATCHES_STATUS: &str = "subscription_matches_status";
const PERIOD_WINDOW_ORDERED: &str = "period_window_ordered";
const SUBSCRIBED_HAS_CUSTOMER: &str = "subscribed_has_customer";
const INCOMPLETE_NOT_STALE: &str = "incomplete_not_stale";
const QUOTA_MATCHES_PLAN: &str = "quota_matches_plan";

/// Result of running a single invariant check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub account_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Billing state contradicts itself
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    id: Uuid,
    subscription_status: SubscriptionStatus,
    external_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct InvertedPeriodRow {
    id: Uuid,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct AccountStatusRow {
    id: Uuid,
    subscription_status: SubscriptionStatus,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleIncompleteRow {
    id: Uuid,
    updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaMismatchRow {
    id: Uuid,
    plan: Plan,
    storage_quota_bytes: i64,
}

fn status_mismatch(id: Uuid, status: SubscriptionStatus, sub: Option<&str>) -> InvariantViolation {
    InvariantViolation {
        invariant: SUBSCRIPTION_MATCHES_STATUS.to_string(),
        account_ids: vec![id],
        description: format!(
            "Account is {} but subscription reference is {}",
            status,
            if sub.is_some() { "set" } else { "missing" }
        ),
        context: serde_json::json!({
            "subscription_status": status,
            "external_subscription_id": sub,
        }),
        severity: ViolationSeverity::Critical,
    }
}

fn inverted_period(id: Uuid, start: OffsetDateTime, end: OffsetDateTime) -> InvariantViolation {
    InvariantViolation {
        invariant: PERIOD_WINDOW_ORDERED.to_string(),
        account_ids: vec![id],
        description: "Billing period starts after it ends".to_string(),
        context: serde_json::json!({
            "current_period_start": start.unix_timestamp(),
            "current_period_end": end.unix_timestamp(),
        }),
        severity: ViolationSeverity::High,
    }
}

fn missing_customer(id: Uuid, status: SubscriptionStatus) -> InvariantViolation {
    InvariantViolation {
        invariant: SUBSCRIBED_HAS_CUSTOMER.to_string(),
        account_ids: vec![id],
        description: format!("Account is {} but has no provider customer", status),
        context: serde_json::json!({ "subscription_status": status }),
        severity: ViolationSeverity::High,
    }
}

fn stale_incomplete(id: Uuid, since: OffsetDateTime) -> InvariantViolation {
    InvariantViolation {
        invariant: INCOMPLETE_NOT_STALE.to_string(),
        account_ids: vec![id],
        description: format!(
            "Subscription has been INCOMPLETE for more than {} hours",
            INCOMPLETE_GRACE_HOURS
        ),
        context: serde_json::json!({ "incomplete_since": since.unix_timestamp() }),
        severity: ViolationSeverity::Medium,
    }
}

fn quota_mismatch(id: Uuid, plan: Plan, quota: i64) -> InvariantViolation {
    InvariantViolation {
        invariant: QUOTA_MATCHES_PLAN.to_string(),
        account_ids: vec![id],
        description: format!("Storage quota does not match the {} plan", plan),
        context: serde_json::json!({
            "plan": plan,
            "storage_quota_bytes": quota,
            "expected_bytes": plan.storage_quota_bytes(),
        }),
        severity: ViolationSeverity::Low,
    }
}

/// Check already-loaded accounts
pub fn check_accounts(accounts: &[Account], now: OffsetDateTime) -> InvariantCheckSummary {
    let mut violations = Vec::new();

    for account in accounts {
        let status = account.subscription_status;
        let sub = account.external_subscription_id.as_deref();

        if sub.is_none() != (status == SubscriptionStatus::None) {
            violations.push(status_mismatch(account.id, status, sub));
        }

        if let (Some(start), Some(end)) = (account.current_period_start, account.current_period_end)
        {
            if start > end {
                violations.push(inverted_period(account.id, start, end));
            }
        }

        if status != SubscriptionStatus::None && account.external_customer_id.is_none() {
            violations.push(missing_customer(account.id, status));
        }

        if status == SubscriptionStatus::Incomplete
            && now - account.updated_at > Duration::hours(INCOMPLETE_GRACE_HOURS)
        {
            violations.push(stale_incomplete(account.id, account.updated_at));
        }

        if account.plan != Plan::Enterprise
            && account.storage_quota_bytes != account.plan.storage_quota_bytes()
        {
            violations.push(quota_mismatch(
                account.id,
                account.plan,
                account.storage_quota_bytes,
            ));
        }
    }

    InvariantCheckSummary::from_violations(now, violations)
}

/// Service for running billing invariant checks against Postgres
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            SUBSCRIPTION_MATCHES_STATUS => self.check_subscription_matches_status().await,
            PERIOD_WINDOW_ORDERED => self.check_period_window_ordered().await,
            SUBSCRIBED_HAS_CUSTOMER => self.check_subscribed_has_customer().await,
            INCOMPLETE_NOT_STALE => self.check_incomplete_not_stale().await,
            QUOTA_MATCHES_PLAN => self.check_quota_matches_plan().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SUBSCRIPTION_MATCHES_STATUS,
            PERIOD_WINDOW_ORDERED,
            SUBSCRIBED_HAS_CUSTOMER,
            INCOMPLETE_NOT_STALE,
            QUOTA_MATCHES_PLAN,
        ]
    }

    /// Subscription reference is set exactly when status is not NONE
    async fn check_subscription_matches_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, external_subscription_id
            FROM accounts
            WHERE (external_subscription_id IS NULL) <> (subscription_status = 'none')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                status_mismatch(
                    row.id,
                    row.subscription_status,
                    row.external_subscription_id.as_deref(),
                )
            })
            .collect())
    }

    async fn check_period_window_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvertedPeriodRow> = sqlx::query_as(
            r#"
            SELECT id, current_period_start, current_period_end
            FROM accounts
            WHERE current_period_start IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_start > current_period_end
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| inverted_period(row.id, row.current_period_start, row.current_period_end))
            .collect())
    }

    async fn check_subscribed_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AccountStatusRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status
            FROM accounts
            WHERE subscription_status <> 'none'
              AND external_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| missing_customer(row.id, row.subscription_status))
            .collect())
    }

    async fn check_incomplete_not_stale(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleIncompleteRow> = sqlx::query_as(
            r#"
            SELECT id, updated_at
            FROM accounts
            WHERE subscription_status = 'incomplete'
              AND updated_at < NOW() - ($1 || ' hours')::INTERVAL
            "#,
        )
        .bind(INCOMPLETE_GRACE_HOURS.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| stale_incomplete(row.id, row.updated_at))
            .collect())
    }

    /// Enterprise accounts carry negotiated quotas and are skipped
    async fn check_quota_matches_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<QuotaMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, plan, storage_quota_bytes
            FROM accounts
            WHERE plan <> 'enterprise'
              AND storage_quota_bytes <> CASE plan
                  WHEN 'starter' THEN $1
                  WHEN 'pro' THEN $2
                  WHEN 'business' THEN $3
              END
            "#,
        )
        .bind(Plan::Starter.storage_quota_bytes())
        .bind(Plan::Pro.storage_quota_bytes())
        .bind(Plan::Business.storage_quota_bytes())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| quota_mismatch(row.id, row.plan, row.storage_quota_bytes))
            .collect())
    }
}
