//! Account persistence
//!
//! Accounts are never deleted; billing code only moves them between
//! subscription states through [`AccountUpdate`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use stowage_shared::{Account, Plan, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// New billing period window taken from a provider snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodUpdate {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    /// Skip the window if it ends before the one already stored
    pub only_if_newer: bool,
}

/// Subscription state an update was computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedState {
    pub status: SubscriptionStatus,
    pub subscription_id: Option<String>,
}

impl ExpectedState {
    pub fn of(account: &Account) -> Self {
        Self {
            status: account.subscription_status,
            subscription_id: account.external_subscription_id.clone(),
        }
    }

    fn matches(&self, account: &Account) -> bool {
        self.status == account.subscription_status
            && self.subscription_id == account.external_subscription_id
    }
}

/// Field-wise change to an account. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountUpdate {
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
    pub storage_quota_bytes: Option<i64>,
    pub price_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub period: Option<PeriodUpdate>,
    /// Refuse the write if the stored row no longer has this state
    pub expected: Option<ExpectedState>,
}

impl AccountUpdate {
    pub fn is_empty(&self) -> bool {
        AccountUpdate {
            expected: None,
            ..self.clone()
        } == AccountUpdate::default()
    }

    /// Pin a status or subscription change to the account it was computed from
    pub fn expecting(mut self, account: &Account) -> Self {
        if self.status.is_some() || self.external_subscription_id.is_some() {
            self.expected = Some(ExpectedState::of(account));
        }
        self
    }

    /// Fails with `Conflict` when the stored account moved to another status
    /// or subscription after the update was computed. Called under the row lock.
    pub fn check_current(&self, stored: &Account) -> BillingResult<()> {
        match &self.expected {
            Some(expected) if !expected.matches(stored) => {
                tracing::warn!(
                    account_id = %stored.id,
                    expected_status = %expected.status,
                    stored_status = %stored.subscription_status,
                    expected_subscription_id = ?expected.subscription_id,
                    stored_subscription_id = ?stored.external_subscription_id,
                    "Refusing update computed from a stale account"
                );
                Err(BillingError::Conflict(format!(
                    "account {} changed to {} while the update was computed",
                    stored.id, stored.subscription_status
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply in place. Returns whether any field actually changed.
    pub fn apply_to(&self, account: &mut Account) -> bool {
        let mut changed = false;

        fn set<T: PartialEq + Clone>(field: &mut T, value: &T, changed: &mut bool) {
            if field != value {
                *field = value.clone();
                *changed = true;
            }
        }

        if let Some(status) = self.status {
            set(&mut account.subscription_status, &status, &mut changed);
        }
        if let Some(plan) = self.plan {
            set(&mut account.plan, &plan, &mut changed);
        }
        if let Some(quota) = self.storage_quota_bytes {
            set(&mut account.storage_quota_bytes, &quota, &mut changed);
        }
        if let Some(price_id) = &self.price_id {
            set(&mut account.price_id, &Some(price_id.clone()), &mut changed);
        }
        if let Some(customer_id) = &self.external_customer_id {
            set(
                &mut account.external_customer_id,
                &Some(customer_id.clone()),
                &mut changed,
            );
        }
        if let Some(subscription_id) = &self.external_subscription_id {
            set(
                &mut account.external_subscription_id,
                &Some(subscription_id.clone()),
                &mut changed,
            );
        }
        if let Some(period) = &self.period {
            if period_applies(account, period) {
                if let Some(start) = period.start {
                    set(&mut account.current_period_start, &Some(start), &mut changed);
                }
                if let Some(end) = period.end {
                    set(&mut account.current_period_end, &Some(end), &mut changed);
                }
            }
        }

        changed
    }
}

fn period_applies(account: &Account, period: &PeriodUpdate) -> bool {
    if let (Some(start), Some(end)) = (period.start, period.end) {
        if start > end {
            tracing::warn!(
                account_id = %account.id,
                period_start = %start,
                period_end = %end,
                "Ignoring inverted period window"
            );
            return false;
        }
    }

    if period.only_if_newer {
        if let (Some(stored), Some(incoming)) = (account.current_period_end, period.end) {
            if incoming < stored {
                tracing::info!(
                    account_id = %account.id,
                    stored_period_end = %stored,
                    incoming_period_end = %incoming,
                    "Ignoring older period window from out-of-order event"
                );
                return false;
            }
        }
    }

    true
}

/// Fields needed to create an account from a confirmed signup
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub plan: Plan,
    pub storage_quota_bytes: i64,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>>;

    /// Case-insensitive lookup
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>>;

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>>;

    /// Create an account in state `NONE`. Fails with `Conflict` if the email is taken.
    async fn create(&self, new: NewAccount) -> BillingResult<Account>;

    /// Apply a field-wise update atomically and return the resulting account
    async fn update(&self, id: Uuid, update: &AccountUpdate) -> BillingResult<Account>;

    async fn require(&self, id: Uuid) -> BillingResult<Account> {
        self.get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", id)))
    }
}

/// Postgres-backed account store
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE LOWER(email) = LOWER($1)")
                .bind(email.trim())
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE external_customer_id = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn create(&self, new: NewAccount) -> BillingResult<Account> {
        let result = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (
                id, email, password_hash, display_name, plan,
                subscription_status, storage_quota_bytes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.email.trim())
        .bind(&new.password_hash)
        .bind(&new.display_name)
        .bind(new.plan)
        .bind(SubscriptionStatus::None)
        .bind(new.storage_quota_bytes)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(account) => Ok(account),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => Err(
                BillingError::Conflict(format!("account already exists for {}", new.email)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, id: Uuid, update: &AccountUpdate) -> BillingResult<Account> {
        let mut tx = self.pool.begin().await?;

        let mut account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("account {}", id)))?;

        update.check_current(&account)?;
        if !update.apply_to(&mut account) {
            tx.commit().await?;
            return Ok(account);
        }

        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts SET
                plan = $2,
                storage_quota_bytes = $3,
                price_id = $4,
                external_customer_id = $5,
                external_subscription_id = $6,
                subscription_status = $7,
                current_period_start = $8,
                current_period_end = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(account.plan)
        .bind(account.storage_quota_bytes)
        .bind(&account.price_id)
        .bind(&account.external_customer_id)
        .bind(&account.external_subscription_id)
        .bind(account.subscription_status)
        .bind(account.current_period_start)
        .bind(account.current_period_end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(account)
    }
}

/// In-memory account store for tests and local development
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<Uuid, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn accounts(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Account>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a fully formed account, replacing any with the same id
    pub fn insert(&self, account: Account) {
        self.accounts().insert(account.id, account);
    }

    pub fn all(&self) -> Vec<Account> {
        self.accounts().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.accounts().len()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>> {
        Ok(self.accounts().get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let email = email.trim().to_lowercase();
        Ok(self
            .accounts()
            .values()
            .find(|a| a.email.to_lowercase() == email)
            .cloned())
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        Ok(self
            .accounts()
            .values()
            .find(|a| a.external_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn create(&self, new: NewAccount) -> BillingResult<Account> {
        let mut accounts = self.accounts();
        let email = new.email.trim().to_string();
        let lowered = email.to_lowercase();
        if accounts.values().any(|a| a.email.to_lowercase() == lowered) {
            return Err(BillingError::Conflict(format!(
                "account already exists for {}",
                email
            )));
        }

        let now = OffsetDateTime::now_utc();
        let account = Account {
            id: Uuid::new_v4(),
            email,
            password_hash: new.password_hash,
            display_name: new.display_name,
            plan: new.plan,
            external_customer_id: None,
            external_subscription_id: None,
            subscription_status: SubscriptionStatus::None,
            price_id: None,
            current_period_start: None,
            current_period_end: None,
            storage_quota_bytes: new.storage_quota_bytes,
            created_at: now,
            updated_at: now,
        };
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn update(&self, id: Uuid, update: &AccountUpdate) -> BillingResult<Account> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("account {}", id)))?;

        update.check_current(account)?;
        if update.apply_to(account) {
            account.updated_at = OffsetDateTime::now_utc();
        }
        Ok(account.clone())
    }
}
