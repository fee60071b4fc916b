//! Pending signup staging
//!
//! Holds an unconfirmed signup between checkout creation and payment
//! confirmation, keyed by checkout session id. Exactly one of the two
//! claimants (synchronous completion or the checkout webhook) receives the
//! payload; the other sees `None` and must look the account up instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use stowage_shared::Plan;

use crate::error::{BillingError, BillingResult};

const KEY_PREFIX: &str = "stowage:signup:pending:";

/// Negotiated terms for an enterprise signup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterpriseTerms {
    /// Custom provider price, used instead of the catalog price
    pub price_id: Option<String>,
    /// Custom storage quota, used instead of the plan default
    pub storage_quota_bytes: Option<i64>,
    pub seats: Option<u32>,
}

/// Signup payload waiting for payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignup {
    pub email: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub plan: Plan,
    pub storage_quota_bytes: i64,
    pub enterprise: Option<EnterpriseTerms>,
}

#[async_trait]
pub trait SignupStaging: Send + Sync {
    /// Store a payload under a checkout session id, replacing any previous one
    async fn stage(&self, session_id: &str, signup: &PendingSignup, ttl: Duration)
        -> BillingResult<()>;

    /// Atomically take the payload. Returns `None` if it was already claimed
    /// or has expired.
    async fn claim(&self, session_id: &str) -> BillingResult<Option<PendingSignup>>;
}

/// Redis-backed staging: `SET .. EX` to stage, `GETDEL` to claim
#[derive(Clone)]
pub struct RedisSignupStaging {
    conn: ConnectionManager,
}

impl RedisSignupStaging {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Config(format!("Invalid REDIS_URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(session_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, session_id)
    }
}

#[async_trait]
impl SignupStaging for RedisSignupStaging {
    async fn stage(
        &self,
        session_id: &str,
        signup: &PendingSignup,
        ttl: Duration,
    ) -> BillingResult<()> {
        let payload = serde_json::to_string(signup)?;
        let mut conn = self.conn.clone();

        redis::cmd("SET")
            .arg(Self::key(session_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(session_id = %session_id, ttl_secs = ttl.as_secs(), "Staged pending signup");
        Ok(())
    }

    async fn claim(&self, session_id: &str) -> BillingResult<Option<PendingSignup>> {
        let mut conn = self.conn.clone();

        let payload: Option<String> = redis::cmd("GETDEL")
            .arg(Self::key(session_id))
            .query_async::<Option<String>>(&mut conn)
            .await?;

        match payload {
            Some(raw) => {
                let signup = serde_json::from_str(&raw).map_err(|e| {
                    BillingError::Staging(format!("Corrupt pending signup payload: {}", e))
                })?;
                Ok(Some(signup))
            }
            None => Ok(None),
        }
    }
}

/// In-process staging for tests and single-instance development
#[derive(Default)]
pub struct InMemorySignupStaging {
    entries: Mutex<HashMap<String, (PendingSignup, Instant)>>,
}

impl InMemorySignupStaging {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (PendingSignup, Instant)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SignupStaging for InMemorySignupStaging {
    async fn stage(
        &self,
        session_id: &str,
        signup: &PendingSignup,
        ttl: Duration,
    ) -> BillingResult<()> {
        self.entries()
            .insert(session_id.to_string(), (signup.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn claim(&self, session_id: &str) -> BillingResult<Option<PendingSignup>> {
        // Removal under the lock is the atomic step
        let entry = self.entries().remove(session_id);
        Ok(entry
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(signup, _)| signup))
    }
}
