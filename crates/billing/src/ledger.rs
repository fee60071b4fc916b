//! Webhook event ledger
//!
//! Records every verified provider event id and how it was handled, so a
//! re-delivered event that already succeeded is acknowledged without running
//! its handler (and without re-emitting its side effects).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;

/// How long a `processing` claim is honored before another delivery may take over
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Processing,
    Success,
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerClaim {
    /// This delivery owns the event
    Claimed,
    /// A previous delivery already handled it successfully
    AlreadyProcessed,
    /// Another delivery is handling it right now
    InFlight,
}

#[async_trait]
pub trait WebhookEventLedger: Send + Sync {
    async fn begin(&self, event_id: &str, event_type: &str) -> BillingResult<LedgerClaim>;

    async fn finish(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error: Option<&str>,
    ) -> BillingResult<()>;
}

/// Postgres ledger on `billing_webhook_events`
#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventLedger for PgEventLedger {
    async fn begin(&self, event_id: &str, event_type: &str) -> BillingResult<LedgerClaim> {
        // Insert, or take over a failed / stuck row. A row that succeeded is never re-claimed.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events (event_id, event_type, outcome)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (event_id) DO UPDATE SET
                outcome = 'processing',
                error_message = NULL,
                attempts = billing_webhook_events.attempts + 1,
                updated_at = NOW()
            WHERE billing_webhook_events.outcome = 'failed'
               OR (billing_webhook_events.outcome = 'processing'
                   AND billing_webhook_events.updated_at < NOW() - make_interval(mins => $3))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(LedgerClaim::Claimed);
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT outcome FROM billing_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match existing {
            Some((outcome,)) if outcome == EventOutcome::Success.as_str() => {
                LedgerClaim::AlreadyProcessed
            }
            _ => LedgerClaim::InFlight,
        })
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET outcome = $2, error_message = $3, updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    outcome: EventOutcome,
    attempts: u32,
    updated_at: OffsetDateTime,
}

/// In-memory ledger for tests and local development
#[derive(Default)]
pub struct InMemoryEventLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn outcome(&self, event_id: &str) -> Option<EventOutcome> {
        self.entries().get(event_id).map(|e| e.outcome)
    }

    pub fn attempts(&self, event_id: &str) -> u32 {
        self.entries().get(event_id).map(|e| e.attempts).unwrap_or(0)
    }
}

#[async_trait]
impl WebhookEventLedger for InMemoryEventLedger {
    async fn begin(&self, event_id: &str, _event_type: &str) -> BillingResult<LedgerClaim> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries();

        match entries.get_mut(event_id) {
            None => {
                entries.insert(
                    event_id.to_string(),
                    LedgerEntry {
                        outcome: EventOutcome::Processing,
                        attempts: 1,
                        updated_at: now,
                    },
                );
                Ok(LedgerClaim::Claimed)
            }
            Some(entry) => match entry.outcome {
                EventOutcome::Success => Ok(LedgerClaim::AlreadyProcessed),
                EventOutcome::Processing
                    if now - entry.updated_at < Duration::minutes(PROCESSING_TIMEOUT_MINUTES) =>
                {
                    Ok(LedgerClaim::InFlight)
                }
                _ => {
                    entry.outcome = EventOutcome::Processing;
                    entry.attempts += 1;
                    entry.updated_at = now;
                    Ok(LedgerClaim::Claimed)
                }
            },
        }
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        _error: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(entry) = self.entries().get_mut(event_id) {
            entry.outcome = outcome;
            entry.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}
