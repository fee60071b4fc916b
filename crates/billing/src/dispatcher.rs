//! Side-effect dispatch
//!
//! Billing handlers describe emails and notifications as [`SideEffectIntent`]s
//! and hand them to a [`SideEffectDispatcher`]. A single worker task delivers
//! them in order with a fixed gap between sends, so a slow or rate-limited
//! downstream never holds up the billing transaction that produced them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stowage_shared::Plan;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SideEffectFailure;

/// Default gap between deliveries. Keeps us under the email provider's rate ceiling.
pub const DEFAULT_SPACING: Duration = Duration::from_millis(600);

/// Default queue depth before new intents are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffectIntent {
    Welcome {
        account_id: Uuid,
        email: String,
        plan: Plan,
    },
    Receipt {
        account_id: Uuid,
        email: String,
        amount_cents: i64,
        invoice_id: Option<String>,
    },
    AdminSignupAlert {
        account_id: Uuid,
        email: String,
        plan: Plan,
        amount_cents: i64,
    },
    RenewalReceipt {
        account_id: Uuid,
        email: String,
        amount_cents: i64,
        invoice_id: String,
        #[serde(with = "time::serde::rfc3339::option")]
        period_end: Option<OffsetDateTime>,
    },
    PaymentFailed {
        account_id: Uuid,
        email: String,
        amount_due_cents: i64,
        reason: Option<String>,
    },
    CancellationNotice {
        account_id: Uuid,
        email: String,
    },
}

impl SideEffectIntent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Receipt { .. } => "receipt",
            Self::AdminSignupAlert { .. } => "admin_signup_alert",
            Self::RenewalReceipt { .. } => "renewal_receipt",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::CancellationNotice { .. } => "cancellation_notice",
        }
    }

    pub fn account_id(&self) -> Uuid {
        match self {
            Self::Welcome { account_id, .. }
            | Self::Receipt { account_id, .. }
            | Self::AdminSignupAlert { account_id, .. }
            | Self::RenewalReceipt { account_id, .. }
            | Self::PaymentFailed { account_id, .. }
            | Self::CancellationNotice { account_id, .. } => *account_id,
        }
    }
}

/// Something that can actually deliver an intent
#[async_trait]
pub trait SideEffectSink: Send + Sync {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<(), SideEffectFailure>;
}

/// Logs intents instead of delivering them
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl SideEffectSink for TracingSink {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<(), SideEffectFailure> {
        tracing::info!(
            intent = intent.name(),
            account_id = %intent.account_id(),
            payload = ?intent,
            "Side effect (not delivered: no notification service configured)"
        );
        Ok(())
    }
}

/// Posts intents as JSON to an external notification service
#[derive(Clone)]
pub struct HttpNotificationSink {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    admin_email: Option<String>,
}

#[derive(Serialize)]
struct NotificationRequest<'a> {
    #[serde(flatten)]
    intent: &'a SideEffectIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin_email: Option<&'a str>,
}

impl HttpNotificationSink {
    pub fn new(url: String, api_key: Option<String>, admin_email: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            api_key,
            admin_email,
        }
    }

    /// Build from `NOTIFICATION_WEBHOOK_URL`, `NOTIFICATION_API_KEY`, `ADMIN_ALERT_EMAIL`
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("NOTIFICATION_WEBHOOK_URL")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self::new(
            url,
            std::env::var("NOTIFICATION_API_KEY").ok(),
            std::env::var("ADMIN_ALERT_EMAIL").ok(),
        ))
    }
}

#[async_trait]
impl SideEffectSink for HttpNotificationSink {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<(), SideEffectFailure> {
        let body = NotificationRequest {
            intent,
            admin_email: match intent {
                SideEffectIntent::AdminSignupAlert { .. } => self.admin_email.as_deref(),
                _ => None,
            },
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| SideEffectFailure {
            intent: intent.name(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(SideEffectFailure {
                intent: intent.name(),
                message: format!("notification service returned {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Fire-and-forget handle onto the delivery queue
#[derive(Clone)]
pub struct SideEffectDispatcher {
    tx: mpsc::Sender<SideEffectIntent>,
}

impl SideEffectDispatcher {
    /// Start the delivery worker
    pub fn spawn(
        sink: Arc<dyn SideEffectSink>,
        spacing: Duration,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SideEffectIntent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(intent) = rx.recv().await {
                match sink.deliver(&intent).await {
                    Ok(()) => {
                        tracing::debug!(
                            intent = intent.name(),
                            account_id = %intent.account_id(),
                            "Delivered side effect"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            intent = e.intent,
                            account_id = %intent.account_id(),
                            error = %e,
                            "Side effect delivery failed"
                        );
                    }
                }
                tokio::time::sleep(spacing).await;
            }
            tracing::info!("Side effect dispatcher stopped");
        });

        (Self { tx }, handle)
    }

    /// Dispatcher whose queue is read directly by the caller
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SideEffectIntent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an intent. Never blocks and never fails the caller.
    pub fn send(&self, intent: SideEffectIntent) {
        let name = intent.name();
        let account_id = intent.account_id();

        if let Err(e) = self.tx.try_send(intent) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            tracing::error!(
                intent = name,
                account_id = %account_id,
                reason = reason,
                "Dropped side effect"
            );
        }
    }
}
