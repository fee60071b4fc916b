//! Stripe client configuration and the plan catalog

use std::sync::Arc;

use serde::Serialize;
use stowage_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Default tolerance for webhook timestamps (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe price ID for each paid plan.
///
/// This is the only place plans map to provider prices. Everything else asks
/// the catalog instead of matching on strings.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub starter: String,
    pub pro: String,
    pub business: String,
    pub enterprise: Option<String>,
}

/// Everything the billing layer knows about a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub plan: Plan,
    pub price_id: String,
    pub storage_quota_bytes: i64,
    pub label: &'static str,
}

impl PriceIds {
    pub fn price_id_for(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Starter => Some(self.starter.as_str()),
            Plan::Pro => Some(self.pro.as_str()),
            Plan::Business => Some(self.business.as_str()),
            Plan::Enterprise => self.enterprise.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }

    pub fn plan_for_price_id(&self, price_id: &str) -> Option<Plan> {
        Plan::ALL
            .into_iter()
            .find(|plan| self.price_id_for(*plan) == Some(price_id))
    }

    pub fn entry(&self, plan: Plan) -> Option<PlanEntry> {
        self.price_id_for(plan).map(|price_id| PlanEntry {
            plan,
            price_id: price_id.to_string(),
            storage_quota_bytes: plan.storage_quota_bytes(),
            label: plan.label(),
        })
    }
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub prices: PriceIds,
    pub webhook_tolerance_secs: i64,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub api_base: String,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let app_url =
            std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            prices: PriceIds {
                starter: required("STRIPE_PRICE_STARTER")?,
                pro: required("STRIPE_PRICE_PRO")?,
                business: required("STRIPE_PRICE_BUSINESS")?,
                enterprise: std::env::var("STRIPE_PRICE_ENTERPRISE")
                    .ok()
                    .filter(|v| !v.is_empty()),
            },
            webhook_tolerance_secs: std::env::var("WEBHOOK_TOLERANCE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL").unwrap_or_else(|_| {
                format!("{}/signup/complete?session_id={{CHECKOUT_SESSION_ID}}", app_url)
            }),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| format!("{}/signup", app_url)),
            api_base: STRIPE_API_BASE.to_string(),
        })
    }
}

fn required(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not set", key)))
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    http: reqwest::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Typed async-stripe client
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// Raw HTTP client for endpoints async-stripe does not model
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
