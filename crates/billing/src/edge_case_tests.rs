// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests boundary conditions and races across the billing flows:
//! - Lifecycle transitions driven by webhooks
//! - Webhook replay and redelivery
//! - Refund and credit windows
//! - Signup completion racing the checkout webhook
//! - Auto-renewal toggling
//! - Upgrade paths and payment method fallback
//! - Reactivation price resolution
//! - Commands interleaved with webhooks on the same account

#[cfg(test)]
mod support {
    use serde_json::json;
    use stowage_shared::{Account, Plan, SubscriptionStatus};
    use time::{Duration, OffsetDateTime};

    use crate::accounts::{AccountStore, AccountUpdate, NewAccount, PeriodUpdate};
    use crate::provider::{CheckoutSessionSnapshot, InvoiceSnapshot, SubscriptionSnapshot};
    use crate::testing::{test_prices, TestHarness, BUSINESS_CENTS, PRO_CENTS, STARTER_CENTS};
    use crate::webhooks::WebhookEvent;

    pub const CUSTOMER: &str = "cus_edge";
    pub const SUBSCRIPTION: &str = "sub_edge";

    pub fn cents(plan: Plan) -> i64 {
        match plan {
            Plan::Starter => STARTER_CENTS,
            Plan::Pro => PRO_CENTS,
            _ => BUSINESS_CENTS,
        }
    }

    /// An account on `plan` whose subscription period started at `period_start`
    pub async fn seed_account(
        h: &TestHarness,
        plan: Plan,
        status: SubscriptionStatus,
        period_start: OffsetDateTime,
    ) -> (Account, SubscriptionSnapshot) {
        let price_id = test_prices().price_id_for(plan).unwrap().to_string();
        let subscription = h.provider.seed_active_subscription(
            SUBSCRIPTION,
            CUSTOMER,
            &price_id,
            period_start,
            cents(plan),
        );

        let account = h
            .accounts
            .create(NewAccount {
                email: "edge@example.com".into(),
                password_hash: "$argon2id$stub".into(),
                display_name: None,
                plan,
                storage_quota_bytes: plan.storage_quota_bytes(),
            })
            .await
            .unwrap();

        let account = h
            .accounts
            .update(
                account.id,
                &AccountUpdate {
                    status: Some(status),
                    price_id: Some(price_id),
                    external_customer_id: Some(CUSTOMER.into()),
                    external_subscription_id: Some(SUBSCRIPTION.into()),
                    period: Some(PeriodUpdate {
                        start: subscription.current_period_start,
                        end: subscription.current_period_end,
                        only_if_newer: false,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        (account, subscription)
    }

    pub fn days_ago(days: i64) -> OffsetDateTime {
        // A minute of slack so the elapsed whole days is exactly `days`
        OffsetDateTime::now_utc() - Duration::days(days) - Duration::minutes(1)
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "object": object },
        }))
        .unwrap()
    }

    fn unix(t: Option<OffsetDateTime>) -> Option<i64> {
        t.map(|t| t.unix_timestamp())
    }

    pub fn subscription_event(
        id: &str,
        event_type: &str,
        snapshot: &SubscriptionSnapshot,
    ) -> WebhookEvent {
        event(
            id,
            event_type,
            json!({
                "id": snapshot.id,
                "customer": snapshot.customer_id,
                "status": snapshot.status,
                "cancel_at_period_end": snapshot.cancel_at_period_end,
                "current_period_start": unix(snapshot.current_period_start),
                "current_period_end": unix(snapshot.current_period_end),
                "items": { "data": [{ "price": { "id": snapshot.price_id } }] },
            }),
        )
    }

    pub fn invoice_event(id: &str, event_type: &str, invoice: &InvoiceSnapshot) -> WebhookEvent {
        event(
            id,
            event_type,
            json!({
                "id": invoice.id,
                "customer": invoice.customer_id,
                "subscription": invoice.subscription_id,
                "paid": invoice.paid,
                "amount_paid": invoice.amount_paid,
                "amount_due": invoice.amount_due,
                "billing_reason": invoice.billing_reason,
                "charge": invoice.charge_id,
                "period_start": unix(invoice.period_start),
                "period_end": unix(invoice.period_end),
                "last_finalization_error": { "message": "Your card was declined." },
            }),
        )
    }

    pub fn checkout_event(id: &str, session: &CheckoutSessionSnapshot) -> WebhookEvent {
        event(
            id,
            "checkout.session.completed",
            json!({
                "id": session.id,
                "customer": session.customer_id,
                "subscription": session.subscription_id,
                "customer_email": session.customer_email,
                "status": session.status,
                "payment_status": session.payment_status,
                "metadata": session.metadata,
            }),
        )
    }

    /// A renewal invoice for the period following `subscription`'s current one
    pub fn renewal_invoice(
        subscription: &SubscriptionSnapshot,
        id: &str,
        paid: bool,
    ) -> InvoiceSnapshot {
        let start = subscription.current_period_end.unwrap();
        InvoiceSnapshot {
            id: id.into(),
            subscription_id: Some(subscription.id.clone()),
            customer_id: Some(subscription.customer_id.clone()),
            paid,
            amount_paid: if paid { PRO_CENTS } else { 0 },
            amount_due: PRO_CENTS,
            currency: Some("usd".into()),
            billing_reason: Some("subscription_cycle".into()),
            charge_id: None,
            payment_intent_id: None,
            period_start: Some(start),
            period_end: Some(start + Duration::days(30)),
            created: Some(OffsetDateTime::now_utc()),
        }
    }
}

#[cfg(test)]
mod transition_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::dispatcher::SideEffectIntent;
    use crate::events::BillingAction;
    use crate::provider::ProviderSubscriptionStatus;
    use crate::testing::{drain_intents, test_deps};
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    // =========================================================================
    // Payment failure on a canceled account is rejected and audited
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failed_on_canceled_account_is_rejected() {
        let mut h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceled, days_ago(3)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        let invoice = renewal_invoice(&subscription, "in_late", false);
        let outcome = handler
            .handle_event(invoice_event("evt_1", "invoice.payment_failed", &invoice))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(h.audit.entries_for(BillingAction::TransitionRejected).len(), 1);
        assert!(
            drain_intents(&mut h.intents).is_empty(),
            "Rejected transition must not notify"
        );
    }

    // =========================================================================
    // An update reviving the same canceled subscription is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_canceled_does_not_revive_without_new_subscription() {
        let h = test_deps();
        let (account, mut subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceled, days_ago(3)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        subscription.status = ProviderSubscriptionStatus::Active;
        handler
            .handle_event(subscription_event(
                "evt_1",
                "customer.subscription.updated",
                &subscription,
            ))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.external_subscription_id.as_deref(), Some(SUBSCRIPTION));
    }

    // =========================================================================
    // A new live subscription does revive a canceled account
    // =========================================================================
    #[tokio::test]
    async fn test_canceled_revives_with_fresh_subscription() {
        let h = test_deps();
        let (account, mut subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceled, days_ago(40)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        subscription.id = "sub_reactivated".into();
        subscription.current_period_start = Some(time::OffsetDateTime::now_utc());
        subscription.current_period_end =
            Some(time::OffsetDateTime::now_utc() + time::Duration::days(30));
        handler
            .handle_event(subscription_event(
                "evt_1",
                "customer.subscription.created",
                &subscription,
            ))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(
            stored.external_subscription_id.as_deref(),
            Some("sub_reactivated")
        );
        assert_eq!(stored.current_period_end, subscription.current_period_end);
    }

    // =========================================================================
    // Deletion of a superseded subscription leaves the account alone
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_of_old_subscription_is_ignored() {
        let mut h = test_deps();
        let (account, mut subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        subscription.id = "sub_replaced_by_upgrade".into();
        subscription.status = ProviderSubscriptionStatus::Canceled;
        handler
            .handle_event(subscription_event(
                "evt_1",
                "customer.subscription.deleted",
                &subscription,
            ))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert!(drain_intents(&mut h.intents).is_empty());
    }

    // =========================================================================
    // Past due recovers to active and picks up the new period
    // =========================================================================
    #[tokio::test]
    async fn test_failed_then_paid_restores_active_and_period() {
        let mut h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(30)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        let failed = renewal_invoice(&subscription, "in_renewal", false);
        handler
            .handle_event(invoice_event("evt_fail", "invoice.payment_failed", &failed))
            .await
            .unwrap();

        let past_due = h.accounts.require(account.id).await.unwrap();
        assert_eq!(past_due.subscription_status, SubscriptionStatus::PastDue);
        let intents = drain_intents(&mut h.intents);
        assert!(matches!(
            &intents[..],
            [SideEffectIntent::PaymentFailed { reason: Some(_), amount_due_cents, .. }]
                if *amount_due_cents == failed.amount_due
        ));

        let paid = renewal_invoice(&subscription, "in_renewal", true);
        handler
            .handle_event(invoice_event("evt_paid", "invoice.payment_succeeded", &paid))
            .await
            .unwrap();

        let recovered = h.accounts.require(account.id).await.unwrap();
        assert_eq!(recovered.subscription_status, SubscriptionStatus::Active);
        assert_eq!(recovered.current_period_end, paid.period_end);
        let intents = drain_intents(&mut h.intents);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].name(), "renewal_receipt");
    }

    // =========================================================================
    // An older invoice arriving late does not move the period backwards
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_invoice_keeps_newer_period() {
        let h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(30)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        let renewal = renewal_invoice(&subscription, "in_new", true);
        handler
            .handle_event(invoice_event("evt_new", "invoice.payment_succeeded", &renewal))
            .await
            .unwrap();

        let mut first = renewal_invoice(&subscription, "in_old", true);
        first.period_start = subscription.current_period_start;
        first.period_end = subscription.current_period_end;
        first.billing_reason = Some("subscription_create".into());
        handler
            .handle_event(invoice_event("evt_old", "invoice.payment_succeeded", &first))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.current_period_end, renewal.period_end);
    }

    // =========================================================================
    // Payment on a canceling account keeps renewal off
    // =========================================================================
    #[tokio::test]
    async fn test_payment_keeps_canceling() {
        let h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceling, days_ago(30)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        let paid = renewal_invoice(&subscription, "in_renewal", true);
        handler
            .handle_event(invoice_event("evt_1", "invoice.payment_succeeded", &paid))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceling);
    }
}

#[cfg(test)]
mod replay_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::error::BillingError;
    use crate::ledger::{EventOutcome, WebhookEventLedger};
    use crate::testing::{drain_intents, test_deps};
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    // =========================================================================
    // Same event delivered twice: one state change, one receipt
    // =========================================================================
    #[tokio::test]
    async fn test_replayed_renewal_is_a_noop() {
        let mut h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(30)).await;
        let handler = WebhookHandler::new(h.deps.clone());
        let paid = renewal_invoice(&subscription, "in_renewal", true);
        let event = invoice_event("evt_renewal", "invoice.payment_succeeded", &paid);

        let first = handler.handle_event(event.clone()).await.unwrap();
        let after_first = h.accounts.require(account.id).await.unwrap();
        let second = handler.handle_event(event).await.unwrap();
        let after_second = h.accounts.require(account.id).await.unwrap();

        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(after_first, after_second);
        assert_eq!(drain_intents(&mut h.intents).len(), 1, "One receipt only");
        assert_eq!(h.ledger.attempts("evt_renewal"), 1);
    }

    // =========================================================================
    // Same state carried by two distinct events converges
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_subscription_update_converges() {
        let h = test_deps();
        let (account, mut subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(2)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        subscription.cancel_at_period_end = true;
        handler
            .handle_event(subscription_event(
                "evt_a",
                "customer.subscription.updated",
                &subscription,
            ))
            .await
            .unwrap();
        let once = h.accounts.require(account.id).await.unwrap();
        handler
            .handle_event(subscription_event(
                "evt_b",
                "customer.subscription.updated",
                &subscription,
            ))
            .await
            .unwrap();
        let twice = h.accounts.require(account.id).await.unwrap();

        assert_eq!(once.subscription_status, SubscriptionStatus::Canceling);
        assert_eq!(once, twice);
    }

    // =========================================================================
    // A delivery racing an in-flight one is told to retry
    // =========================================================================
    #[tokio::test]
    async fn test_in_flight_event_is_retryable() {
        let h = test_deps();
        let (_, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(2)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        h.ledger
            .begin("evt_busy", "customer.subscription.updated")
            .await
            .unwrap();
        let err = handler
            .handle_event(subscription_event(
                "evt_busy",
                "customer.subscription.updated",
                &subscription,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Conflict(_)));
        assert!(err.is_transient());
        assert_eq!(h.ledger.outcome("evt_busy"), Some(EventOutcome::Processing));
    }
}

#[cfg(test)]
mod cancellation_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::error::{BillingError, ProviderError};
    use crate::events::BillingAction;
    use crate::subscriptions::BillingCommandService;
    use crate::testing::{drain_intents, test_deps, PRO_CENTS};

    // =========================================================================
    // Day 7 is the last refundable day
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_on_day_seven_refunds() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(7)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.cancel(account.id).await.unwrap();

        assert_eq!(result.days_since_start, 7);
        assert!(result.refund_eligible);
        assert_eq!(result.refund.as_ref().map(|r| r.amount_cents), Some(PRO_CENTS));
        assert_eq!(result.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(h.provider.refunds().len(), 1);
        assert_eq!(h.provider.canceled(), vec![SUBSCRIPTION.to_string()]);
        assert_eq!(h.audit.entries_for(BillingAction::RefundIssued).len(), 1);
    }

    // =========================================================================
    // Day 8 cancels without a refund
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_on_day_eight_does_not_refund() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(8)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.cancel(account.id).await.unwrap();

        assert_eq!(result.days_since_start, 8);
        assert!(!result.refund_eligible);
        assert!(result.refund.is_none());
        assert!(h.provider.refunds().is_empty());
        assert_eq!(
            h.accounts.require(account.id).await.unwrap().subscription_status,
            SubscriptionStatus::Canceled
        );
    }

    // =========================================================================
    // A failed refund still cancels and reports the error
    // =========================================================================
    #[tokio::test]
    async fn test_refund_failure_does_not_block_cancel() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(1)).await;
        h.provider.fail_refunds();
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.cancel(account.id).await.unwrap();

        assert!(result.refund_eligible);
        assert!(result.refund.is_none());
        assert!(result.refund_error.is_some());
        assert_eq!(result.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(h.audit.entries_for(BillingAction::RefundFailed).len(), 1);
    }

    // =========================================================================
    // Subscription already gone upstream: cancel locally, no refund
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_when_provider_lost_subscription() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(1)).await;
        h.provider
            .fail_next_cancel(ProviderError::not_found("No such subscription").with_status(404));
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.cancel(account.id).await.unwrap();

        assert!(!result.refund_eligible, "Inside the window but nothing to refund against");
        assert!(result.refund.is_none());
        assert!(result.refund_error.is_none());
        assert_eq!(result.subscription_status, SubscriptionStatus::Canceled);
        assert!(h.provider.refunds().is_empty());
    }

    // =========================================================================
    // Provider outage leaves the account untouched
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_provider_outage_changes_nothing() {
        let mut h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(1)).await;
        h.provider
            .fail_next_cancel(ProviderError::transient("connection reset").with_status(503));
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.cancel(account.id).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.accounts.require(account.id).await.unwrap(), account);
        assert!(drain_intents(&mut h.intents).is_empty());
    }

    // =========================================================================
    // Canceling twice is an error, not a second refund
    // =========================================================================
    #[tokio::test]
    async fn test_second_cancel_is_rejected() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(1)).await;
        let service = BillingCommandService::new(h.deps.clone());

        service.cancel(account.id).await.unwrap();
        let err = service.cancel(account.id).await.unwrap_err();

        assert!(matches!(err, BillingError::InvalidState(_)));
        assert_eq!(h.provider.refunds().len(), 1);
    }
}

#[cfg(test)]
mod renewal_toggle_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::error::BillingError;
    use crate::subscriptions::BillingCommandService;
    use crate::testing::test_deps;

    // =========================================================================
    // Toggling back and forth never creates a second subscription
    // =========================================================================
    #[tokio::test]
    async fn test_toggle_oscillation_keeps_one_subscription() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        for round in 0..3 {
            let off = service.toggle_auto_renewal(account.id, false).await.unwrap();
            assert_eq!(off.subscription_status, SubscriptionStatus::Canceling, "round {}", round);
            assert!(!off.auto_renewal);

            let on = service.toggle_auto_renewal(account.id, true).await.unwrap();
            assert_eq!(on.subscription_status, SubscriptionStatus::Active, "round {}", round);
            assert!(on.auto_renewal);
        }

        assert!(h.provider.created().is_empty());
        assert!(h.provider.canceled().is_empty());
        assert_eq!(h.provider.updates().len(), 6);
        assert!(h.provider.updates().iter().all(|(id, _)| id == SUBSCRIPTION));

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.external_subscription_id.as_deref(), Some(SUBSCRIPTION));
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Disabling twice is idempotent
    // =========================================================================
    #[tokio::test]
    async fn test_disable_twice_stays_canceling() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        service.toggle_auto_renewal(account.id, false).await.unwrap();
        let again = service.toggle_auto_renewal(account.id, false).await.unwrap();

        assert_eq!(again.subscription_status, SubscriptionStatus::Canceling);
        assert_eq!(h.provider.updates(), vec![
            (SUBSCRIPTION.to_string(), true),
            (SUBSCRIPTION.to_string(), true),
        ]);
    }

    // =========================================================================
    // Canceled accounts have nothing to toggle
    // =========================================================================
    #[tokio::test]
    async fn test_toggle_on_canceled_account_is_rejected() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceled, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.toggle_auto_renewal(account.id, true).await.unwrap_err();

        assert!(matches!(err, BillingError::NoActiveSubscription));
        assert!(h.provider.updates().is_empty());
    }
}

#[cfg(test)]
mod upgrade_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::{AccountStore, AccountUpdate, NewAccount};
    use crate::dispatcher::SideEffectIntent;
    use crate::error::{BillingError, ProviderError, ProviderErrorKind};
    use crate::events::BillingAction;
    use crate::provider::{InvoiceSnapshot, ProviderSubscriptionStatus};
    use crate::subscriptions::BillingCommandService;
    use crate::testing::{drain_intents, test_deps, PRO_CENTS, STARTER_CENTS};
    use crate::webhooks::WebhookHandler;

    // =========================================================================
    // Inside the window the old payment is credited against the new plan
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_inside_window_applies_credit() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(3)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        assert_eq!(result.credit_applied, STARTER_CENTS);
        assert_eq!(result.prorated_amount, Some(PRO_CENTS - STARTER_CENTS));
        assert_eq!(h.provider.credits(), vec![(CUSTOMER.to_string(), STARTER_CENTS)]);
        assert_eq!(h.provider.canceled(), vec![SUBSCRIPTION.to_string()]);
        assert_eq!(h.audit.entries_for(BillingAction::CreditApplied).len(), 1);

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.plan, Plan::Pro);
        assert_eq!(stored.storage_quota_bytes, Plan::Pro.storage_quota_bytes());
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(
            stored.external_subscription_id.as_deref(),
            Some(result.subscription_id.as_str())
        );
        assert_ne!(result.subscription_id, SUBSCRIPTION);
    }

    // =========================================================================
    // Day 8: full price, no credit
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_outside_window_charges_full_price() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(8)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        assert_eq!(result.credit_applied, 0);
        assert_eq!(result.prorated_amount, Some(PRO_CENTS));
        assert!(h.provider.credits().is_empty());
        assert_eq!(h.provider.canceled(), vec![SUBSCRIPTION.to_string()]);
    }

    // =========================================================================
    // Stored subscription 404s: payment method comes from the last invoice
    // =========================================================================
    #[tokio::test]
    async fn test_stale_upgrade_uses_invoice_payment_method() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(3)).await;

        // Point the account at a subscription the provider no longer knows
        h.accounts
            .update(
                account.id,
                &crate::accounts::AccountUpdate {
                    external_subscription_id: Some("sub_gone".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.provider.insert_invoice(InvoiceSnapshot {
            id: "in_gone".into(),
            subscription_id: Some("sub_gone".into()),
            customer_id: Some(CUSTOMER.into()),
            paid: true,
            amount_paid: STARTER_CENTS,
            amount_due: STARTER_CENTS,
            currency: Some("usd".into()),
            billing_reason: Some("subscription_create".into()),
            charge_id: None,
            payment_intent_id: Some("pi_gone".into()),
            period_start: None,
            period_end: None,
            created: Some(time::OffsetDateTime::now_utc()),
        });
        h.provider.set_payment_intent_pm("pi_gone", "pm_from_invoice");
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        let created = h.provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].payment_method.as_deref(), Some("pm_from_invoice"));
        assert_eq!(result.credit_applied, 0);
        assert!(h.provider.canceled().is_empty(), "Nothing live to cancel");

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.plan, Plan::Pro);
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Stale subscription and no payment method anywhere
    // =========================================================================
    #[tokio::test]
    async fn test_stale_upgrade_without_payment_method_fails() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(3)).await;
        h.accounts
            .update(
                account.id,
                &crate::accounts::AccountUpdate {
                    external_subscription_id: Some("sub_gone".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.upgrade(account.id, Plan::Pro).await.unwrap_err();

        assert!(matches!(err, BillingError::NoPaymentMethod(_)));
        assert!(h.provider.created().is_empty());
        assert_eq!(
            h.accounts.require(account.id).await.unwrap().plan,
            Plan::Starter
        );
    }

    // =========================================================================
    // Replacement creation fails: the current subscription is left alone
    // =========================================================================
    #[tokio::test]
    async fn test_failed_replacement_keeps_current_subscription() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(10)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        h.provider
            .fail_next_create(ProviderError::declined("card_declined").with_status(402));
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.upgrade(account.id, Plan::Pro).await.unwrap_err();

        assert!(matches!(err, BillingError::Provider(_)));
        assert!(h.provider.canceled().is_empty());
        assert_eq!(h.accounts.require(account.id).await.unwrap(), account);
    }

    // =========================================================================
    // Replacement comes back incomplete: no plan change, old one stays live
    // =========================================================================
    #[tokio::test]
    async fn test_incomplete_replacement_keeps_current_plan() {
        let mut h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(10)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        h.provider
            .create_next_with_status(ProviderSubscriptionStatus::Incomplete);
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.upgrade(account.id, Plan::Business).await.unwrap_err();

        match err {
            BillingError::Provider(e) => assert_eq!(e.kind, ProviderErrorKind::Declined),
            other => panic!("expected a declined payment, got {:?}", other),
        }
        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.plan, Plan::Starter);
        assert_eq!(stored.storage_quota_bytes, Plan::Starter.storage_quota_bytes());
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.external_subscription_id.as_deref(), Some(SUBSCRIPTION));

        // The unpaid replacement is discarded, the paid one is kept
        let canceled = h.provider.canceled();
        assert_eq!(canceled.len(), 1);
        assert_ne!(canceled[0], SUBSCRIPTION);
        assert_eq!(
            h.provider.subscription(SUBSCRIPTION).unwrap().status,
            ProviderSubscriptionStatus::Active
        );
        assert!(h.audit.entries_for(BillingAction::PlanUpgraded).is_empty());
        assert!(drain_intents(&mut h.intents).is_empty());
    }

    // =========================================================================
    // Deletion of the replaced subscription lands after the upgrade
    // =========================================================================
    #[tokio::test]
    async fn test_replaced_subscription_deletion_is_ignored() {
        let mut h = test_deps();
        let (account, old) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(10)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        let service = BillingCommandService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();
        let deleted = h.provider.subscription(&old.id).unwrap();
        assert_eq!(deleted.status, ProviderSubscriptionStatus::Canceled);
        handler
            .handle_event(subscription_event(
                "evt_old_deleted",
                "customer.subscription.deleted",
                &deleted,
            ))
            .await
            .unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.plan, Plan::Pro);
        assert_eq!(
            stored.external_subscription_id.as_deref(),
            Some(result.subscription_id.as_str())
        );
        assert!(!drain_intents(&mut h.intents)
            .iter()
            .any(|i| matches!(i, SideEffectIntent::CancellationNotice { .. })));
    }

    // =========================================================================
    // The account points at the replacement before the old one is canceled
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_survives_failed_cancel_of_replaced_subscription() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(10)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        h.provider
            .fail_next_cancel(ProviderError::permanent("resource_locked").with_status(400));
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.plan, Plan::Pro);
        assert_eq!(
            stored.external_subscription_id.as_deref(),
            Some(result.subscription_id.as_str())
        );
        assert!(h.provider.canceled().is_empty());
    }

    // =========================================================================
    // Credit is issued in the currency of the invoice it refunds
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_credit_uses_invoice_currency() {
        let h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(2)).await;
        let mut invoice = h
            .provider
            .invoice(subscription.latest_invoice_id.as_deref().unwrap())
            .unwrap();
        invoice.currency = Some("eur".into());
        h.provider.insert_invoice(invoice);
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        assert_eq!(result.credit_applied, STARTER_CENTS);
        assert_eq!(
            h.provider.credit_currencies(),
            vec![(CUSTOMER.to_string(), "eur".to_string())]
        );
    }

    // =========================================================================
    // Customer on file but no subscription: create one directly
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_without_subscription_creates_fresh() {
        let h = test_deps();
        let account = h
            .accounts
            .create(NewAccount {
                email: "fresh@example.com".into(),
                password_hash: "$argon2id$stub".into(),
                display_name: None,
                plan: Plan::Starter,
                storage_quota_bytes: Plan::Starter.storage_quota_bytes(),
            })
            .await
            .unwrap();
        h.accounts
            .update(
                account.id,
                &AccountUpdate {
                    external_customer_id: Some(CUSTOMER.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.provider.set_customer_default_pm(CUSTOMER, "pm_default");
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.upgrade(account.id, Plan::Pro).await.unwrap();

        assert_eq!(result.credit_applied, 0);
        assert_eq!(result.prorated_amount, Some(PRO_CENTS));
        assert!(h.provider.canceled().is_empty());
        assert!(h.provider.credits().is_empty());
        let created = h.provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].price_id, "price_pro");
        assert_eq!(created[0].payment_method.as_deref(), Some("pm_default"));

        let stored = h.accounts.get(account.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.plan, Plan::Pro);
        assert_eq!(stored.storage_quota_bytes, Plan::Pro.storage_quota_bytes());
        assert_eq!(
            stored.external_subscription_id.as_deref(),
            Some(result.subscription_id.as_str())
        );
    }

    // =========================================================================
    // Upgrading to the current plan does nothing upstream
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_to_same_plan_is_noop() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.upgrade(account.id, Plan::Pro).await.unwrap_err();

        assert!(matches!(err, BillingError::NoOp(_)));
        assert!(h.provider.created().is_empty());
        assert!(h.provider.canceled().is_empty());
    }

    // =========================================================================
    // Plan with no configured price
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_to_unpriced_plan_fails() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.upgrade(account.id, Plan::Enterprise).await.unwrap_err();
        assert!(matches!(err, BillingError::PlanResolution(_)));
    }
}

#[cfg(test)]
mod reactivation_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::{AccountStore, AccountUpdate, NewAccount};
    use crate::error::BillingError;
    use crate::events::BillingAction;
    use crate::subscriptions::{BillingCommandService, FLOW_REACTIVATION};
    use crate::testing::test_deps;

    // =========================================================================
    // Only canceled accounts can start a reactivation checkout
    // =========================================================================
    #[tokio::test]
    async fn test_reactivate_requires_canceled() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(3)).await;
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.reactivate(account.id).await.unwrap_err();

        assert!(matches!(err, BillingError::InvalidState(_)));
        assert!(h.provider.checkouts().is_empty());
    }

    // =========================================================================
    // The last known price wins over the plan table
    // =========================================================================
    #[tokio::test]
    async fn test_reactivate_prefers_last_price() {
        let h = test_deps();
        let (account, _) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Canceled, days_ago(40)).await;
        h.accounts
            .update(
                account.id,
                &AccountUpdate {
                    price_id: Some("price_pro_legacy".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.reactivate(account.id).await.unwrap();

        assert_eq!(result.price_id, "price_pro_legacy");
        let checkouts = h.provider.checkouts();
        assert_eq!(checkouts.len(), 1);
        assert_eq!(checkouts[0].price_id, "price_pro_legacy");
        assert_eq!(checkouts[0].customer_id.as_deref(), Some(CUSTOMER));
        assert_eq!(
            checkouts[0].metadata.get("flow").map(String::as_str),
            Some(FLOW_REACTIVATION)
        );
        assert_eq!(
            checkouts[0].metadata.get("account_id"),
            Some(&account.id.to_string())
        );

        // Nothing changes locally until the checkout is paid
        let stored = h.accounts.get(account.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert!(h
            .audit
            .actions()
            .contains(&BillingAction::ReactivationStarted));
    }

    // =========================================================================
    // Without a stored price the plan table is used
    // =========================================================================
    #[tokio::test]
    async fn test_reactivate_falls_back_to_plan_price() {
        let h = test_deps();
        let account = h
            .accounts
            .create(NewAccount {
                email: "lapsed@example.com".into(),
                password_hash: "$argon2id$stub".into(),
                display_name: None,
                plan: Plan::Starter,
                storage_quota_bytes: Plan::Starter.storage_quota_bytes(),
            })
            .await
            .unwrap();
        h.accounts
            .update(
                account.id,
                &AccountUpdate {
                    status: Some(SubscriptionStatus::Canceled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let service = BillingCommandService::new(h.deps.clone());

        let result = service.reactivate(account.id).await.unwrap();

        assert_eq!(result.price_id, "price_starter");
        let checkouts = h.provider.checkouts();
        assert_eq!(checkouts[0].customer_id, None);
        assert_eq!(
            checkouts[0].customer_email.as_deref(),
            Some("lapsed@example.com")
        );
    }

    // =========================================================================
    // No stored price and no configured price for the plan
    // =========================================================================
    #[tokio::test]
    async fn test_reactivate_unresolvable_plan_fails() {
        let h = test_deps();
        let account = h
            .accounts
            .create(NewAccount {
                email: "bespoke@example.com".into(),
                password_hash: "$argon2id$stub".into(),
                display_name: None,
                plan: Plan::Enterprise,
                storage_quota_bytes: Plan::Enterprise.storage_quota_bytes(),
            })
            .await
            .unwrap();
        h.accounts
            .update(
                account.id,
                &AccountUpdate {
                    status: Some(SubscriptionStatus::Canceled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let service = BillingCommandService::new(h.deps.clone());

        let err = service.reactivate(account.id).await.unwrap_err();

        assert!(matches!(err, BillingError::PlanResolution(_)));
        assert!(h.provider.checkouts().is_empty());
    }
}

#[cfg(test)]
mod signup_race_tests {
    use std::sync::Arc;

    use stowage_shared::{Plan, SubscriptionStatus};
    use tokio::sync::Barrier;

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::checkout::{CheckoutService, SignupRequest};
    use crate::dispatcher::SideEffectIntent;
    use crate::ledger::InMemoryEventLedger;
    use crate::provider::PaymentProvider;
    use crate::staging::SignupStaging;
    use crate::testing::{drain_intents, test_deps, TestHarness};
    use crate::webhooks::{WebhookEvent, WebhookHandler};

    fn signup() -> SignupRequest {
        SignupRequest {
            email: "racer@example.com".into(),
            password_hash: "$argon2id$stub".into(),
            display_name: Some("Racer".into()),
            plan: Plan::Pro,
            enterprise: None,
        }
    }

    /// Start a signup and pay for it upstream
    async fn paid_signup(h: &TestHarness) -> (String, WebhookEvent) {
        let checkout = CheckoutService::new(h.deps.clone());
        let handle = checkout.begin_signup(signup()).await.unwrap();
        h.provider
            .complete_checkout_session(&handle.session_id, "cus_racer")
            .unwrap();
        let session = h
            .provider
            .retrieve_checkout_session(&handle.session_id)
            .await
            .unwrap();
        let event = checkout_event("evt_checkout", &session);
        (handle.session_id, event)
    }

    fn welcomes(intents: &[SideEffectIntent]) -> usize {
        intents
            .iter()
            .filter(|i| matches!(i, SideEffectIntent::Welcome { .. }))
            .count()
    }

    // =========================================================================
    // Webhook first, then the client callback
    // =========================================================================
    #[tokio::test]
    async fn test_webhook_then_callback_creates_one_account() {
        let mut h = test_deps();
        let (session_id, event) = paid_signup(&h).await;
        let checkout = CheckoutService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());

        handler.handle_event(event).await.unwrap();
        let completed = checkout.complete(&session_id).await.unwrap();

        assert!(!completed.created);
        assert_eq!(h.accounts.count(), 1);
        assert_eq!(completed.account.subscription_status, SubscriptionStatus::Active);
        assert_eq!(welcomes(&drain_intents(&mut h.intents)), 1);
    }

    // =========================================================================
    // Client callback first, then the webhook
    // =========================================================================
    #[tokio::test]
    async fn test_callback_then_webhook_creates_one_account() {
        let mut h = test_deps();
        let (session_id, event) = paid_signup(&h).await;
        let checkout = CheckoutService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());

        let completed = checkout.complete(&session_id).await.unwrap();
        assert!(completed.created);
        assert_eq!(completed.account.subscription_status, SubscriptionStatus::Active);
        let intents = drain_intents(&mut h.intents);
        assert_eq!(
            intents.iter().map(|i| i.name()).collect::<Vec<_>>(),
            vec!["welcome", "receipt", "admin_signup_alert"]
        );

        handler.handle_event(event).await.unwrap();

        assert_eq!(h.accounts.count(), 1);
        assert!(
            drain_intents(&mut h.intents).is_empty(),
            "Webhook finds the account already active"
        );
        let stored = h
            .accounts
            .find_by_email("racer@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, completed.account.id);
    }

    // =========================================================================
    // Both at once: exactly one account, both see the same id
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_completion_creates_one_account() {
        let mut h = test_deps();
        let (session_id, event) = paid_signup(&h).await;
        let checkout = CheckoutService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());
        let barrier = Arc::new(Barrier::new(2));

        let callback = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                checkout.complete(&session_id).await.map(|c| c.account.id)
            })
        };
        let webhook = {
            let barrier = barrier.clone();
            let accounts = h.accounts.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                // Losing the write race is transient; the provider redelivers
                if let Err(e) = handler.handle_event(event.clone()).await {
                    assert!(e.is_transient(), "{}", e);
                    handler.handle_event(event).await.unwrap();
                }
                accounts
                    .find_by_email("racer@example.com")
                    .await
                    .unwrap()
                    .map(|a| a.id)
            })
        };

        let callback_id = callback.await.unwrap().unwrap();
        let webhook_id = webhook.await.unwrap().unwrap();

        assert_eq!(callback_id, webhook_id);
        assert_eq!(h.accounts.count(), 1);
        assert_eq!(welcomes(&drain_intents(&mut h.intents)), 1);
        assert_eq!(
            h.accounts.require(callback_id).await.unwrap().subscription_status,
            SubscriptionStatus::Active
        );
    }

    // =========================================================================
    // Checkout reprocessed without a ledger record notifies once
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_reprocessed_without_ledger_notifies_once() {
        let mut h = test_deps();
        let (_, event) = paid_signup(&h).await;
        WebhookHandler::new(h.deps.clone())
            .handle_event(event.clone())
            .await
            .unwrap();

        // Outcome lost: the same event runs again from scratch
        let mut deps = h.deps.clone();
        deps.ledger = Arc::new(InMemoryEventLedger::new());
        WebhookHandler::new(deps).handle_event(event).await.unwrap();

        let intents = drain_intents(&mut h.intents);
        assert_eq!(welcomes(&intents), 1);
        assert_eq!(
            intents
                .iter()
                .filter(|i| matches!(i, SideEffectIntent::Receipt { .. }))
                .count(),
            1
        );
        assert_eq!(h.accounts.count(), 1);
    }

    // =========================================================================
    // Payment with no staged signup and no account is orphaned
    // =========================================================================
    #[tokio::test]
    async fn test_orphaned_payment_is_retryable() {
        let h = test_deps();
        let (session_id, event) = paid_signup(&h).await;
        // Staged signup expired before anyone claimed it
        h.staging.claim(&session_id).await.unwrap();
        let handler = WebhookHandler::new(h.deps.clone());

        let err = handler.handle_event(event).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.accounts.count(), 0);
    }
}

#[cfg(test)]
mod interleaving_tests {
    use serde_json::json;
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::error::BillingError;
    use crate::events::BillingAction;
    use crate::subscriptions::BillingCommandService;
    use crate::testing::{drain_intents, test_deps};
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    // =========================================================================
    // Renewal computed before a cancel cannot revive the account
    // =========================================================================
    #[tokio::test]
    async fn test_stale_renewal_after_cancel_is_refused() {
        let mut h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(10)).await;
        let service = BillingCommandService::new(h.deps.clone());

        // Webhook reads the account and reconciles the renewal...
        let renewal = renewal_invoice(&subscription, "in_renew", true);
        let read = h.accounts.require(account.id).await.unwrap();
        let reconciliation = h.deps.reconciler.invoice_paid(&read, &renewal);
        assert_eq!(reconciliation.update.status, Some(SubscriptionStatus::Active));

        // ...while the user cancels
        service.cancel(account.id).await.unwrap();
        drain_intents(&mut h.intents);

        let err = h
            .deps
            .commit(&read, reconciliation, BillingAction::PaymentSucceeded, json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Conflict(_)));
        assert!(err.is_transient());
        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert!(drain_intents(&mut h.intents).is_empty());
    }

    // =========================================================================
    // The redelivered renewal sees the cancel and is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_redelivered_renewal_after_cancel_is_rejected() {
        let mut h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(10)).await;
        let service = BillingCommandService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());

        service.cancel(account.id).await.unwrap();
        drain_intents(&mut h.intents);

        let renewal = renewal_invoice(&subscription, "in_renew", true);
        let outcome = handler
            .handle_event(invoice_event("evt_renew", "invoice.payment_succeeded", &renewal))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        let stored = h.accounts.require(account.id).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(h.audit.entries_for(BillingAction::TransitionRejected).len(), 1);
        assert!(drain_intents(&mut h.intents).is_empty());
    }

    // =========================================================================
    // A toggle racing a deletion keeps the deletion
    // =========================================================================
    #[tokio::test]
    async fn test_stale_toggle_after_deletion_is_refused() {
        let h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Pro, SubscriptionStatus::Active, days_ago(10)).await;
        let handler = WebhookHandler::new(h.deps.clone());

        let read = h.accounts.require(account.id).await.unwrap();
        let mut canceling = subscription.clone();
        canceling.cancel_at_period_end = true;
        let reconciliation = h.deps.reconciler.renewal_toggled(&read, &canceling);

        let mut deleted = subscription.clone();
        deleted.status = crate::provider::ProviderSubscriptionStatus::Canceled;
        handler
            .handle_event(subscription_event(
                "evt_deleted",
                "customer.subscription.deleted",
                &deleted,
            ))
            .await
            .unwrap();

        let err = h
            .deps
            .commit(&read, reconciliation, BillingAction::AutoRenewalDisabled, json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Conflict(_)));
        assert_eq!(
            h.accounts.require(account.id).await.unwrap().subscription_status,
            SubscriptionStatus::Canceled
        );
    }
}

#[cfg(test)]
mod invariant_tests {
    use stowage_shared::{Plan, SubscriptionStatus};

    use super::support::*;
    use crate::invariants::check_accounts;
    use crate::subscriptions::BillingCommandService;
    use crate::testing::test_deps;
    use crate::webhooks::WebhookHandler;

    // =========================================================================
    // A full lifecycle leaves every account consistent
    // =========================================================================
    #[tokio::test]
    async fn test_lifecycle_preserves_invariants() {
        let h = test_deps();
        let (account, subscription) =
            seed_account(&h, Plan::Starter, SubscriptionStatus::Active, days_ago(2)).await;
        h.provider.set_customer_default_pm(CUSTOMER, "pm_card");
        let commands = BillingCommandService::new(h.deps.clone());
        let handler = WebhookHandler::new(h.deps.clone());

        let failed = renewal_invoice(&subscription, "in_1", false);
        handler
            .handle_event(invoice_event("evt_1", "invoice.payment_failed", &failed))
            .await
            .unwrap();
        assert!(check_accounts(&h.accounts.all(), time::OffsetDateTime::now_utc()).healthy);

        commands.upgrade(account.id, Plan::Business).await.unwrap();
        assert!(check_accounts(&h.accounts.all(), time::OffsetDateTime::now_utc()).healthy);

        commands.toggle_auto_renewal(account.id, false).await.unwrap();
        commands.cancel(account.id).await.unwrap();
        let summary = check_accounts(&h.accounts.all(), time::OffsetDateTime::now_utc());
        assert!(summary.healthy, "{:?}", summary.violations);
    }
}
