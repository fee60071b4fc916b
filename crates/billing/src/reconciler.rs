//! Subscription reconciliation
//!
//! Pure functions from (current account, provider snapshot) to the account
//! update and side-effect intents that follow from it. Nothing here talks to
//! the provider or the database.
//!
//! Rules applied everywhere:
//! - status only moves along [`SubscriptionStatus::can_transition_to`] edges;
//!   anything else keeps the current status and is reported as rejected
//! - `CANCELED -> ACTIVE` additionally requires a fresh subscription id
//! - events about a subscription other than the account's current one are
//!   ignored, unless the account has no live subscription to protect
//! - period windows from events never move the stored window backwards

use serde::Serialize;
use stowage_shared::{Account, Plan, SubscriptionStatus};

use crate::accounts::{AccountUpdate, PeriodUpdate};
use crate::client::PriceIds;
use crate::dispatcher::SideEffectIntent;
use crate::provider::{
    CheckoutSessionSnapshot, InvoiceSnapshot, ProviderSubscriptionStatus, SubscriptionSnapshot,
};

/// Billing reason the provider uses for renewal invoices
pub const RECURRING_BILLING_REASON: &str = "subscription_cycle";

/// A status change the lifecycle does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusRejection {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
}

/// What to do to an account in response to one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub update: AccountUpdate,
    pub intents: Vec<SideEffectIntent>,
    pub rejected: Option<StatusRejection>,
    /// Set when the snapshot was not applied at all
    pub skipped: Option<&'static str>,
}

impl Reconciliation {
    fn skip(reason: &'static str) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Local status implied by the provider's view of a subscription
pub fn status_from_snapshot(snapshot: &SubscriptionSnapshot) -> SubscriptionStatus {
    match snapshot.status {
        ProviderSubscriptionStatus::PastDue | ProviderSubscriptionStatus::Unpaid => {
            SubscriptionStatus::PastDue
        }
        ProviderSubscriptionStatus::Canceled | ProviderSubscriptionStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
        ProviderSubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        ProviderSubscriptionStatus::Active
        | ProviderSubscriptionStatus::Trialing
        | ProviderSubscriptionStatus::Paused => {
            if snapshot.cancel_at_period_end {
                SubscriptionStatus::Canceling
            } else {
                SubscriptionStatus::Active
            }
        }
    }
}

/// Check a status change against the lifecycle
pub fn guard_transition(
    current: SubscriptionStatus,
    next: SubscriptionStatus,
    fresh_subscription: bool,
) -> Result<SubscriptionStatus, StatusRejection> {
    let rejection = StatusRejection {
        from: current,
        to: next,
    };

    if !current.can_transition_to(next) {
        return Err(rejection);
    }
    if current == SubscriptionStatus::Canceled
        && next == SubscriptionStatus::Active
        && !fresh_subscription
    {
        return Err(rejection);
    }
    Ok(next)
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    prices: PriceIds,
}

impl SubscriptionReconciler {
    pub fn new(prices: PriceIds) -> Self {
        Self { prices }
    }

    pub fn prices(&self) -> &PriceIds {
        &self.prices
    }

    // =========================================================================
    // Webhook-driven
    // =========================================================================

    /// Checkout completed and paid. Attaches the provider ids and activates.
    ///
    /// Both the client callback and the checkout webhook land here. Only the
    /// one that moves the account into ACTIVE on this subscription queues the
    /// welcome, receipt and admin notifications.
    pub fn checkout_completed(
        &self,
        account: &Account,
        session: &CheckoutSessionSnapshot,
        subscription: &SubscriptionSnapshot,
        amount_paid_cents: i64,
    ) -> Reconciliation {
        let fresh = is_fresh(account, &subscription.id);
        if fresh
            && account.external_subscription_id.is_some()
            && account.subscription_status.is_live()
        {
            return Reconciliation::skip("checkout for a superseded subscription");
        }

        let already_active = !fresh
            && matches!(
                account.subscription_status,
                SubscriptionStatus::Active | SubscriptionStatus::Canceling
            );
        let next = if already_active {
            account.subscription_status
        } else {
            SubscriptionStatus::Active
        };

        let mut r = Reconciliation::default();
        r.update.external_customer_id = session
            .customer_id
            .clone()
            .or_else(|| Some(subscription.customer_id.clone()));
        r.update.external_subscription_id = Some(subscription.id.clone());
        self.apply_price(account, subscription.price_id.as_deref(), &mut r.update);
        r.update.period = Some(period_of(subscription, !fresh));

        if !self.apply_status(account, next, fresh, &mut r) {
            // Keep the ids out of a rejected write so the invariant holds
            return Reconciliation {
                rejected: r.rejected,
                ..Reconciliation::skip("checkout rejected by lifecycle")
            };
        }

        if !already_active {
            r.intents = vec![
                SideEffectIntent::Welcome {
                    account_id: account.id,
                    email: account.email.clone(),
                    plan: self.resulting_plan(account, &r.update),
                },
                SideEffectIntent::Receipt {
                    account_id: account.id,
                    email: account.email.clone(),
                    amount_cents: amount_paid_cents,
                    invoice_id: subscription.latest_invoice_id.clone(),
                },
                SideEffectIntent::AdminSignupAlert {
                    account_id: account.id,
                    email: account.email.clone(),
                    plan: self.resulting_plan(account, &r.update),
                    amount_cents: amount_paid_cents,
                },
            ];
        }
        r
    }

    /// `customer.subscription.created` / `customer.subscription.updated`
    pub fn subscription_changed(
        &self,
        account: &Account,
        snapshot: &SubscriptionSnapshot,
    ) -> Reconciliation {
        let fresh = is_fresh(account, &snapshot.id);
        if fresh && account.external_subscription_id.is_some() {
            let replaceable = matches!(
                account.subscription_status,
                SubscriptionStatus::None | SubscriptionStatus::Canceled
            );
            if !replaceable || !snapshot.status.is_live() {
                return Reconciliation::skip("event for a superseded subscription");
            }
        }

        let mut r = Reconciliation::default();
        let next = status_from_snapshot(snapshot);
        if fresh {
            r.update.external_customer_id = Some(snapshot.customer_id.clone());
            r.update.external_subscription_id = Some(snapshot.id.clone());
        }
        if !self.apply_status(account, next, fresh, &mut r) && fresh {
            return Reconciliation {
                rejected: r.rejected,
                ..Reconciliation::skip("subscription rejected by lifecycle")
            };
        }
        self.apply_price(account, snapshot.price_id.as_deref(), &mut r.update);
        r.update.period = Some(period_of(snapshot, !fresh));
        r
    }

    /// `customer.subscription.deleted`
    pub fn subscription_deleted(
        &self,
        account: &Account,
        snapshot: &SubscriptionSnapshot,
    ) -> Reconciliation {
        if account.external_subscription_id.as_deref() != Some(snapshot.id.as_str()) {
            return Reconciliation::skip("deletion of a superseded subscription");
        }

        let mut r = Reconciliation::default();
        if self.apply_status(account, SubscriptionStatus::Canceled, false, &mut r) {
            r.intents.push(SideEffectIntent::CancellationNotice {
                account_id: account.id,
                email: account.email.clone(),
            });
        }
        r
    }

    /// `invoice.payment_succeeded`
    pub fn invoice_paid(&self, account: &Account, invoice: &InvoiceSnapshot) -> Reconciliation {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            return Reconciliation::skip("invoice not tied to a subscription");
        };
        if account.external_subscription_id.as_deref() != Some(subscription_id) {
            return Reconciliation::skip("invoice for a superseded subscription");
        }

        let mut r = Reconciliation::default();
        // A payment does not change the renewal flag
        let next = match account.subscription_status {
            SubscriptionStatus::Canceling => SubscriptionStatus::Canceling,
            _ => SubscriptionStatus::Active,
        };
        self.apply_status(account, next, false, &mut r);
        if r.rejected.is_some() {
            return r;
        }

        r.update.period = Some(PeriodUpdate {
            start: invoice.period_start,
            end: invoice.period_end,
            only_if_newer: true,
        });

        if invoice.billing_reason.as_deref() == Some(RECURRING_BILLING_REASON) {
            r.intents.push(SideEffectIntent::RenewalReceipt {
                account_id: account.id,
                email: account.email.clone(),
                amount_cents: invoice.amount_paid,
                invoice_id: invoice.id.clone(),
                period_end: invoice.period_end,
            });
        }
        r
    }

    /// `invoice.payment_failed`
    pub fn invoice_failed(
        &self,
        account: &Account,
        invoice: &InvoiceSnapshot,
        failure_reason: Option<String>,
    ) -> Reconciliation {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            return Reconciliation::skip("invoice not tied to a subscription");
        };
        if account.external_subscription_id.as_deref() != Some(subscription_id) {
            return Reconciliation::skip("invoice for a superseded subscription");
        }

        let mut r = Reconciliation::default();
        if self.apply_status(account, SubscriptionStatus::PastDue, false, &mut r) {
            r.intents.push(SideEffectIntent::PaymentFailed {
                account_id: account.id,
                email: account.email.clone(),
                amount_due_cents: invoice.amount_due,
                reason: failure_reason,
            });
        }
        r
    }

    // =========================================================================
    // Command-driven
    // =========================================================================

    /// After the provider confirmed a renewal flag change
    pub fn renewal_toggled(
        &self,
        account: &Account,
        snapshot: &SubscriptionSnapshot,
    ) -> Reconciliation {
        if account.external_subscription_id.as_deref() != Some(snapshot.id.as_str()) {
            return Reconciliation::skip("renewal change on a superseded subscription");
        }

        let mut r = Reconciliation::default();
        self.apply_status(account, status_from_snapshot(snapshot), false, &mut r);
        self.apply_price(account, snapshot.price_id.as_deref(), &mut r.update);
        r.update.period = Some(period_of(snapshot, true));
        r
    }

    /// After the provider confirmed an immediate cancellation
    pub fn canceled(&self, account: &Account) -> Reconciliation {
        let mut r = Reconciliation::default();
        self.apply_status(account, SubscriptionStatus::Canceled, false, &mut r);
        r
    }

    /// After the provider confirmed the replacement subscription of an upgrade
    pub fn upgraded(
        &self,
        account: &Account,
        plan: Plan,
        snapshot: &SubscriptionSnapshot,
    ) -> Reconciliation {
        if !snapshot.status.is_paid() {
            return Reconciliation::skip("replacement subscription is not paid");
        }

        let fresh = is_fresh(account, &snapshot.id);
        let mut r = Reconciliation::default();
        if !self.apply_status(account, status_from_snapshot(snapshot), fresh, &mut r) {
            return Reconciliation {
                rejected: r.rejected,
                ..Reconciliation::skip("upgrade rejected by lifecycle")
            };
        }
        r.update.external_customer_id = Some(snapshot.customer_id.clone());
        r.update.external_subscription_id = Some(snapshot.id.clone());
        r.update.plan = Some(plan);
        r.update.storage_quota_bytes = Some(plan.storage_quota_bytes());
        r.update.price_id = snapshot.price_id.clone();
        r.update.period = Some(period_of(snapshot, false));
        r
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Sets `r.update.status` if the move is allowed. Returns false when rejected.
    fn apply_status(
        &self,
        account: &Account,
        next: SubscriptionStatus,
        fresh_subscription: bool,
        r: &mut Reconciliation,
    ) -> bool {
        match guard_transition(account.subscription_status, next, fresh_subscription) {
            Ok(status) => {
                r.update.status = Some(status);
                true
            }
            Err(rejection) => {
                tracing::warn!(
                    account_id = %account.id,
                    from = %rejection.from,
                    to = %rejection.to,
                    "Rejected illegal subscription status transition"
                );
                r.rejected = Some(rejection);
                false
            }
        }
    }

    /// Price id, and plan/quota when the price maps to a different catalog plan
    fn apply_price(&self, account: &Account, price_id: Option<&str>, update: &mut AccountUpdate) {
        let Some(price_id) = price_id else {
            return;
        };
        update.price_id = Some(price_id.to_string());

        if let Some(plan) = self.prices.plan_for_price_id(price_id) {
            if plan != account.plan {
                update.plan = Some(plan);
                update.storage_quota_bytes = Some(plan.storage_quota_bytes());
            }
        }
    }

    fn resulting_plan(&self, account: &Account, update: &AccountUpdate) -> Plan {
        update.plan.unwrap_or(account.plan)
    }
}

fn is_fresh(account: &Account, subscription_id: &str) -> bool {
    account.external_subscription_id.as_deref() != Some(subscription_id)
}

fn period_of(snapshot: &SubscriptionSnapshot, only_if_newer: bool) -> PeriodUpdate {
    PeriodUpdate {
        start: snapshot.current_period_start,
        end: snapshot.current_period_end,
        only_if_newer,
    }
}
