//! Billing collaborator seam
//!
//! Everything the plan transition flow needs from the payment provider.
//! `StripeBilling` is the production implementation; tests substitute spies.

use async_trait::async_trait;
use serde::Serialize;
use starter_shared::Plan;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Proration preview for switching plans mid-period. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationPreview {
    /// Total the customer would owe right now
    pub amount_due: Option<i64>,
    /// Sum of the proration line items
    pub proration_amount_now: Option<i64>,
    pub currency: String,
}

impl ProrationPreview {
    /// Charge to show before confirming: `amount_due` when present, otherwise
    /// the proration amount
    pub fn immediate_charge(&self) -> Option<i64> {
        self.amount_due.or(self.proration_amount_now)
    }
}

/// A plan change booked for a future date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledChange {
    #[serde(with = "time::serde::timestamp")]
    pub effective_at: OffsetDateTime,
}

/// Result of applying an upgrade to the subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeExecution {
    /// Payment confirmation handle when the provider created a payment
    pub client_secret: Option<String>,
}

/// Status of the payment attached to a confirmation handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    RequiresAction,
    RequiresConfirmation,
    RequiresPaymentMethod,
    Other(String),
}

impl PaymentStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "requires_action" => Self::RequiresAction,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_payment_method" => Self::RequiresPaymentMethod,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RequiresAction => "requires_action",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::Other(status) => status,
        }
    }
}

/// Outcome of confirming a payment with the payment method on file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentConfirmation {
    /// Provider's error message when the confirmation was declined
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingPortalLink {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckoutLink {
    pub url: Option<String>,
}

/// Payment provider operations scoped to one customer
#[async_trait]
pub trait BillingCollaborator: Send + Sync {
    async fn preview_proration(&self, current: Plan, target: Plan) -> BillingResult<ProrationPreview>;

    /// Book `target` for the end of the current billing period
    async fn schedule_downgrade(&self, target: Plan) -> BillingResult<ScheduledChange>;

    async fn execute_upgrade(&self, target: Plan) -> BillingResult<UpgradeExecution>;

    async fn retrieve_payment_status(&self, client_secret: &str) -> BillingResult<PaymentStatus>;

    async fn confirm_payment(&self, client_secret: &str) -> BillingResult<PaymentConfirmation>;

    async fn create_billing_portal_link(&self) -> BillingResult<BillingPortalLink>;

    /// Hosted checkout for a user without a subscription
    async fn create_checkout_link(&self, target: Plan) -> BillingResult<CheckoutLink>;
}
