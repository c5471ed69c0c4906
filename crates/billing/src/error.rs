//! Billing error types

use starter_shared::{FeatureId, Plan, SharedError};
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Feature {feature} is not included in the {plan} plan")]
    FeatureNotAvailable { plan: Plan, feature: FeatureId },

    #[error("Moving from {from} to {to} is not an immediate upgrade")]
    NotAnUpgrade { from: Plan, to: Plan },

    #[error("Proration preview did not include a charge amount")]
    MissingProrationAmount,

    /// Message from the payment collaborator, kept verbatim
    #[error("{0}")]
    PaymentConfirmation(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Message safe to show to the user who initiated the action
    pub fn user_message(&self) -> String {
        match self {
            Self::PaymentConfirmation(message) => message.clone(),
            Self::FeatureNotAvailable { .. } => self.to_string(),
            Self::NotAnUpgrade { .. } => {
                "This plan change can't be applied right away. Please start it again.".to_string()
            }
            Self::InvalidPlan(plan) => format!("\"{}\" is not a plan we offer.", plan),
            Self::SubscriptionNotFound(_) | Self::CustomerNotFound(_) => {
                "We couldn't find your billing account. Please contact support.".to_string()
            }
            Self::StripeApi(_) | Self::MissingProrationAmount => {
                "Our payment provider could not process the request. Please try again.".to_string()
            }
            _ => "Something went wrong while updating your plan. Please try again.".to_string(),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::StripeApi(format!("Failed to call Stripe API: {}", err))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::InvalidPlan(plan) => BillingError::InvalidPlan(plan),
            other => BillingError::Config(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
