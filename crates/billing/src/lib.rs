// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Starter Billing Module
//!
//! Plan entitlements and plan changes on top of Stripe.
//!
//! ## Features
//!
//! - **Entitlements**: What each plan includes, for UI gating and server-side checks
//! - **Plan Transitions**: Checkout for new subscriptions, end-of-period downgrades,
//!   prorated upgrades with payment reconfirmation
//! - **Billing Portal / Checkout**: Hosted Stripe pages
//! - **Webhooks**: Keep the stored plan in step with Stripe

pub mod checkout;
pub mod client;
pub mod collaborator;
pub mod entitlement;
pub mod error;
pub mod portal;
pub mod store;
pub mod stripe_billing;
pub mod transition;
pub mod webhook;

// Checkout / Portal
pub use checkout::CheckoutService;
pub use portal::PortalService;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Collaborator
pub use collaborator::{
    BillingCollaborator, BillingPortalLink, CheckoutLink, PaymentConfirmation, PaymentStatus,
    ProrationPreview, ScheduledChange, UpgradeExecution,
};

// Entitlements
pub use entitlement::{format_limit_for_display, EntitlementTable, EntitlementTableBuilder};

// Error
pub use error::{BillingError, BillingResult};

// Store
pub use store::{BillingAccount, PgPlanStore, PlanStore};

// Stripe
pub use stripe_billing::StripeBilling;

// Transitions
pub use transition::{
    decide_transition, PlanTransitionDecider, TransitionDecision, TransitionKind,
    TransitionRequest, UpgradeOutcome, UpgradeQuote,
};

// Webhooks
pub use webhook::{verify_signature, WebhookHandler, WebhookOutcome};

pub use starter_shared::{FeatureId, FeatureLimit, Plan, UserId};
