//! Stripe Checkout sessions

use starter_shared::Plan;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CustomerId,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingAccount;

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a subscription-mode checkout session for a user on the free plan
    ///
    /// The session metadata carries `user_id` and `plan`; the webhook uses them
    /// to link the new subscription to the user.
    pub async fn create_subscription_checkout(
        &self,
        account: &BillingAccount,
        plan: Plan,
    ) -> BillingResult<CheckoutSession> {
        let price_id = self.stripe.config().require_price_id(plan)?;

        let customer = account
            .stripe_customer_id
            .as_deref()
            .map(|id| {
                id.parse::<CustomerId>()
                    .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
            })
            .transpose()?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/dashboard/billing?success=true&session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/pricing?canceled=true", base_url);

        let user_id = account.user_id.to_string();
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.clone());
        metadata.insert("plan".to_string(), plan.to_string());

        // Stripe creates the customer from the email when none exists yet
        let customer_email = match customer {
            Some(_) => None,
            None => Some(account.email.as_str()),
        };

        let params = CreateCheckoutSession {
            customer,
            customer_email,
            client_reference_id: Some(&user_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %account.user_id,
            session_id = %session.id,
            plan = %plan,
            "Created checkout session"
        );

        Ok(session)
    }
}
