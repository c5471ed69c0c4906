//! Stripe client configuration

use starter_shared::Plan;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each paid plan
    pub price_ids: PriceIds,
    /// Base URL for success/cancel/return redirects
    pub app_base_url: String,
}

/// Stripe price IDs for the paid plans
/// Plan hierarchy: Free (no price) → Basic → Premium
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub basic: String,
    pub premium: String,
}

impl StripeConfig {
    /// Create config from environment variables (a `.env` file is honoured)
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            secret_key: required_var("STRIPE_SECRET_KEY")?,
            webhook_secret: required_var("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                basic: required_var("STRIPE_PRICE_BASIC")?,
                premium: required_var("STRIPE_PRICE_PREMIUM")?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Get price ID for a plan. The free plan has no price.
    pub fn price_id_for_plan(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Free => None,
            Plan::Basic => Some(&self.price_ids.basic),
            Plan::Premium => Some(&self.price_ids.premium),
        }
    }

    /// Get plan from price ID
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<Plan> {
        if price_id == self.price_ids.basic {
            Some(Plan::Basic)
        } else if price_id == self.price_ids.premium {
            Some(Plan::Premium)
        } else {
            None
        }
    }

    /// Price ID for a paid plan, or an invalid-plan error
    pub fn require_price_id(&self, plan: Plan) -> BillingResult<&str> {
        self.price_id_for_plan(plan)
            .ok_or_else(|| BillingError::InvalidPlan(format!("{} has no Stripe price", plan)))
    }
}

fn required_var(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
