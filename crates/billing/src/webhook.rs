//! Stripe webhook handling
//!
//! Keeps the stored plan in step with Stripe. This is the only writer of
//! `users.plan`: upgrades, scheduled downgrades and new subscriptions all
//! land here once Stripe has applied them.
//!
//! Signatures are verified by hand (HMAC-SHA256 over `"{t}.{payload}"`)
//! rather than through async-stripe, whose event types lag the API version.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use starter_shared::{Plan, UserId};
use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::store::PlanStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header (`t=…,v1=…[,v1=…]`) against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, "Webhook signature outside tolerance window");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let matches = signatures.iter().any(|signature| {
        HmacSha256::new_from_slice(secret.as_bytes())
            .map(|mut mac| {
                mac.update(signed_payload.as_bytes());
                // verify_slice compares in constant time
                mac.verify_slice(signature).is_ok()
            })
            .unwrap_or(false)
    });

    if matches {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

/// What a webhook delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    PlanUpdated { plan: Plan },
    Ignored { event_type: String },
    /// The event names a subscription the user no longer has
    Superseded { subscription_id: String },
}

/// Applies Stripe subscription events to the plan store
///
/// Stripe does not deliver events in order. Subscription events only touch
/// a user whose stored subscription is the one the event names, so a late
/// event for an ended or replaced subscription is a no-op.
pub struct WebhookHandler<S> {
    store: S,
    config: StripeConfig,
}

impl<S: PlanStore> WebhookHandler<S> {
    pub fn new(store: S, config: StripeConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Verify and process one delivery
    pub async fn handle(&self, payload: &str, signature_header: &str) -> BillingResult<WebhookOutcome> {
        verify_signature(
            payload,
            signature_header,
            &self.config.webhook_secret,
            OffsetDateTime::now_utc(),
        )?;
        self.process(payload).await
    }

    /// Process a payload whose signature was already checked
    pub async fn process(&self, payload: &str) -> BillingResult<WebhookOutcome> {
        let event: WebhookEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Received Stripe webhook");

        let object = &event.data.object;
        match event.event_type.as_str() {
            "checkout.session.completed" => self.checkout_completed(object).await,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.subscription_changed(&event.event_type, object).await
            }
            "customer.subscription.deleted" => {
                let customer_id = required_str(object, "customer")?;
                let subscription_id = required_str(object, "id")?;
                self.apply(customer_id, subscription_id, Plan::Free).await
            }
            _ => Ok(WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            }),
        }
    }

    async fn checkout_completed(&self, session: &Value) -> BillingResult<WebhookOutcome> {
        if session["mode"].as_str() != Some("subscription") {
            return Ok(WebhookOutcome::Ignored {
                event_type: "checkout.session.completed".to_string(),
            });
        }

        let user_id = required_str(&session["metadata"], "user_id")?
            .parse::<uuid::Uuid>()
            .map(UserId)
            .map_err(|e| BillingError::WebhookPayloadInvalid(format!("Bad user_id: {}", e)))?;
        let plan: Plan = required_str(&session["metadata"], "plan")?
            .parse()
            .map_err(|e| BillingError::WebhookPayloadInvalid(format!("{}", e)))?;
        let customer_id = required_str(session, "customer")?;
        let subscription_id = required_str(session, "subscription")?;

        self.store
            .link_subscription(user_id, plan, customer_id, subscription_id)
            .await?;

        Ok(WebhookOutcome::PlanUpdated { plan })
    }

    async fn subscription_changed(
        &self,
        event_type: &str,
        subscription: &Value,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = required_str(subscription, "customer")?;
        let subscription_id = required_str(subscription, "id")?;
        let status = required_str(subscription, "status")?;

        let plan = match status {
            "active" | "trialing" => {
                let price_id = subscription["items"]["data"][0]["price"]["id"]
                    .as_str()
                    .ok_or_else(|| {
                        BillingError::WebhookPayloadInvalid("Subscription has no price".to_string())
                    })?;
                self.config.plan_for_price_id(price_id).ok_or_else(|| {
                    tracing::error!(price_id = %price_id, "Webhook references unknown price");
                    BillingError::InvalidPlan(format!("price {}", price_id))
                })?
            }
            "canceled" | "unpaid" | "incomplete_expired" => Plan::Free,
            other => {
                // past_due / incomplete keep the current plan until Stripe resolves them
                tracing::info!(status = %other, customer_id = %customer_id, "Subscription status leaves plan unchanged");
                return Ok(WebhookOutcome::Ignored {
                    event_type: event_type.to_string(),
                });
            }
        };

        self.apply(customer_id, subscription_id, plan).await
    }

    /// Write `plan` for the customer if `subscription_id` is still theirs.
    /// Free ends the subscription.
    async fn apply(
        &self,
        customer_id: &str,
        subscription_id: &str,
        plan: Plan,
    ) -> BillingResult<WebhookOutcome> {
        let applied = if plan == Plan::Free {
            self.store.end_subscription(customer_id, subscription_id).await?
        } else {
            self.store
                .set_subscription_plan(customer_id, subscription_id, plan)
                .await?
        };

        if applied {
            Ok(WebhookOutcome::PlanUpdated { plan })
        } else {
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                plan = %plan,
                "Skipping event for a subscription that is not the customer's current one"
            );
            Ok(WebhookOutcome::Superseded {
                subscription_id: subscription_id.to_string(),
            })
        }
    }
}

fn required_str<'a>(object: &'a Value, field: &str) -> BillingResult<&'a str> {
    object[field]
        .as_str()
        .ok_or_else(|| BillingError::WebhookPayloadInvalid(format!("Missing field: {}", field)))
}
