//! Stripe implementation of the billing collaborator
//!
//! Bound to a single user's billing account. Calls that async-stripe 0.39
//! does not model (invoice preview, subscription schedule phases, payment
//! intent confirmation) go through the form-encoded REST API directly.

use async_trait::async_trait;
use serde_json::Value;
use starter_shared::Plan;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{PaymentIntent, PaymentIntentId, Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
use time::OffsetDateTime;

use crate::checkout::CheckoutService;
use crate::client::StripeClient;
use crate::collaborator::{
    BillingCollaborator, BillingPortalLink, CheckoutLink, PaymentConfirmation, PaymentStatus,
    ProrationPreview, ScheduledChange, UpgradeExecution,
};
use crate::error::{BillingError, BillingResult};
use crate::portal::PortalService;
use crate::store::BillingAccount;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe-backed billing operations for one account
pub struct StripeBilling {
    stripe: StripeClient,
    account: BillingAccount,
    http: reqwest::Client,
}

impl StripeBilling {
    pub fn new(stripe: StripeClient, account: BillingAccount) -> Self {
        Self {
            stripe,
            account,
            http: reqwest::Client::new(),
        }
    }

    pub fn account(&self) -> &BillingAccount {
        &self.account
    }

    fn customer_id(&self) -> BillingResult<&str> {
        self.account
            .stripe_customer_id
            .as_deref()
            .ok_or_else(|| BillingError::CustomerNotFound(self.account.user_id.to_string()))
    }

    fn subscription_id(&self) -> BillingResult<SubscriptionId> {
        let raw = self
            .account
            .stripe_subscription_id
            .as_deref()
            .ok_or_else(|| BillingError::SubscriptionNotFound(self.account.user_id.to_string()))?;

        raw.parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }

    async fn current_subscription(&self) -> BillingResult<Subscription> {
        let sub_id = self.subscription_id()?;
        Ok(Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?)
    }

    /// POST a form to the Stripe REST API, returning the HTTP status and JSON body
    async fn send_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> BillingResult<(reqwest::StatusCode, Value)> {
        let response = self
            .http
            .post(format!("{}/{}", STRIPE_API_BASE, path))
            .bearer_auth(&self.stripe.config().secret_key)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        })?;

        Ok((status, body))
    }

    /// Like `send_form`, but any non-2xx answer is an error
    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> BillingResult<Value> {
        let (status, body) = self.send_form(path, form).await?;

        if !status.is_success() {
            let message = stripe_error_message(&body).unwrap_or_else(|| body.to_string());
            tracing::error!(
                path = %path,
                status = %status,
                error = %message,
                "Stripe API call failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status, message
            )));
        }

        Ok(body)
    }
}

#[async_trait]
impl BillingCollaborator for StripeBilling {
    async fn preview_proration(&self, current: Plan, target: Plan) -> BillingResult<ProrationPreview> {
        let customer_id = self.customer_id()?;
        let sub_id = self.subscription_id()?;
        let new_price_id = self.stripe.config().require_price_id(target)?;

        let subscription = self.current_subscription().await?;
        let item_id = first_item_id(&subscription)?;

        let form = [
            ("customer", customer_id.to_string()),
            ("subscription", sub_id.to_string()),
            ("subscription_details[items][0][id]", item_id),
            ("subscription_details[items][0][price]", new_price_id.to_string()),
            (
                "subscription_details[proration_behavior]",
                "always_invoice".to_string(),
            ),
        ];

        let invoice = self.post_form("invoices/create_preview", &form).await?;
        let preview = parse_proration_preview(&invoice)?;

        tracing::info!(
            user_id = %self.account.user_id,
            current_plan = %current,
            target_plan = %target,
            amount_due = ?preview.amount_due,
            proration_amount_now = ?preview.proration_amount_now,
            currency = %preview.currency,
            "Previewed upgrade proration"
        );

        Ok(preview)
    }

    async fn schedule_downgrade(&self, target: Plan) -> BillingResult<ScheduledChange> {
        let subscription = self.current_subscription().await?;

        // Free has no price: let the subscription lapse at period end and the
        // deletion webhook moves the user to free
        if target == Plan::Free {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            let updated = Subscription::update(self.stripe.inner(), &subscription.id, params).await?;
            let effective_at = timestamp(updated.current_period_end)?;

            tracing::info!(
                user_id = %self.account.user_id,
                effective_at = %effective_at,
                "Set cancel_at_period_end for downgrade to free"
            );

            return Ok(ScheduledChange { effective_at });
        }

        let target_price = self.stripe.config().require_price_id(target)?;

        let schedule = self
            .post_form(
                "subscription_schedules",
                &[("from_subscription", subscription.id.to_string())],
            )
            .await?;

        let phase = current_phase(&schedule)?;
        self.post_form(
            &format!("subscription_schedules/{}", phase.schedule_id),
            &downgrade_phases_form(&phase, target_price),
        )
        .await?;

        let effective_at = timestamp(phase.end)?;

        tracing::info!(
            user_id = %self.account.user_id,
            schedule_id = %phase.schedule_id,
            target_plan = %target,
            effective_at = %effective_at,
            "Scheduled downgrade for period end"
        );

        Ok(ScheduledChange { effective_at })
    }

    async fn execute_upgrade(&self, target: Plan) -> BillingResult<UpgradeExecution> {
        let price_id = self.stripe.config().require_price_id(target)?;
        let subscription = self.current_subscription().await?;
        let item_id = first_item_id(&subscription)?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("plan".to_string(), target.to_string());

        // always_invoice bills the prorated difference right away instead of
        // on the next renewal
        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(SubscriptionProrationBehavior::AlwaysInvoice),
            expand: &["latest_invoice.payment_intent"],
            ..Default::default()
        };

        let updated = Subscription::update(self.stripe.inner(), &subscription.id, params).await?;

        let client_secret = updated
            .latest_invoice
            .as_ref()
            .and_then(|invoice| invoice.as_object())
            .and_then(|invoice| invoice.payment_intent.as_ref())
            .and_then(|intent| intent.as_object())
            .and_then(|intent| intent.client_secret.clone());

        tracing::info!(
            user_id = %self.account.user_id,
            subscription_id = %updated.id,
            target_plan = %target,
            has_payment = client_secret.is_some(),
            "Updated subscription for upgrade"
        );

        Ok(UpgradeExecution { client_secret })
    }

    async fn retrieve_payment_status(&self, client_secret: &str) -> BillingResult<PaymentStatus> {
        let intent_id = payment_intent_id(client_secret)?
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment intent ID: {}", e)))?;

        let intent = PaymentIntent::retrieve(self.stripe.inner(), &intent_id, &[]).await?;

        Ok(PaymentStatus::parse(intent.status.as_str()))
    }

    async fn confirm_payment(&self, client_secret: &str) -> BillingResult<PaymentConfirmation> {
        let intent_id = payment_intent_id(client_secret)?;
        let return_url = format!("{}/dashboard/billing", self.stripe.config().app_base_url);

        let (status, body) = self
            .send_form(
                &format!("payment_intents/{}/confirm", intent_id),
                &[("return_url", return_url)],
            )
            .await?;

        let confirmation = confirmation_from_response(status, &body)?;
        if let Some(error) = &confirmation.error {
            tracing::warn!(
                user_id = %self.account.user_id,
                payment_intent = %intent_id,
                error = %error,
                "Payment confirmation did not go through"
            );
        }

        Ok(confirmation)
    }

    async fn create_billing_portal_link(&self) -> BillingResult<BillingPortalLink> {
        let customer_id = self.customer_id()?;
        let session = PortalService::new(self.stripe.clone())
            .create_portal_session(customer_id)
            .await?;

        Ok(BillingPortalLink {
            url: Some(session.url),
        })
    }

    async fn create_checkout_link(&self, target: Plan) -> BillingResult<CheckoutLink> {
        let session = CheckoutService::new(self.stripe.clone())
            .create_subscription_checkout(&self.account, target)
            .await?;

        Ok(CheckoutLink { url: session.url })
    }
}

fn first_item_id(subscription: &Subscription) -> BillingResult<String> {
    subscription
        .items
        .data
        .first()
        .map(|item| item.id.to_string())
        .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))
}

fn timestamp(unix: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| BillingError::StripeApi(format!("Invalid timestamp {}: {}", unix, e)))
}

/// `pi_123_secret_456` → `pi_123`
fn payment_intent_id(client_secret: &str) -> BillingResult<&str> {
    match client_secret.split_once("_secret_") {
        Some((id, _)) if id.starts_with("pi_") => Ok(id),
        _ => Err(BillingError::StripeApi(
            "Malformed payment client secret".to_string(),
        )),
    }
}

fn stripe_error_message(body: &Value) -> Option<String> {
    body["error"]["message"].as_str().map(str::to_string)
}

/// The phase a subscription schedule starts with when created from a
/// subscription: the current price until the period ends
#[derive(Debug, Clone, PartialEq, Eq)]
struct CurrentPhase {
    schedule_id: String,
    start: i64,
    end: i64,
    price: String,
}

fn current_phase(schedule: &Value) -> BillingResult<CurrentPhase> {
    let schedule_id = schedule["id"]
        .as_str()
        .ok_or_else(|| BillingError::StripeApi("Subscription schedule has no id".to_string()))?;
    let phase = &schedule["phases"][0];

    let (Some(start), Some(end), Some(price)) = (
        phase["start_date"].as_i64(),
        phase["end_date"].as_i64(),
        phase["items"][0]["price"].as_str(),
    ) else {
        return Err(BillingError::StripeApi(
            "Subscription schedule is missing its current phase".to_string(),
        ));
    };

    Ok(CurrentPhase {
        schedule_id: schedule_id.to_string(),
        start,
        end,
        price: price.to_string(),
    })
}

/// Keep the current phase as is, then one period on `target_price`, then
/// release the subscription from the schedule
fn downgrade_phases_form(phase: &CurrentPhase, target_price: &str) -> Vec<(&'static str, String)> {
    vec![
        ("end_behavior", "release".to_string()),
        ("phases[0][items][0][price]", phase.price.clone()),
        ("phases[0][start_date]", phase.start.to_string()),
        ("phases[0][end_date]", phase.end.to_string()),
        ("phases[0][proration_behavior]", "none".to_string()),
        ("phases[1][items][0][price]", target_price.to_string()),
        ("phases[1][iterations]", "1".to_string()),
        ("phases[1][proration_behavior]", "none".to_string()),
    ]
}

/// Interpret the answer to `POST /payment_intents/{id}/confirm`
///
/// Card errors carry a customer-facing message that is returned unchanged.
/// Any other failed request is an API error, not a decline.
fn confirmation_from_response(
    status: reqwest::StatusCode,
    body: &Value,
) -> BillingResult<PaymentConfirmation> {
    if !status.is_success() {
        let message = stripe_error_message(body);
        return match (body["error"]["type"].as_str(), message) {
            (Some("card_error"), Some(message)) => Ok(PaymentConfirmation {
                error: Some(message),
            }),
            (_, message) => Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status,
                message.unwrap_or_else(|| body.to_string())
            ))),
        };
    }

    let error = match body["status"].as_str() {
        Some("requires_action") => {
            Some("Your bank requires additional authentication for this payment.".to_string())
        }
        Some("requires_payment_method") => body["last_payment_error"]["message"]
            .as_str()
            .map(str::to_string)
            .or_else(|| Some("The payment method on file was declined.".to_string())),
        _ => None,
    };

    Ok(PaymentConfirmation { error })
}

/// Pull the amounts out of an invoice preview
///
/// Proration lines are flagged either at the top level (`proration`) or,
/// on newer API versions, under `parent.subscription_item_details`.
fn parse_proration_preview(invoice: &Value) -> BillingResult<ProrationPreview> {
    let currency = invoice["currency"]
        .as_str()
        .ok_or_else(|| BillingError::StripeApi("Invoice preview has no currency".to_string()))?
        .to_string();

    let amount_due = invoice["amount_due"].as_i64();

    let proration_lines: Vec<i64> = invoice["lines"]["data"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter(|line| {
                    line["proration"].as_bool().unwrap_or(false)
                        || line["parent"]["subscription_item_details"]["proration"]
                            .as_bool()
                            .unwrap_or(false)
                })
                .filter_map(|line| line["amount"].as_i64())
                .collect()
        })
        .unwrap_or_default();

    let proration_amount_now = if proration_lines.is_empty() {
        None
    } else {
        Some(proration_lines.iter().sum())
    };

    Ok(ProrationPreview {
        amount_due,
        proration_amount_now,
        currency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payment_intent_id_from_client_secret() {
        assert_eq!(payment_intent_id("pi_3Abc_secret_xyz").unwrap(), "pi_3Abc");
        assert!(payment_intent_id("seti_1_secret_x").is_err());
        assert!(payment_intent_id("pi_123").is_err());
    }

    #[test]
    fn test_parse_preview_with_amount_due_and_prorations() {
        let invoice = json!({
            "amount_due": 1834,
            "currency": "usd",
            "lines": {"data": [
                {"amount": -950, "proration": true},
                {"amount": 2784, "proration": true},
                {"amount": 2900, "proration": false}
            ]}
        });
        let preview = parse_proration_preview(&invoice).unwrap();
        assert_eq!(preview.amount_due, Some(1834));
        assert_eq!(preview.proration_amount_now, Some(1834));
        assert_eq!(preview.currency, "usd");
    }

    #[test]
    fn test_parse_preview_nested_proration_flag() {
        let invoice = json!({
            "currency": "eur",
            "lines": {"data": [
                {"amount": 500, "parent": {"subscription_item_details": {"proration": true}}}
            ]}
        });
        let preview = parse_proration_preview(&invoice).unwrap();
        assert_eq!(preview.amount_due, None);
        assert_eq!(preview.proration_amount_now, Some(500));
        assert_eq!(preview.currency, "eur");
    }

    #[test]
    fn test_parse_preview_without_currency_fails() {
        assert!(parse_proration_preview(&json!({"amount_due": 100})).is_err());
    }

    #[test]
    fn test_stripe_error_message() {
        let body = json!({"error": {"message": "Your card was declined.", "type": "card_error"}});
        assert_eq!(
            stripe_error_message(&body).as_deref(),
            Some("Your card was declined.")
        );
        assert_eq!(stripe_error_message(&json!({})), None);
    }

    fn schedule() -> Value {
        json!({
            "id": "sub_sched_1",
            "phases": [{
                "start_date": 1_760_000_000,
                "end_date": 1_762_592_000,
                "items": [{"price": "price_premium", "quantity": 1}]
            }]
        })
    }

    #[test]
    fn test_current_phase_from_schedule() {
        let phase = current_phase(&schedule()).unwrap();
        assert_eq!(
            phase,
            CurrentPhase {
                schedule_id: "sub_sched_1".to_string(),
                start: 1_760_000_000,
                end: 1_762_592_000,
                price: "price_premium".to_string(),
            }
        );
    }

    #[test]
    fn test_current_phase_requires_dates_and_price() {
        let mut missing_end = schedule();
        missing_end["phases"][0]["end_date"] = Value::Null;
        assert!(current_phase(&missing_end).is_err());

        assert!(current_phase(&json!({"id": "sub_sched_1", "phases": []})).is_err());
        assert!(current_phase(&json!({"phases": schedule()["phases"].clone()})).is_err());
    }

    #[test]
    fn test_downgrade_form_switches_price_after_current_phase() {
        let phase = current_phase(&schedule()).unwrap();
        let form = downgrade_phases_form(&phase, "price_basic");
        let field = |name: &str| {
            form.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
        };

        assert_eq!(field("end_behavior"), Some("release"));
        assert_eq!(field("phases[0][items][0][price]"), Some("price_premium"));
        assert_eq!(field("phases[0][end_date]"), Some("1762592000"));
        assert_eq!(field("phases[1][items][0][price]"), Some("price_basic"));
        assert_eq!(field("phases[1][iterations]"), Some("1"));
    }

    #[test]
    fn test_card_decline_is_returned_verbatim() {
        let body = json!({"error": {
            "type": "card_error",
            "code": "card_declined",
            "message": "Your card has insufficient funds."
        }});
        let confirmation =
            confirmation_from_response(reqwest::StatusCode::PAYMENT_REQUIRED, &body).unwrap();
        assert_eq!(
            confirmation.error.as_deref(),
            Some("Your card has insufficient funds.")
        );
    }

    #[test]
    fn test_non_card_failures_are_api_errors() {
        let bad_key = json!({"error": {
            "type": "invalid_request_error",
            "message": "Invalid API Key provided: sk_test_****"
        }});
        assert!(matches!(
            confirmation_from_response(reqwest::StatusCode::UNAUTHORIZED, &bad_key),
            Err(BillingError::StripeApi(m)) if m.contains("Invalid API Key")
        ));

        assert!(matches!(
            confirmation_from_response(reqwest::StatusCode::NOT_FOUND, &json!({})),
            Err(BillingError::StripeApi(_))
        ));

        // A card error without a message is not something to show the user
        let no_message = json!({"error": {"type": "card_error"}});
        assert!(confirmation_from_response(reqwest::StatusCode::PAYMENT_REQUIRED, &no_message).is_err());
    }

    #[test]
    fn test_confirmed_intent_statuses() {
        let ok = reqwest::StatusCode::OK;

        let succeeded = confirmation_from_response(ok, &json!({"status": "succeeded"})).unwrap();
        assert_eq!(succeeded.error, None);

        let needs_action = confirmation_from_response(ok, &json!({"status": "requires_action"})).unwrap();
        assert!(needs_action.error.is_some());

        let declined = confirmation_from_response(
            ok,
            &json!({
                "status": "requires_payment_method",
                "last_payment_error": {"message": "Your card was declined."}
            }),
        )
        .unwrap();
        assert_eq!(declined.error.as_deref(), Some("Your card was declined."));

        let declined_without_message =
            confirmation_from_response(ok, &json!({"status": "requires_payment_method"})).unwrap();
        assert_eq!(
            declined_without_message.error.as_deref(),
            Some("The payment method on file was declined.")
        );
    }
}
