//! Plan transition flow against a scripted billing collaborator
//!
//! The spy records every collaborator call so the tests can assert both the
//! decision and exactly which billing operations it triggered.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Mutex;

use async_trait::async_trait;
use starter_billing::{
    decide_transition, BillingCollaborator, BillingError, BillingPortalLink, BillingResult,
    CheckoutLink, PaymentConfirmation, PaymentStatus, Plan, PlanTransitionDecider,
    ProrationPreview, ScheduledChange, TransitionDecision, TransitionKind, TransitionRequest,
    UpgradeExecution, UpgradeOutcome, UpgradeQuote,
};
use time::OffsetDateTime;

// ============================================================================
// Test Utilities
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("starter_billing=debug")
        .try_init();
}

/// Scripted collaborator that logs each call by name
struct SpyBilling {
    calls: Mutex<Vec<&'static str>>,
    preview: ProrationPreview,
    effective_at: OffsetDateTime,
    client_secret: Option<String>,
    payment_status: PaymentStatus,
    confirmation_error: Option<String>,
    fail_preview: bool,
}

impl Default for SpyBilling {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            preview: ProrationPreview {
                amount_due: Some(1500),
                proration_amount_now: Some(1200),
                currency: "usd".to_string(),
            },
            effective_at: OffsetDateTime::from_unix_timestamp(1_767_225_600).unwrap(),
            client_secret: None,
            payment_status: PaymentStatus::Other("succeeded".to_string()),
            confirmation_error: None,
            fail_preview: false,
        }
    }
}

impl SpyBilling {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn with_payment(status: PaymentStatus) -> Self {
        Self {
            client_secret: Some("pi_123_secret_abc".to_string()),
            payment_status: status,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BillingCollaborator for SpyBilling {
    async fn preview_proration(&self, _current: Plan, _target: Plan) -> BillingResult<ProrationPreview> {
        self.record("preview_proration");
        if self.fail_preview {
            return Err(BillingError::StripeApi("connection reset".to_string()));
        }
        Ok(self.preview.clone())
    }

    async fn schedule_downgrade(&self, _target: Plan) -> BillingResult<ScheduledChange> {
        self.record("schedule_downgrade");
        Ok(ScheduledChange {
            effective_at: self.effective_at,
        })
    }

    async fn execute_upgrade(&self, _target: Plan) -> BillingResult<UpgradeExecution> {
        self.record("execute_upgrade");
        Ok(UpgradeExecution {
            client_secret: self.client_secret.clone(),
        })
    }

    async fn retrieve_payment_status(&self, _client_secret: &str) -> BillingResult<PaymentStatus> {
        self.record("retrieve_payment_status");
        Ok(self.payment_status.clone())
    }

    async fn confirm_payment(&self, _client_secret: &str) -> BillingResult<PaymentConfirmation> {
        self.record("confirm_payment");
        Ok(PaymentConfirmation {
            error: self.confirmation_error.clone(),
        })
    }

    async fn create_billing_portal_link(&self) -> BillingResult<BillingPortalLink> {
        self.record("create_billing_portal_link");
        Ok(BillingPortalLink {
            url: Some("https://billing.stripe.com/p/session_1".to_string()),
        })
    }

    async fn create_checkout_link(&self, _target: Plan) -> BillingResult<CheckoutLink> {
        self.record("create_checkout_link");
        Ok(CheckoutLink {
            url: Some("https://checkout.stripe.com/c/pay/cs_1".to_string()),
        })
    }
}

fn quote(from: Plan, to: Plan) -> UpgradeQuote {
    UpgradeQuote {
        from,
        to,
        immediate_charge: 1500,
        currency: "usd".to_string(),
    }
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn test_same_plan_makes_no_billing_calls() {
    init_tracing();
    for plan in Plan::ALL {
        let decider = PlanTransitionDecider::new(SpyBilling::default());
        let decision = decider.plan(TransitionRequest::new(plan, plan)).await.unwrap();

        assert_eq!(decision, TransitionDecision::NoOp);
        assert!(decider.billing().calls().is_empty(), "{} -> {}", plan, plan);
    }
}

#[tokio::test]
async fn test_every_pair_yields_its_classified_decision() {
    for current in Plan::ALL {
        for target in Plan::ALL {
            let request = TransitionRequest::new(current, target);
            let decider = PlanTransitionDecider::new(SpyBilling::default());
            let decision = decider.plan(request).await.unwrap();
            assert_eq!(decision.kind(), decide_transition(&request));
        }
    }
}

#[tokio::test]
async fn test_repeated_requests_get_the_same_decision() {
    let decider = PlanTransitionDecider::new(SpyBilling::default());
    let request = TransitionRequest::new(Plan::Premium, Plan::Basic);

    let first = decider.plan(request).await.unwrap();
    let second = decider.plan(request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.kind(), TransitionKind::ScheduledDowngrade);
}

#[tokio::test]
async fn test_free_user_goes_through_checkout() {
    let decider = PlanTransitionDecider::new(SpyBilling::default());
    let decision = decider
        .plan(TransitionRequest::new(Plan::Free, Plan::Basic))
        .await
        .unwrap();

    assert_eq!(
        decision,
        TransitionDecision::NewSubscription {
            checkout_url: Some("https://checkout.stripe.com/c/pay/cs_1".to_string())
        }
    );
    assert_eq!(decider.billing().calls(), vec!["create_checkout_link"]);
}

#[tokio::test]
async fn test_unknown_plan_is_rejected_before_billing() {
    let result = TransitionRequest::parse("basic", "gold");
    assert!(matches!(result, Err(BillingError::InvalidPlan(_))));
}

// ============================================================================
// Downgrades
// ============================================================================

#[tokio::test]
async fn test_downgrade_passes_effective_date_through() {
    let spy = SpyBilling::default();
    let expected = spy.effective_at;
    let decider = PlanTransitionDecider::new(spy);

    let decision = decider
        .plan(TransitionRequest::new(Plan::Premium, Plan::Basic))
        .await
        .unwrap();

    assert_eq!(
        decision,
        TransitionDecision::ScheduledDowngrade {
            effective_at: expected
        }
    );
    assert_eq!(decider.billing().calls(), vec!["schedule_downgrade"]);
}

// ============================================================================
// Upgrade quotes
// ============================================================================

#[tokio::test]
async fn test_upgrade_quote_prefers_amount_due() {
    let decider = PlanTransitionDecider::new(SpyBilling::default());
    let decision = decider
        .plan(TransitionRequest::new(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    let TransitionDecision::ImmediateUpgrade(quote) = decision else {
        panic!("expected an upgrade quote, got {:?}", decision);
    };
    assert_eq!(quote.immediate_charge, 1500);
    assert_eq!(quote.currency, "usd");
    assert_eq!(decider.billing().calls(), vec!["preview_proration"]);
}

#[tokio::test]
async fn test_upgrade_quote_falls_back_to_proration_amount() {
    let spy = SpyBilling {
        preview: ProrationPreview {
            amount_due: None,
            proration_amount_now: Some(733),
            currency: "eur".to_string(),
        },
        ..Default::default()
    };
    let decider = PlanTransitionDecider::new(spy);

    let decision = decider
        .plan(TransitionRequest::new(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert_eq!(
        decision,
        TransitionDecision::ImmediateUpgrade(UpgradeQuote {
            from: Plan::Basic,
            to: Plan::Premium,
            immediate_charge: 733,
            currency: "eur".to_string(),
        })
    );
}

#[tokio::test]
async fn test_upgrade_quote_without_any_amount_fails() {
    let spy = SpyBilling {
        preview: ProrationPreview {
            amount_due: None,
            proration_amount_now: None,
            currency: "usd".to_string(),
        },
        ..Default::default()
    };
    let decider = PlanTransitionDecider::new(spy);

    let result = decider
        .plan(TransitionRequest::new(Plan::Basic, Plan::Premium))
        .await;
    assert!(matches!(result, Err(BillingError::MissingProrationAmount)));
}

#[tokio::test]
async fn test_preview_failure_is_surfaced_and_nothing_else_runs() {
    let spy = SpyBilling {
        fail_preview: true,
        ..Default::default()
    };
    let decider = PlanTransitionDecider::new(spy);

    let err = decider
        .plan(TransitionRequest::new(Plan::Basic, Plan::Premium))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::StripeApi(_)));
    assert!(!err.user_message().is_empty());
    assert_eq!(decider.billing().calls(), vec!["preview_proration"]);
}

// ============================================================================
// Upgrade execution
// ============================================================================

#[tokio::test]
async fn test_upgrade_without_payment_step_completes() {
    let decider = PlanTransitionDecider::new(SpyBilling::default());
    let outcome = decider
        .confirm_upgrade(&quote(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert_eq!(outcome, UpgradeOutcome::Complete);
    assert_eq!(decider.billing().calls(), vec!["execute_upgrade"]);
}

#[tokio::test]
async fn test_upgrade_with_settled_payment_completes() {
    let decider = PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::Other(
        "succeeded".to_string(),
    )));
    let outcome = decider
        .confirm_upgrade(&quote(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(
        decider.billing().calls(),
        vec!["execute_upgrade", "retrieve_payment_status"]
    );
}

#[tokio::test]
async fn test_upgrade_requiring_action_needs_reconfirmation() {
    let decider = PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::RequiresAction));
    let outcome = decider
        .confirm_upgrade(&quote(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::RequiresReconfirmation {
            client_secret: "pi_123_secret_abc".to_string()
        }
    );
    assert!(outcome.requires_reconfirmation());
    assert!(!decider
        .billing()
        .calls()
        .contains(&"create_billing_portal_link"));
}

#[tokio::test]
async fn test_upgrade_requiring_confirmation_needs_reconfirmation() {
    let decider =
        PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::RequiresConfirmation));
    let outcome = decider
        .confirm_upgrade(&quote(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert!(outcome.requires_reconfirmation());
    assert_eq!(
        decider.billing().calls(),
        vec!["execute_upgrade", "retrieve_payment_status"]
    );
}

#[tokio::test]
async fn test_upgrade_without_payment_method_sends_user_to_portal() {
    let decider =
        PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::RequiresPaymentMethod));
    let outcome = decider
        .confirm_upgrade(&quote(Plan::Basic, Plan::Premium))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        UpgradeOutcome::RequiresPaymentMethod {
            portal_url: Some("https://billing.stripe.com/p/session_1".to_string())
        }
    );
    assert!(!outcome.is_complete());

    let portal_calls = decider
        .billing()
        .calls()
        .into_iter()
        .filter(|call| *call == "create_billing_portal_link")
        .count();
    assert_eq!(portal_calls, 1);
}

#[tokio::test]
async fn test_quotes_that_are_not_upgrades_are_refused() {
    let cases = [
        (Plan::Premium, Plan::Basic),
        (Plan::Premium, Plan::Free),
        (Plan::Basic, Plan::Basic),
        (Plan::Free, Plan::Basic),
        (Plan::Free, Plan::Premium),
    ];

    for (from, to) in cases {
        let decider = PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::RequiresAction));
        let result = decider.confirm_upgrade(&quote(from, to)).await;

        assert!(
            matches!(result, Err(BillingError::NotAnUpgrade { from: f, to: t }) if f == from && t == to),
            "{} -> {} should be refused",
            from,
            to
        );
        assert!(decider.billing().calls().is_empty(), "{} -> {}", from, to);
    }
}

// ============================================================================
// Reconfirmation
// ============================================================================

#[tokio::test]
async fn test_reconfirmation_decline_is_surfaced_verbatim() {
    let spy = SpyBilling {
        confirmation_error: Some("Your card was declined.".to_string()),
        ..SpyBilling::with_payment(PaymentStatus::RequiresAction)
    };
    let decider = PlanTransitionDecider::new(spy);

    let err = decider
        .reconfirm_payment("pi_123_secret_abc")
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::PaymentConfirmation(ref m) if m == "Your card was declined."));
    assert_eq!(err.to_string(), "Your card was declined.");
    assert_eq!(err.user_message(), "Your card was declined.");
    // No retry
    assert_eq!(decider.billing().calls(), vec!["confirm_payment"]);
}

#[tokio::test]
async fn test_reconfirmation_success() {
    let decider = PlanTransitionDecider::new(SpyBilling::with_payment(PaymentStatus::RequiresAction));
    decider.reconfirm_payment("pi_123_secret_abc").await.unwrap();
    assert_eq!(decider.billing().calls(), vec!["confirm_payment"]);
}
