//! Plan transitions
//!
//! Classifies a requested plan change and drives the matching billing
//! operation. Classification is pure; only the billing calls can fail, and a
//! failure never changes the stored plan (the webhook does that once the
//! provider has applied the change).
//!
//! Upgrades are two-step so the caller can show the charge before anything
//! is mutated: [`PlanTransitionDecider::plan`] returns an [`UpgradeQuote`],
//! then [`PlanTransitionDecider::confirm_upgrade`] applies it.

use serde::Serialize;
use starter_shared::Plan;
use time::OffsetDateTime;

use crate::collaborator::{BillingCollaborator, PaymentStatus};
use crate::error::{BillingError, BillingResult};

/// A user's request to move between plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionRequest {
    pub current: Plan,
    pub target: Plan,
}

impl TransitionRequest {
    pub fn new(current: Plan, target: Plan) -> Self {
        Self { current, target }
    }

    /// Build a request from stored/submitted plan names; unknown names are
    /// rejected before any billing call
    pub fn parse(current: &str, target: &str) -> BillingResult<Self> {
        Ok(Self {
            current: current.parse()?,
            target: target.parse()?,
        })
    }
}

/// How a plan change has to be fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Already on the requested plan
    NoOp,
    /// No subscription exists yet; fulfil through checkout
    NewSubscription,
    /// Switch at the end of the current period
    ScheduledDowngrade,
    /// Switch now and charge the prorated difference
    ImmediateUpgrade,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::NoOp => write!(f, "no_op"),
            TransitionKind::NewSubscription => write!(f, "new_subscription"),
            TransitionKind::ScheduledDowngrade => write!(f, "scheduled_downgrade"),
            TransitionKind::ImmediateUpgrade => write!(f, "immediate_upgrade"),
        }
    }
}

/// Classify a plan change. Rules apply in order:
///
/// 1. same plan → `NoOp`
/// 2. current plan is the lowest tier → `NewSubscription`
/// 3. target ranks below current → `ScheduledDowngrade`
/// 4. otherwise → `ImmediateUpgrade`
pub fn decide_transition(request: &TransitionRequest) -> TransitionKind {
    let TransitionRequest { current, target } = *request;

    if target == current {
        TransitionKind::NoOp
    } else if current == Plan::lowest() {
        TransitionKind::NewSubscription
    } else if target < current {
        TransitionKind::ScheduledDowngrade
    } else {
        TransitionKind::ImmediateUpgrade
    }
}

/// Charge the user must accept before an upgrade is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeQuote {
    pub from: Plan,
    pub to: Plan,
    /// Minor units, exactly as the billing provider reported it
    pub immediate_charge: i64,
    /// Currency code, exactly as the billing provider reported it
    pub currency: String,
}

impl UpgradeQuote {
    /// e.g. "12.50 USD", "1250 JPY"
    pub fn display_amount(&self) -> String {
        let sign = if self.immediate_charge < 0 { "-" } else { "" };
        let abs = self.immediate_charge.unsigned_abs();
        let currency = self.currency.to_uppercase();

        match minor_unit_digits(&currency) {
            0 => format!("{}{} {}", sign, abs, currency),
            digits => {
                let scale = 10u64.pow(digits);
                format!(
                    "{}{}.{:0width$} {}",
                    sign,
                    abs / scale,
                    abs % scale,
                    currency,
                    width = digits as usize
                )
            }
        }
    }
}

/// Decimal places of a currency's minor unit, per Stripe's currency list
fn minor_unit_digits(currency: &str) -> u32 {
    const ZERO_DECIMAL: [&str; 16] = [
        "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
        "XAF", "XOF", "XPF",
    ];
    const THREE_DECIMAL: [&str; 5] = ["BHD", "JOD", "KWD", "OMR", "TND"];

    if ZERO_DECIMAL.contains(&currency) {
        0
    } else if THREE_DECIMAL.contains(&currency) {
        3
    } else {
        2
    }
}

/// Result of the first step of a plan change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionDecision {
    NoOp,
    NewSubscription {
        /// Hosted checkout page, if the provider returned one
        checkout_url: Option<String>,
    },
    ScheduledDowngrade {
        #[serde(with = "time::serde::timestamp")]
        effective_at: OffsetDateTime,
    },
    ImmediateUpgrade(UpgradeQuote),
}

impl TransitionDecision {
    pub fn kind(&self) -> TransitionKind {
        match self {
            TransitionDecision::NoOp => TransitionKind::NoOp,
            TransitionDecision::NewSubscription { .. } => TransitionKind::NewSubscription,
            TransitionDecision::ScheduledDowngrade { .. } => TransitionKind::ScheduledDowngrade,
            TransitionDecision::ImmediateUpgrade(_) => TransitionKind::ImmediateUpgrade,
        }
    }
}

/// Result of applying a confirmed upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Complete,
    /// The caller must confirm the payment (3-D Secure) and then call
    /// [`PlanTransitionDecider::reconfirm_payment`]
    RequiresReconfirmation { client_secret: String },
    /// No usable payment method; send the user to the billing portal
    RequiresPaymentMethod { portal_url: Option<String> },
}

impl UpgradeOutcome {
    pub fn requires_reconfirmation(&self) -> bool {
        matches!(self, UpgradeOutcome::RequiresReconfirmation { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, UpgradeOutcome::Complete)
    }
}

/// Orchestrates plan changes against a billing collaborator
pub struct PlanTransitionDecider<B> {
    billing: B,
}

impl<B: BillingCollaborator> PlanTransitionDecider<B> {
    pub fn new(billing: B) -> Self {
        Self { billing }
    }

    pub fn billing(&self) -> &B {
        &self.billing
    }

    /// Classify the request and run the first billing step for it
    ///
    /// - `NoOp`: no billing call
    /// - `NewSubscription`: creates a checkout link
    /// - `ScheduledDowngrade`: books the change; `effective_at` is passed through
    /// - `ImmediateUpgrade`: previews proration and returns the quote; nothing
    ///   is charged until [`Self::confirm_upgrade`]
    pub async fn plan(&self, request: TransitionRequest) -> BillingResult<TransitionDecision> {
        let kind = decide_transition(&request);

        tracing::info!(
            current_plan = %request.current,
            target_plan = %request.target,
            kind = %kind,
            "Classified plan transition"
        );

        match kind {
            TransitionKind::NoOp => Ok(TransitionDecision::NoOp),
            TransitionKind::NewSubscription => {
                let link = self
                    .billing
                    .create_checkout_link(request.target)
                    .await
                    .inspect_err(|e| log_failure(&request, "create_checkout_link", e))?;
                Ok(TransitionDecision::NewSubscription {
                    checkout_url: link.url,
                })
            }
            TransitionKind::ScheduledDowngrade => {
                let scheduled = self
                    .billing
                    .schedule_downgrade(request.target)
                    .await
                    .inspect_err(|e| log_failure(&request, "schedule_downgrade", e))?;

                tracing::info!(
                    current_plan = %request.current,
                    target_plan = %request.target,
                    effective_at = %scheduled.effective_at,
                    "Scheduled plan downgrade"
                );

                Ok(TransitionDecision::ScheduledDowngrade {
                    effective_at: scheduled.effective_at,
                })
            }
            TransitionKind::ImmediateUpgrade => {
                let preview = self
                    .billing
                    .preview_proration(request.current, request.target)
                    .await
                    .inspect_err(|e| log_failure(&request, "preview_proration", e))?;

                let immediate_charge = preview.immediate_charge().ok_or_else(|| {
                    tracing::error!(
                        current_plan = %request.current,
                        target_plan = %request.target,
                        "Proration preview had neither amount_due nor proration amount"
                    );
                    BillingError::MissingProrationAmount
                })?;

                Ok(TransitionDecision::ImmediateUpgrade(UpgradeQuote {
                    from: request.current,
                    to: request.target,
                    immediate_charge,
                    currency: preview.currency,
                }))
            }
        }
    }

    /// Apply an upgrade the user has accepted
    ///
    /// Only quotes that classify as `ImmediateUpgrade` are applied; anything
    /// else fails with `NotAnUpgrade` before any billing call.
    pub async fn confirm_upgrade(&self, quote: &UpgradeQuote) -> BillingResult<UpgradeOutcome> {
        let request = TransitionRequest::new(quote.from, quote.to);

        let kind = decide_transition(&request);
        if kind != TransitionKind::ImmediateUpgrade {
            tracing::warn!(
                from = %quote.from,
                to = %quote.to,
                kind = %kind,
                "Refusing to apply a quote that is not an upgrade"
            );
            return Err(BillingError::NotAnUpgrade {
                from: quote.from,
                to: quote.to,
            });
        }

        let execution = self
            .billing
            .execute_upgrade(quote.to)
            .await
            .inspect_err(|e| log_failure(&request, "execute_upgrade", e))?;

        let Some(client_secret) = execution.client_secret else {
            tracing::info!(from = %quote.from, to = %quote.to, "Upgrade applied without payment step");
            return Ok(UpgradeOutcome::Complete);
        };

        let status = self
            .billing
            .retrieve_payment_status(&client_secret)
            .await
            .inspect_err(|e| log_failure(&request, "retrieve_payment_status", e))?;

        let outcome = match status {
            PaymentStatus::RequiresAction | PaymentStatus::RequiresConfirmation => {
                UpgradeOutcome::RequiresReconfirmation { client_secret }
            }
            PaymentStatus::RequiresPaymentMethod => {
                let link = self
                    .billing
                    .create_billing_portal_link()
                    .await
                    .inspect_err(|e| log_failure(&request, "create_billing_portal_link", e))?;
                UpgradeOutcome::RequiresPaymentMethod {
                    portal_url: link.url,
                }
            }
            PaymentStatus::Other(_) => UpgradeOutcome::Complete,
        };

        tracing::info!(
            from = %quote.from,
            to = %quote.to,
            payment_status = %status.as_str(),
            complete = outcome.is_complete(),
            "Upgrade executed"
        );

        Ok(outcome)
    }

    /// Confirm a pending upgrade payment with the payment method on file
    ///
    /// A decline is returned as `PaymentConfirmation` carrying the provider's
    /// message unchanged. There is no retry; the user starts over.
    pub async fn reconfirm_payment(&self, client_secret: &str) -> BillingResult<()> {
        let confirmation = self.billing.confirm_payment(client_secret).await?;

        match confirmation.error {
            Some(message) => {
                tracing::warn!(error = %message, "Upgrade payment confirmation declined");
                Err(BillingError::PaymentConfirmation(message))
            }
            None => {
                tracing::info!("Upgrade payment confirmed");
                Ok(())
            }
        }
    }
}

fn log_failure(request: &TransitionRequest, operation: &str, error: &BillingError) {
    tracing::error!(
        current_plan = %request.current,
        target_plan = %request.target,
        operation = operation,
        error = %error,
        "Billing call failed during plan transition"
    );
}
