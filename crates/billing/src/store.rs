//! User plan storage
//!
//! The stored plan is only written by the webhook handler after Stripe has
//! applied a change; the transition flow only reads it.

use async_trait::async_trait;
use sqlx::PgPool;
use starter_shared::{Plan, UserId};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing identity of one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingAccount {
    pub user_id: UserId,
    pub email: String,
    pub plan: Plan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn current_plan(&self, user_id: UserId) -> BillingResult<Plan>;

    async fn billing_account(&self, user_id: UserId) -> BillingResult<BillingAccount>;

    /// Record the result of a completed checkout
    async fn link_subscription(
        &self,
        user_id: UserId,
        plan: Plan,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<()>;

    /// Set the plan for `customer_id` if `subscription_id` is their current
    /// subscription. Returns whether a row changed.
    async fn set_subscription_plan(
        &self,
        customer_id: &str,
        subscription_id: &str,
        plan: Plan,
    ) -> BillingResult<bool>;

    /// Move the customer to free and clear the subscription, if
    /// `subscription_id` is their current one. Returns whether a row changed.
    async fn end_subscription(&self, customer_id: &str, subscription_id: &str) -> BillingResult<bool>;
}

/// Postgres-backed plan store on the `users` table
#[derive(Clone)]
pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    plan: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

impl AccountRow {
    fn into_account(self) -> BillingResult<BillingAccount> {
        // The column is constrained, so an unknown value means the schema and
        // the Plan enum have drifted apart.
        let plan = self.plan.parse::<Plan>().map_err(|e| {
            BillingError::Config(format!("User {} has unrecognized plan: {}", self.id, e))
        })?;

        Ok(BillingAccount {
            user_id: UserId(self.id),
            email: self.email,
            plan,
            stripe_customer_id: self.stripe_customer_id,
            stripe_subscription_id: self.stripe_subscription_id,
        })
    }
}

#[async_trait]
impl PlanStore for PgPlanStore {
    async fn current_plan(&self, user_id: UserId) -> BillingResult<Plan> {
        Ok(self.billing_account(user_id).await?.plan)
    }

    async fn billing_account(&self, user_id: UserId) -> BillingResult<BillingAccount> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, email, plan, stripe_customer_id, stripe_subscription_id
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))?
            .into_account()
    }

    async fn link_subscription(
        &self,
        user_id: UserId,
        plan: Plan,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET plan = $1,
                stripe_customer_id = $2,
                stripe_subscription_id = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(plan.as_str())
        .bind(customer_id)
        .bind(subscription_id)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("User {} not found", user_id)));
        }

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            customer_id = %customer_id,
            "Linked subscription to user"
        );

        Ok(())
    }

    async fn set_subscription_plan(
        &self,
        customer_id: &str,
        subscription_id: &str,
        plan: Plan,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET plan = $1,
                updated_at = NOW()
            WHERE stripe_customer_id = $2
              AND stripe_subscription_id = $3
            "#,
        )
        .bind(plan.as_str())
        .bind(customer_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                plan = %plan,
                "Updated plan for subscription"
            );
        }

        Ok(applied)
    }

    async fn end_subscription(&self, customer_id: &str, subscription_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET plan = $1,
                stripe_subscription_id = NULL,
                updated_at = NOW()
            WHERE stripe_customer_id = $2
              AND stripe_subscription_id = $3
            "#,
        )
        .bind(Plan::Free.as_str())
        .bind(customer_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Subscription ended, user moved to free"
            );
        }

        Ok(applied)
    }
}
