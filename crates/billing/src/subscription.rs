//! Subscription sync and gateway operations

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::client::FrisbiiClient;
use crate::error::{BillingError, BillingResult};
use crate::fields::{i32_field, str_field, ts_field};
use crate::payment_method::PaymentMethodService;

/// Local subscription row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub processor_id: String,
    pub processor_plan: Option<String>,
    pub name: String,
    pub status: String,
    pub quantity: i32,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
    pub pause_starts_at: Option<OffsetDateTime>,
    pub pause_resumes_at: Option<OffsetDateTime>,
    pub payment_method_id: Option<Uuid>,
    pub metadata: Option<Value>,
    pub data: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Canceled but not yet past its expiry (eligible for `resume`)
    pub fn on_grace_period(&self) -> bool {
        self.status == "canceled"
            && self
                .ends_at
                .map(|ends| OffsetDateTime::now_utc() < ends)
                .unwrap_or(false)
    }
}

/// Options for creating a subscription
#[derive(Debug, Clone, Default)]
pub struct SubscribeParams {
    /// Frisbii subscription handle; generated when absent
    pub handle: Option<String>,
    /// Local product name, stored in gateway metadata as `pay_name`
    pub name: Option<String>,
    pub trial_period_days: Option<i64>,
    pub payment_method: Option<String>,
    pub metadata: Option<Value>,
}

/// Timing for plan/quantity changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTiming {
    /// Apply now, with proration per gateway rules
    Immediate,
    /// Apply at the next renewal
    Renewal,
}

impl ChangeTiming {
    fn as_str(self) -> &'static str {
        match self {
            ChangeTiming::Immediate => "immediate",
            ChangeTiming::Renewal => "renewal",
        }
    }
}

/// Map a Frisbii subscription state onto the local status vocabulary.
///
/// Total function with passthrough for unmapped states.
pub fn subscription_status_from_state(state: &str) -> String {
    match state {
        "active" => "active",
        "canceled" | "cancelled" | "expired" => "canceled",
        "on_hold" => "paused",
        "pending" => "incomplete",
        "dunning" => "past_due",
        "trial" | "trialing" => "trialing",
        other => other,
    }
    .to_string()
}

/// Subscription service for Frisbii subscription records
#[derive(Clone)]
pub struct SubscriptionService {
    client: FrisbiiClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(client: FrisbiiClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    pub async fn find_by_processor_id(
        &self,
        processor_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE processor_id = $1",
        )
        .bind(processor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Fetch the authoritative subscription from Frisbii
    pub async fn fetch(&self, processor_id: &str) -> BillingResult<Value> {
        self.client
            .get(&format!("/subscription/{}", processor_id))
            .await
    }

    /// Synchronize a subscription from a gateway snapshot, with one bounded
    /// retry on transient remote failures.
    ///
    /// Returns `None` without error when the owning customer is unknown
    /// locally.
    pub async fn sync(
        &self,
        processor_id: &str,
        object: Option<&Value>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let strategy = FixedInterval::from_millis(500).take(1);
        RetryIf::spawn(
            strategy,
            || self.sync_once(processor_id, object),
            |e: &BillingError| e.is_transient(),
        )
        .await
    }

    async fn sync_once(
        &self,
        processor_id: &str,
        object: Option<&Value>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let fetched;
        let object = match object {
            Some(o) => o,
            None => {
                fetched = self.fetch(processor_id).await?;
                &fetched
            }
        };

        let customer_handle = match str_field(object, "customer") {
            Some(handle) => handle,
            None => {
                tracing::debug!(
                    processor_id = %processor_id,
                    "Subscription object carries no customer handle, skipping sync"
                );
                return Ok(None);
            }
        };

        let customer: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM customers WHERE processor_id = $1")
                .bind(&customer_handle)
                .fetch_optional(&self.pool)
                .await?;

        let customer_id = match customer {
            Some((id,)) => id,
            None => {
                tracing::debug!(
                    processor_id = %processor_id,
                    customer = %customer_handle,
                    "Customer not known locally, skipping subscription sync"
                );
                return Ok(None);
            }
        };

        let status = str_field(object, "state")
            .map(|s| subscription_status_from_state(&s))
            .unwrap_or_else(|| "active".to_string());

        // Product name travels in gateway metadata; keep the existing local
        // name when the snapshot doesn't carry one.
        let name = object
            .get("metadata")
            .and_then(|m| m.get("pay_name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let payment_method_id = self
            .resolve_payment_method(customer_id, object)
            .await?;

        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            INSERT INTO subscriptions (
                id, customer_id, processor_id, processor_plan, name, status, quantity,
                trial_ends_at, current_period_start, current_period_end, ends_at,
                pause_starts_at, pause_resumes_at, payment_method_id, metadata, data
            ) VALUES (
                $1, $2, $3, $4, COALESCE($5, 'default'), $6, $7,
                $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            ON CONFLICT (processor_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                processor_plan = EXCLUDED.processor_plan,
                name = COALESCE($5, subscriptions.name),
                status = EXCLUDED.status,
                quantity = EXCLUDED.quantity,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                ends_at = EXCLUDED.ends_at,
                pause_starts_at = EXCLUDED.pause_starts_at,
                pause_resumes_at = EXCLUDED.pause_resumes_at,
                payment_method_id = EXCLUDED.payment_method_id,
                metadata = EXCLUDED.metadata,
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(str_field(object, "handle").unwrap_or_else(|| processor_id.to_string()))
        .bind(str_field(object, "plan"))
        .bind(name)
        .bind(status)
        .bind(i32_field(object, "quantity").unwrap_or(1))
        .bind(ts_field(object, "trial_end"))
        .bind(ts_field(object, "current_period_start"))
        .bind(ts_field(object, "current_period_end"))
        .bind(ts_field(object, "expires"))
        .bind(ts_field(object, "on_hold_from"))
        .bind(ts_field(object, "on_hold_to"))
        .bind(payment_method_id)
        .bind(object.get("metadata"))
        .bind(object)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(record))
    }

    /// Resolve the subscription's attached payment method to a local row,
    /// syncing it from the gateway when it isn't known yet. Best-effort: a
    /// payment method sync failure must not fail the subscription sync.
    async fn resolve_payment_method(
        &self,
        customer_id: Uuid,
        object: &Value,
    ) -> BillingResult<Option<Uuid>> {
        let handle = match str_field(object, "payment_method") {
            Some(h) => h,
            None => return Ok(None),
        };

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payment_methods WHERE customer_id = $1 AND processor_id = $2",
        )
        .bind(customer_id)
        .bind(&handle)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = existing {
            return Ok(Some(id));
        }

        let payment_methods = PaymentMethodService::new(self.client.clone(), self.pool.clone());
        match payment_methods.sync(&handle, None).await {
            Ok(Some(record)) => Ok(Some(record.id)),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(
                    payment_method = %handle,
                    error = %e,
                    "Failed to sync subscription payment method"
                );
                Ok(None)
            }
        }
    }

    /// Create a subscription for a customer and sync the result
    pub async fn create(
        &self,
        customer_processor_id: &str,
        plan: &str,
        params: SubscribeParams,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let handle = params
            .handle
            .unwrap_or_else(|| format!("sub_{:016x}", rand::random::<u64>()));

        let mut body = json!({
            "handle": handle,
            "customer": customer_processor_id,
            "plan": plan,
        });
        if let Some(days) = params.trial_period_days {
            body["trial_period_days"] = json!(days);
        }
        if let Some(pm) = params.payment_method {
            body["payment_method"] = Value::String(pm);
        }

        let mut metadata = params.metadata.filter(Value::is_object).unwrap_or_else(|| json!({}));
        if let Some(name) = &params.name {
            metadata["pay_name"] = Value::String(name.clone());
        }
        body["metadata"] = metadata;

        let response = self.client.post("/subscription", &body).await?;
        let sub_handle = str_field(&response, "handle").unwrap_or(handle);
        self.sync(&sub_handle, Some(&response)).await
    }

    /// Cancel at period end. Already-canceled subscriptions are a no-op.
    pub async fn cancel(&self, processor_id: &str) -> BillingResult<Value> {
        if let Some(record) = self.find_by_processor_id(processor_id).await? {
            if record.status == "canceled" {
                return Ok(Value::Null);
            }
        }

        let response = self
            .client
            .post(&format!("/subscription/{}/cancel", processor_id), &json!({}))
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Cancel immediately (Frisbii `expire`)
    pub async fn cancel_now(&self, processor_id: &str) -> BillingResult<Value> {
        let response = self
            .client
            .post(&format!("/subscription/{}/expire", processor_id), &json!({}))
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Resume a canceled subscription. Only valid within the grace period
    /// (canceled but not yet past `ends_at`).
    pub async fn resume(&self, processor_id: &str) -> BillingResult<Value> {
        let record = self
            .find_by_processor_id(processor_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!("unknown subscription {}", processor_id))
            })?;

        if !record.on_grace_period() {
            return Err(BillingError::Internal(
                "subscriptions can only be resumed within their grace period".to_string(),
            ));
        }

        let response = self
            .client
            .post(
                &format!("/subscription/{}/uncancel", processor_id),
                &json!({}),
            )
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Pause the subscription (Frisbii `on_hold`), optionally until a date
    pub async fn pause(
        &self,
        processor_id: &str,
        until: Option<OffsetDateTime>,
    ) -> BillingResult<Value> {
        let mut body = json!({});
        if let Some(until) = until {
            let formatted = until
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|e| BillingError::Internal(format!("bad pause date: {}", e)))?;
            body["to"] = Value::String(formatted);
        }

        let response = self
            .client
            .post(&format!("/subscription/{}/on_hold", processor_id), &body)
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Unpause a held subscription (Frisbii `reactivate`)
    pub async fn unpause(&self, processor_id: &str) -> BillingResult<Value> {
        let response = self
            .client
            .post(
                &format!("/subscription/{}/reactivate", processor_id),
                &json!({}),
            )
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Swap the subscription to a different plan
    pub async fn swap(
        &self,
        processor_id: &str,
        plan: &str,
        timing: ChangeTiming,
    ) -> BillingResult<Value> {
        let response = self
            .client
            .put(
                &format!("/subscription/{}/change", processor_id),
                &json!({ "plan": plan, "timing": timing.as_str() }),
            )
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Change the subscription quantity
    pub async fn change_quantity(
        &self,
        processor_id: &str,
        quantity: i32,
        timing: ChangeTiming,
    ) -> BillingResult<Value> {
        let response = self
            .client
            .put(
                &format!("/subscription/{}/change", processor_id),
                &json!({ "quantity": quantity, "timing": timing.as_str() }),
            )
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Trigger a payment retry for a dunning subscription
    pub async fn retry_failed_payment(&self, processor_id: &str) -> BillingResult<Value> {
        let response = self
            .client
            .post(&format!("/subscription/{}/charge", processor_id), &json!({}))
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Fetch the upcoming invoice preview for a subscription
    pub async fn upcoming_invoice(&self, processor_id: &str) -> BillingResult<Value> {
        self.client
            .get(&format!("/subscription/{}/upcoming_invoice", processor_id))
            .await
    }

    /// Point the subscription at a different payment method
    pub async fn update_payment_method(
        &self,
        processor_id: &str,
        payment_method: &str,
    ) -> BillingResult<Value> {
        let response = self
            .client
            .post(
                &format!("/subscription/{}/set_payment_method", processor_id),
                &json!({ "payment_method": payment_method }),
            )
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_states_map_to_local_statuses() {
        assert_eq!(subscription_status_from_state("active"), "active");
        assert_eq!(subscription_status_from_state("cancelled"), "canceled");
        assert_eq!(subscription_status_from_state("canceled"), "canceled");
        assert_eq!(subscription_status_from_state("expired"), "canceled");
        assert_eq!(subscription_status_from_state("on_hold"), "paused");
        assert_eq!(subscription_status_from_state("pending"), "incomplete");
        assert_eq!(subscription_status_from_state("dunning"), "past_due");
        assert_eq!(subscription_status_from_state("trial"), "trialing");
        assert_eq!(subscription_status_from_state("trialing"), "trialing");
    }

    #[test]
    fn unmapped_subscription_state_passes_through() {
        assert_eq!(subscription_status_from_state("is_demo"), "is_demo");
    }

    #[test]
    fn change_timing_serializes() {
        assert_eq!(ChangeTiming::Immediate.as_str(), "immediate");
        assert_eq!(ChangeTiming::Renewal.as_str(), "renewal");
    }
}
