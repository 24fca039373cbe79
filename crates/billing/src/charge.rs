//! Charge sync and gateway operations
//!
//! Frisbii calls these invoices/charges interchangeably in webhook payloads;
//! locally they are charge rows owned by a customer. Amounts are integer minor
//! units throughout.

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::client::FrisbiiClient;
use crate::error::{BillingError, BillingResult};
use crate::fields::{i32_field, i64_field, str_field};

/// Local charge row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ChargeRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub processor_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub amount_refunded: i64,
    pub payment_method_type: Option<String>,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub metadata: Option<Value>,
    pub data: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Options for creating a charge
#[derive(Debug, Clone, Default)]
pub struct ChargeParams {
    /// Frisbii charge handle; generated when absent
    pub handle: Option<String>,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    /// Shown on the customer's statement/receipt (Frisbii `ordertext`)
    pub description: Option<String>,
    pub metadata: Option<Value>,
    /// Optional passthrough; charge creation is NOT idempotent without it
    pub idempotency_key: Option<String>,
}

/// Map a Frisbii charge state onto the local charge status vocabulary.
///
/// Total function: unmapped states pass through unchanged so gateway
/// vocabulary drift degrades gracefully instead of erroring.
pub fn charge_status_from_state(state: &str) -> String {
    match state {
        "created" | "pending" => "pending",
        "authorized" => "requires_capture",
        "settled" => "succeeded",
        "failed" => "failed",
        "cancelled" | "canceled" => "canceled",
        other => other,
    }
    .to_string()
}

/// Normalize the payment instrument type reported on a charge
pub fn payment_method_type_from_raw(raw: &str) -> String {
    match raw {
        "card" | "card_token" => "card",
        "mobilepay" | "vipps" | "swish" => "mobile_payment",
        "paypal" => "paypal",
        "bank" | "sepa" | "bank_transfer" => "bank_account",
        other => other,
    }
    .to_string()
}

/// Pull the last 4 digits out of a masked card number like `457111XXXXXX3742`
pub(crate) fn last4_from_masked(masked: &str) -> Option<String> {
    let digits: String = masked.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].to_string())
}

/// Payment instrument descriptors extracted from a charge's
/// `payment_method_info` block
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InstrumentInfo {
    pub pm_type: Option<String>,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

pub(crate) fn extract_instrument(object: &Value) -> InstrumentInfo {
    let info = match object.get("payment_method_info") {
        Some(info) if info.is_object() => info,
        _ => return InstrumentInfo::default(),
    };

    let last4 = str_field(info, "masked_card")
        .and_then(|m| last4_from_masked(&m))
        .or_else(|| str_field(info, "last4"));

    InstrumentInfo {
        pm_type: str_field(info, "type").map(|t| payment_method_type_from_raw(&t)),
        brand: str_field(info, "card_type").or_else(|| str_field(info, "brand")),
        last4,
        exp_month: i32_field(info, "exp_month"),
        exp_year: i32_field(info, "exp_year"),
    }
}

/// Charge service for Frisbii charge records
#[derive(Clone)]
pub struct ChargeService {
    client: FrisbiiClient,
    pool: PgPool,
}

impl ChargeService {
    pub fn new(client: FrisbiiClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Fetch the authoritative charge from Frisbii
    pub async fn fetch(&self, processor_id: &str) -> BillingResult<Value> {
        self.client.get(&format!("/charge/{}", processor_id)).await
    }

    /// Synchronize a charge from a gateway snapshot, with one bounded retry
    /// on transient remote failures.
    ///
    /// Returns `None` without error when the owning customer is unknown
    /// locally.
    pub async fn sync(
        &self,
        processor_id: &str,
        object: Option<&Value>,
    ) -> BillingResult<Option<ChargeRecord>> {
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
    ) -> BillingResult<Option<ChargeRecord>> {
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
                    "Charge object carries no customer handle, skipping sync"
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
                    "Customer not known locally, skipping charge sync"
                );
                return Ok(None);
            }
        };

        let status = str_field(object, "state")
            .map(|s| charge_status_from_state(&s))
            .unwrap_or_else(|| "pending".to_string());
        let instrument = extract_instrument(object);

        let record = sqlx::query_as::<_, ChargeRecord>(
            r#"
            INSERT INTO charges (
                id, customer_id, processor_id, amount, currency, status,
                amount_refunded, payment_method_type, brand, last4,
                exp_month, exp_year, metadata, data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (processor_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                amount_refunded = EXCLUDED.amount_refunded,
                payment_method_type = EXCLUDED.payment_method_type,
                brand = EXCLUDED.brand,
                last4 = EXCLUDED.last4,
                exp_month = EXCLUDED.exp_month,
                exp_year = EXCLUDED.exp_year,
                metadata = EXCLUDED.metadata,
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(str_field(object, "id").unwrap_or_else(|| processor_id.to_string()))
        .bind(i64_field(object, "amount").unwrap_or(0))
        .bind(str_field(object, "currency").unwrap_or_else(|| "USD".to_string()))
        .bind(status)
        .bind(i64_field(object, "refunded_amount").unwrap_or(0))
        .bind(instrument.pm_type)
        .bind(instrument.brand)
        .bind(instrument.last4)
        .bind(instrument.exp_month)
        .bind(instrument.exp_year)
        .bind(object.get("metadata"))
        .bind(object)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(record))
    }

    /// Create a charge for a customer and sync the result.
    ///
    /// Not idempotent: retrying without `idempotency_key` creates a duplicate
    /// charge at the gateway.
    pub async fn create(
        &self,
        customer_processor_id: &str,
        amount: i64,
        params: ChargeParams,
    ) -> BillingResult<Option<ChargeRecord>> {
        let handle = params
            .handle
            .unwrap_or_else(|| format!("charge_{:016x}", rand::random::<u64>()));

        let mut body = json!({
            "handle": handle,
            "amount": amount,
            "customer": customer_processor_id,
            "currency": params.currency.unwrap_or_else(|| "USD".to_string()),
        });
        if let Some(pm) = params.payment_method {
            body["payment_method"] = Value::String(pm);
        }
        if let Some(text) = params.description {
            body["ordertext"] = Value::String(text);
        }
        if let Some(metadata) = params.metadata {
            body["metadata"] = metadata;
        }
        if let Some(key) = params.idempotency_key {
            body["key"] = Value::String(key);
        }

        let response = self.client.post("/charge", &body).await?;
        let charge_id = str_field(&response, "id").unwrap_or(handle);
        self.sync(&charge_id, Some(&response)).await
    }

    /// Refund a charge. When `amount` is absent, refunds the remaining
    /// un-refunded amount as reported by the gateway.
    pub async fn refund(
        &self,
        processor_id: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> BillingResult<Value> {
        let amount = match amount {
            Some(a) => a,
            None => {
                let current = self.fetch(processor_id).await?;
                i64_field(&current, "amount").unwrap_or(0)
                    - i64_field(&current, "refunded_amount").unwrap_or(0)
            }
        };

        let mut body = json!({ "amount": amount });
        if let Some(text) = reason {
            body["text"] = Value::String(text.to_string());
        }

        let response = self
            .client
            .post(&format!("/charge/{}/refund", processor_id), &body)
            .await?;

        // Reconcile local state with the post-refund gateway record
        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Capture (settle) an authorized charge, optionally for a partial amount
    pub async fn capture(&self, processor_id: &str, amount: Option<i64>) -> BillingResult<Value> {
        let body = match amount {
            Some(a) => json!({ "amount": a }),
            None => json!({}),
        };

        let response = self
            .client
            .post(&format!("/charge/{}/settle", processor_id), &body)
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }

    /// Cancel an authorized charge before capture
    pub async fn cancel(&self, processor_id: &str) -> BillingResult<Value> {
        let response = self
            .client
            .post(&format!("/charge/{}/cancel", processor_id), &json!({}))
            .await?;

        self.sync(processor_id, None).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn charge_states_map_to_local_statuses() {
        assert_eq!(charge_status_from_state("created"), "pending");
        assert_eq!(charge_status_from_state("pending"), "pending");
        assert_eq!(charge_status_from_state("authorized"), "requires_capture");
        assert_eq!(charge_status_from_state("settled"), "succeeded");
        assert_eq!(charge_status_from_state("failed"), "failed");
        assert_eq!(charge_status_from_state("cancelled"), "canceled");
        assert_eq!(charge_status_from_state("canceled"), "canceled");
    }

    #[test]
    fn unmapped_charge_state_passes_through() {
        assert_eq!(charge_status_from_state("disputed"), "disputed");
        assert_eq!(charge_status_from_state(""), "");
    }

    #[test]
    fn payment_method_types_normalize() {
        assert_eq!(payment_method_type_from_raw("card_token"), "card");
        assert_eq!(payment_method_type_from_raw("mobilepay"), "mobile_payment");
        assert_eq!(payment_method_type_from_raw("vipps"), "mobile_payment");
        assert_eq!(payment_method_type_from_raw("paypal"), "paypal");
        assert_eq!(payment_method_type_from_raw("sepa"), "bank_account");
        assert_eq!(payment_method_type_from_raw("applepay"), "applepay");
    }

    #[test]
    fn last4_handles_masked_formats() {
        assert_eq!(last4_from_masked("457111XXXXXX3742").as_deref(), Some("3742"));
        assert_eq!(last4_from_masked("XXXX-XXXX-XXXX-1234").as_deref(), Some("1234"));
        assert_eq!(last4_from_masked("12").as_deref(), None);
    }

    #[test]
    fn instrument_extraction_prefers_masked_card() {
        let object = json!({
            "payment_method_info": {
                "type": "card",
                "card_type": "visa",
                "masked_card": "457111XXXXXX3742",
                "last4": "9999",
                "exp_month": 6,
                "exp_year": 2028
            }
        });
        let info = extract_instrument(&object);
        assert_eq!(info.pm_type.as_deref(), Some("card"));
        assert_eq!(info.brand.as_deref(), Some("visa"));
        assert_eq!(info.last4.as_deref(), Some("3742"));
        assert_eq!(info.exp_month, Some(6));
        assert_eq!(info.exp_year, Some(2028));
    }

    #[test]
    fn instrument_extraction_without_info_block_is_empty() {
        let info = extract_instrument(&json!({"id": "ch_1"}));
        assert_eq!(info, InstrumentInfo::default());
    }
}
