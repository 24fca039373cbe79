//! Payment method sync and gateway operations
//!
//! At most one payment method per customer should carry the default flag.
//! The unset-then-set sequence used by `make_default` is two statements with
//! no surrounding transaction, mirroring the gateway-side sequence; concurrent
//! callers can race it.

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::charge::last4_from_masked;
use crate::client::FrisbiiClient;
use crate::error::BillingResult;
use crate::fields::{i32_field, str_field};

/// Local payment method row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PaymentMethodRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub processor_id: String,
    pub pm_type: String,
    pub is_default: bool,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub bank: Option<String>,
    pub data: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Masked descriptors extracted from a gateway payment method object,
/// varying by instrument type
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct MethodAttributes {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub bank: Option<String>,
}

pub(crate) fn extract_method_attributes(object: &Value) -> MethodAttributes {
    let raw_type = str_field(object, "type").unwrap_or_default();
    let mut attrs = MethodAttributes::default();

    match raw_type.as_str() {
        "card" | "card_token" => {
            attrs.brand = str_field(object, "card_type").or_else(|| str_field(object, "brand"));
            attrs.last4 = extract_last4(object);
            attrs.exp_month = i32_field(object, "exp_month");
            attrs.exp_year = i32_field(object, "exp_year");
        }
        "mobilepay" | "vipps" | "swish" => {
            attrs.username = str_field(object, "phone").or_else(|| str_field(object, "email"));
        }
        "paypal" => {
            attrs.email = str_field(object, "email");
        }
        "bank" | "sepa" | "bank_transfer" => {
            attrs.bank = str_field(object, "bank_name").or_else(|| str_field(object, "bank"));
            attrs.last4 = extract_last4(object);
        }
        _ => {}
    }

    if attrs.email.is_none() {
        attrs.email = str_field(object, "email");
    }

    attrs
}

fn extract_last4(object: &Value) -> Option<String> {
    str_field(object, "masked_card")
        .and_then(|m| last4_from_masked(&m))
        .or_else(|| str_field(object, "last4"))
        .or_else(|| str_field(object, "account_number").and_then(|a| last4_from_masked(&a)))
}

/// Payment method service for Frisbii stored instruments
#[derive(Clone)]
pub struct PaymentMethodService {
    client: FrisbiiClient,
    pool: PgPool,
}

impl PaymentMethodService {
    pub fn new(client: FrisbiiClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Fetch the authoritative payment method from Frisbii
    pub async fn fetch(&self, processor_id: &str) -> BillingResult<Value> {
        self.client
            .get(&format!("/payment_method/{}", processor_id))
            .await
    }

    /// Synchronize a payment method from a gateway snapshot.
    ///
    /// Returns `None` without error when the owning customer is unknown
    /// locally. A customer's first payment method becomes the default.
    pub async fn sync(
        &self,
        processor_id: &str,
        object: Option<&Value>,
    ) -> BillingResult<Option<PaymentMethodRecord>> {
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
                    "Payment method carries no customer handle, skipping sync"
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
                    "Customer not known locally, skipping payment method sync"
                );
                return Ok(None);
            }
        };

        let existing_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payment_methods WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_one(&self.pool)
                .await?;

        let is_default = existing_count.0 == 0
            || object.get("default").and_then(Value::as_bool).unwrap_or(false);

        let pm_type = str_field(object, "type")
            .map(|t| crate::charge::payment_method_type_from_raw(&t))
            .unwrap_or_else(|| "card".to_string());
        let attrs = extract_method_attributes(object);

        let record = sqlx::query_as::<_, PaymentMethodRecord>(
            r#"
            INSERT INTO payment_methods (
                id, customer_id, processor_id, pm_type, is_default,
                brand, last4, exp_month, exp_year, username, email, bank, data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (processor_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                pm_type = EXCLUDED.pm_type,
                is_default = EXCLUDED.is_default,
                brand = EXCLUDED.brand,
                last4 = EXCLUDED.last4,
                exp_month = EXCLUDED.exp_month,
                exp_year = EXCLUDED.exp_year,
                username = EXCLUDED.username,
                email = EXCLUDED.email,
                bank = EXCLUDED.bank,
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(str_field(object, "id").unwrap_or_else(|| processor_id.to_string()))
        .bind(pm_type)
        .bind(is_default)
        .bind(attrs.brand)
        .bind(attrs.last4)
        .bind(attrs.exp_month)
        .bind(attrs.exp_year)
        .bind(attrs.username)
        .bind(attrs.email)
        .bind(attrs.bank)
        .bind(object)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(record))
    }

    /// Attach a tokenized payment method to a customer in Frisbii and sync
    /// the result, optionally making it the default.
    pub async fn attach(
        &self,
        customer_processor_id: &str,
        token: &str,
        make_default: bool,
    ) -> BillingResult<Option<PaymentMethodRecord>> {
        let response = self
            .client
            .post(
                &format!("/customer/{}/payment_method", customer_processor_id),
                &json!({ "customer": customer_processor_id, "token": token }),
            )
            .await?;

        let processor_id = match str_field(&response, "id") {
            Some(id) => id,
            None => return Ok(None),
        };

        let record = self.sync(&processor_id, Some(&response)).await?;

        if make_default {
            if let Some(record) = &record {
                self.make_default(customer_processor_id, &record.processor_id)
                    .await?;
            }
        }

        Ok(record)
    }

    /// Make a payment method the customer's default.
    ///
    /// Unsets any other local defaults, records the default at the gateway,
    /// then flags the local row. Read-then-write with no transaction.
    pub async fn make_default(
        &self,
        customer_processor_id: &str,
        processor_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_methods
            SET is_default = FALSE, updated_at = NOW()
            WHERE customer_id = (SELECT id FROM customers WHERE processor_id = $1)
              AND processor_id <> $2
              AND is_default = TRUE
            "#,
        )
        .bind(customer_processor_id)
        .bind(processor_id)
        .execute(&self.pool)
        .await?;

        self.client
            .post(
                &format!(
                    "/customer/{}/payment_method/{}/default",
                    customer_processor_id, processor_id
                ),
                &json!({}),
            )
            .await?;

        sqlx::query(
            "UPDATE payment_methods SET is_default = TRUE, updated_at = NOW() WHERE processor_id = $1",
        )
        .bind(processor_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Detach a payment method: delete at the gateway, then locally
    pub async fn detach(
        &self,
        customer_processor_id: &str,
        processor_id: &str,
    ) -> BillingResult<()> {
        self.client
            .delete(&format!(
                "/customer/{}/payment_method/{}",
                customer_processor_id, processor_id
            ))
            .await?;

        self.delete_local(processor_id).await
    }

    /// Remove the local row for a gateway-deleted payment method
    pub async fn delete_local(&self, processor_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM payment_methods WHERE processor_id = $1")
            .bind(processor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear the default flag across a customer's payment methods
    pub async fn unset_defaults(&self, customer_processor_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_methods
            SET is_default = FALSE, updated_at = NOW()
            WHERE customer_id = (SELECT id FROM customers WHERE processor_id = $1)
            "#,
        )
        .bind(customer_processor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn card_attributes_extracted() {
        let object = json!({
            "type": "card",
            "card_type": "mastercard",
            "masked_card": "557711XXXXXX4001",
            "exp_month": 11,
            "exp_year": 2027
        });
        let attrs = extract_method_attributes(&object);
        assert_eq!(attrs.brand.as_deref(), Some("mastercard"));
        assert_eq!(attrs.last4.as_deref(), Some("4001"));
        assert_eq!(attrs.exp_month, Some(11));
        assert_eq!(attrs.exp_year, Some(2027));
        assert!(attrs.username.is_none());
    }

    #[test]
    fn mobile_payment_uses_phone_then_email() {
        let with_phone = json!({"type": "mobilepay", "phone": "+4512345678"});
        assert_eq!(
            extract_method_attributes(&with_phone).username.as_deref(),
            Some("+4512345678")
        );

        let email_only = json!({"type": "vipps", "email": "a@b.dk"});
        let attrs = extract_method_attributes(&email_only);
        assert_eq!(attrs.username.as_deref(), Some("a@b.dk"));
        assert_eq!(attrs.email.as_deref(), Some("a@b.dk"));
    }

    #[test]
    fn bank_account_extracts_bank_and_last4() {
        let object = json!({
            "type": "sepa",
            "bank_name": "Danske Bank",
            "account_number": "DK5000400440116243"
        });
        let attrs = extract_method_attributes(&object);
        assert_eq!(attrs.bank.as_deref(), Some("Danske Bank"));
        assert_eq!(attrs.last4.as_deref(), Some("6243"));
    }

    #[test]
    fn unknown_type_keeps_common_fields_only() {
        let object = json!({"type": "giftcard", "email": "x@y.z", "last4": "1111"});
        let attrs = extract_method_attributes(&object);
        assert_eq!(attrs.email.as_deref(), Some("x@y.z"));
        assert!(attrs.last4.is_none());
        assert!(attrs.brand.is_none());
    }
}
