//! Merchant (connected account) operations
//!
//! Marketplace/platform money movement: connected accounts, onboarding links,
//! and transfers. Thin passthroughs over the gateway plus a local record of
//! the account handle.

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::FrisbiiClient;
use crate::error::BillingResult;
use crate::fields::str_field;

/// Local merchant row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct MerchantRecord {
    pub id: Uuid,
    pub processor_id: String,
    pub data: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Merchant service for Frisbii connected accounts
#[derive(Clone)]
pub struct MerchantService {
    client: FrisbiiClient,
    pool: PgPool,
}

impl MerchantService {
    pub fn new(client: FrisbiiClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Create a connected account and record its handle locally
    pub async fn create_account(
        &self,
        email: &str,
        business_name: Option<&str>,
        country: Option<&str>,
    ) -> BillingResult<MerchantRecord> {
        let mut body = json!({ "type": "standard", "email": email });
        if let Some(name) = business_name {
            body["business_name"] = Value::String(name.to_string());
        }
        if let Some(country) = country {
            body["country"] = Value::String(country.to_string());
        }

        let account = self.client.post("/account", &body).await?;
        let processor_id = str_field(&account, "id").unwrap_or_default();

        let record = sqlx::query_as::<_, MerchantRecord>(
            r#"
            INSERT INTO merchants (id, processor_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (processor_id) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&processor_id)
        .bind(&account)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(processor_id = %processor_id, "Created merchant account");
        Ok(record)
    }

    /// Fetch the connected account from the gateway
    pub async fn account(&self, processor_id: &str) -> BillingResult<Value> {
        self.client.get(&format!("/account/{}", processor_id)).await
    }

    /// Create an onboarding link for the connected account
    pub async fn account_link(
        &self,
        processor_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> BillingResult<Value> {
        self.client
            .post(
                "/account_links",
                &json!({
                    "account": processor_id,
                    "refresh_url": refresh_url,
                    "return_url": return_url,
                    "type": "account_onboarding",
                }),
            )
            .await
    }

    /// Create a dashboard login link for the merchant
    pub async fn login_link(
        &self,
        processor_id: &str,
        redirect_url: Option<&str>,
    ) -> BillingResult<Value> {
        let mut body = json!({ "account": processor_id });
        if let Some(url) = redirect_url {
            body["redirect_url"] = Value::String(url.to_string());
        }
        self.client
            .post(&format!("/account/{}/login_link", processor_id), &body)
            .await
    }

    /// Transfer funds to the connected account
    pub async fn transfer(
        &self,
        processor_id: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<Value> {
        self.client
            .post(
                "/transfers",
                &json!({
                    "amount": amount,
                    "currency": currency,
                    "destination": processor_id,
                }),
            )
            .await
    }

    /// Update the connected account and refresh the local snapshot
    pub async fn update_account(
        &self,
        processor_id: &str,
        attributes: &Value,
    ) -> BillingResult<Value> {
        let updated = self
            .client
            .put(&format!("/account/{}", processor_id), attributes)
            .await?;

        sqlx::query("UPDATE merchants SET data = $2, updated_at = NOW() WHERE processor_id = $1")
            .bind(processor_id)
            .bind(&updated)
            .execute(&self.pool)
            .await?;

        Ok(updated)
    }
}
