//! Customer sync and gateway operations
//!
//! Customers are the root of the local billing graph: charges, subscriptions,
//! and payment methods all hang off a customer row keyed by the Frisbii
//! customer handle. Sync is full-overwrite from the latest gateway snapshot.

use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::charge::{ChargeParams, ChargeRecord, ChargeService};
use crate::client::FrisbiiClient;
use crate::error::{BillingError, BillingResult};
use crate::fields::str_field;
use crate::payment_method::{PaymentMethodRecord, PaymentMethodService};
use crate::subscription::{SubscribeParams, SubscriptionRecord, SubscriptionService};

/// Local customer row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub processor_id: String,
    pub email: Option<String>,
    pub data: Value,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields sent when creating a customer in Frisbii
#[derive(Debug, Clone, Default)]
pub struct CreateCustomerParams {
    /// Frisbii handle; generated when absent
    pub handle: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Customer service for Frisbii customer records
#[derive(Clone)]
pub struct CustomerService {
    client: FrisbiiClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(client: FrisbiiClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Look up a local customer by Frisbii handle
    pub async fn find_by_processor_id(
        &self,
        processor_id: &str,
    ) -> BillingResult<Option<CustomerRecord>> {
        let record = sqlx::query_as::<_, CustomerRecord>(
            "SELECT * FROM customers WHERE processor_id = $1",
        )
        .bind(processor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Fetch the authoritative customer record from Frisbii
    pub async fn fetch(&self, processor_id: &str) -> BillingResult<Value> {
        self.client.get(&format!("/customer/{}", processor_id)).await
    }

    /// Synchronize a customer from a gateway snapshot.
    ///
    /// Overwrites the mapped fields wholesale from the object (fetching it
    /// when not supplied). Returns `None` without error when the customer is
    /// unknown locally, since the event may reference a customer outside
    /// this application's scope.
    pub async fn sync(
        &self,
        processor_id: &str,
        object: Option<&Value>,
    ) -> BillingResult<Option<CustomerRecord>> {
        let fetched;
        let object = match object {
            Some(o) => o,
            None => {
                fetched = self.fetch(processor_id).await?;
                &fetched
            }
        };

        let record = sqlx::query_as::<_, CustomerRecord>(
            r#"
            UPDATE customers
            SET email = $2, data = $3, updated_at = NOW()
            WHERE processor_id = $1
            RETURNING *
            "#,
        )
        .bind(processor_id)
        .bind(str_field(object, "email"))
        .bind(object)
        .fetch_optional(&self.pool)
        .await?;

        if record.is_none() {
            tracing::debug!(
                processor_id = %processor_id,
                "Customer not known locally, skipping sync"
            );
        }

        Ok(record)
    }

    /// Create a customer in Frisbii and record it locally
    pub async fn create(&self, params: CreateCustomerParams) -> BillingResult<CustomerRecord> {
        let handle = params
            .handle
            .unwrap_or_else(|| format!("cust_{:016x}", rand::random::<u64>()));

        let mut body = json!({
            "handle": handle,
            "email": params.email,
        });
        let fields = [
            ("first_name", params.first_name),
            ("last_name", params.last_name),
            ("phone", params.phone),
            ("address", params.address),
            ("city", params.city),
            ("postal_code", params.postal_code),
            ("country", params.country),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                body[key] = Value::String(v);
            }
        }

        let object = self.client.post("/customer", &body).await?;
        let processor_id = str_field(&object, "handle").unwrap_or(handle);

        let record = sqlx::query_as::<_, CustomerRecord>(
            r#"
            INSERT INTO customers (id, processor_id, email, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (processor_id) DO UPDATE SET
                email = EXCLUDED.email,
                data = EXCLUDED.data,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&processor_id)
        .bind(str_field(&object, "email"))
        .bind(&object)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(processor_id = %processor_id, "Created Frisbii customer");
        Ok(record)
    }

    /// Update a customer in Frisbii.
    ///
    /// Frisbii requires the full record on update, so this fetches the current
    /// state, merges the given attributes over it, strips read-only fields,
    /// and PUTs the result back, then re-syncs the local row.
    pub async fn update(
        &self,
        processor_id: &str,
        attributes: &Value,
    ) -> BillingResult<Option<CustomerRecord>> {
        let mut current = self.fetch(processor_id).await?;

        if let (Some(target), Some(updates)) = (current.as_object_mut(), attributes.as_object()) {
            for (key, value) in updates {
                target.insert(key.clone(), value.clone());
            }
            // Read-only fields Frisbii rejects on update
            target.remove("created");
            target.remove("deleted");
        } else {
            return Err(BillingError::Internal(
                "customer update requires JSON objects".to_string(),
            ));
        }

        let updated = self
            .client
            .put(&format!("/customer/{}", processor_id), &current)
            .await?;

        self.sync(processor_id, Some(&updated)).await
    }

    /// Create a one-off charge against this customer
    pub async fn charge(
        &self,
        processor_id: &str,
        amount: i64,
        params: ChargeParams,
    ) -> BillingResult<Option<ChargeRecord>> {
        ChargeService::new(self.client.clone(), self.pool.clone())
            .create(processor_id, amount, params)
            .await
    }

    /// Subscribe this customer to a plan
    pub async fn subscribe(
        &self,
        processor_id: &str,
        plan: &str,
        params: SubscribeParams,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        SubscriptionService::new(self.client.clone(), self.pool.clone())
            .create(processor_id, plan, params)
            .await
    }

    /// Attach a tokenized payment method to this customer
    pub async fn add_payment_method(
        &self,
        processor_id: &str,
        token: &str,
        make_default: bool,
    ) -> BillingResult<Option<PaymentMethodRecord>> {
        PaymentMethodService::new(self.client.clone(), self.pool.clone())
            .attach(processor_id, token, make_default)
            .await
    }

    /// Sync every subscription Frisbii holds for this customer
    pub async fn sync_subscriptions(&self, processor_id: &str) -> BillingResult<usize> {
        let response = self
            .client
            .get(&format!("/subscription?customer={}", processor_id))
            .await?;

        let list = match response.as_array() {
            Some(list) => list.clone(),
            // Some list endpoints wrap results in {"content": [...]}
            None => response
                .get("content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };

        let subscriptions = SubscriptionService::new(self.client.clone(), self.pool.clone());
        let mut synced = 0;
        for object in &list {
            if let Some(handle) = str_field(object, "handle") {
                if subscriptions.sync(&handle, Some(object)).await?.is_some() {
                    synced += 1;
                }
            }
        }

        tracing::info!(
            processor_id = %processor_id,
            synced = synced,
            "Synced customer subscriptions"
        );
        Ok(synced)
    }

    /// Create a hosted checkout session for the customer
    pub async fn checkout_session(
        &self,
        processor_id: &str,
        params: &Value,
    ) -> BillingResult<Value> {
        let mut body = json!({
            "customer": processor_id,
            "mode": "payment",
        });
        if let (Some(target), Some(extra)) = (body.as_object_mut(), params.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        self.client.post("/checkout/session", &body).await
    }

    /// Create a customer portal session
    pub async fn billing_portal_session(
        &self,
        processor_id: &str,
        return_url: &str,
    ) -> BillingResult<Value> {
        self.client
            .post(
                &format!("/customer/{}/portal_session", processor_id),
                &json!({ "customer": processor_id, "return_url": return_url }),
            )
            .await
    }

    /// Gateway-driven customer deletion cascade.
    ///
    /// Marks active subscriptions canceled as of now, removes payment methods,
    /// and soft-deletes the customer row. Returns false when the customer is
    /// unknown locally.
    pub async fn mark_deleted(&self, processor_id: &str) -> BillingResult<bool> {
        let customer = match self.find_by_processor_id(processor_id).await? {
            Some(c) => c,
            None => return Ok(false),
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', ends_at = NOW(), updated_at = NOW()
            WHERE customer_id = $1
              AND status IN ('active', 'trialing', 'past_due', 'paused', 'incomplete')
            "#,
        )
        .bind(customer.id)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM payment_methods WHERE customer_id = $1")
            .bind(customer.id)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE customers SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(customer.id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            processor_id = %processor_id,
            customer_id = %customer.id,
            "Customer deleted by gateway, cascaded to subscriptions and payment methods"
        );
        Ok(true)
    }
}
