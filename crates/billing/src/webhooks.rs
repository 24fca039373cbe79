//! Frisbii webhook handling
//!
//! Inbound flow: the API server hands raw request bytes to
//! [`WebhookReceiver::receive`], which parses, verifies the signature, and
//! persists the event as `pending` before anything else touches it. Actual
//! processing happens asynchronously: [`WebhookProcessor`] claims persisted
//! events and dispatches them through a [`WebhookRouter`] to one handler per
//! event type. Handlers tolerate out-of-order and replayed delivery because
//! every sync is a full overwrite from the latest gateway snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::charge::ChargeService;
use crate::client::{FrisbiiClient, FrisbiiConfig};
use crate::customer::CustomerService;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::fields::str_field;
use crate::payment_method::PaymentMethodService;
use crate::subscription::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Recovery window after which a stuck `processing` event may be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Compute the expected webhook signature:
/// `hex(HMAC-SHA256(secret, timestamp ‖ event_id))`, raw concatenation with
/// no delimiter.
pub fn compute_signature(secret: &str, timestamp: &str, event_id: &str) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA-256
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(event_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a supplied webhook signature. Pure, no I/O.
///
/// Fails closed on length mismatch before comparing; the comparison itself is
/// constant-time so the position of the first differing byte leaks nothing.
pub fn verify_signature(secret: &str, timestamp: &str, event_id: &str, supplied: &str) -> bool {
    let expected = compute_signature(secret, timestamp, event_id);
    if expected.len() != supplied.len() {
        return false;
    }
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

/// Authenticate a parsed webhook event against the configured secret.
///
/// With no secret configured, verification is skipped entirely and logged as
/// a degraded-security condition. With a secret, absent `signature`,
/// `timestamp`, or `id` fields fail closed.
pub fn authenticate_event(secret: Option<&str>, event: &Value) -> BillingResult<()> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => {
            tracing::warn!(
                "Webhook signing secret is not configured; skipping signature verification"
            );
            return Ok(());
        }
    };

    let (Some(signature), Some(timestamp), Some(event_id)) = (
        event.get("signature").and_then(Value::as_str),
        event.get("timestamp").and_then(Value::as_str),
        event.get("id").and_then(Value::as_str),
    ) else {
        return Err(BillingError::WebhookSignatureInvalid);
    };

    if !verify_signature(secret, timestamp, event_id, signature) {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Persisted webhook event row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub processing_started_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Outcome of accepting an inbound webhook
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// Local row id; `None` when the event was a redelivery we already hold
    pub record_id: Option<Uuid>,
    pub event_id: String,
    pub event_type: String,
}

/// Accepts, authenticates, and persists inbound webhook events
#[derive(Clone)]
pub struct WebhookReceiver {
    pool: PgPool,
    secret: Option<String>,
}

impl WebhookReceiver {
    pub fn new(config: &FrisbiiConfig, pool: PgPool) -> Self {
        Self {
            pool,
            secret: config.webhook_secret.clone(),
        }
    }

    /// Parse, verify, and persist a raw webhook body.
    ///
    /// Returns quickly: no downstream sync work happens here, so the HTTP
    /// response never blocks on gateway calls. Redelivered events (same
    /// gateway event id) are accepted and dropped.
    pub async fn receive(&self, payload: &[u8]) -> BillingResult<ReceivedEvent> {
        let event: Value = serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        authenticate_event(self.secret.as_deref(), &event)?;

        let event_id = str_field(&event, "id")
            .ok_or_else(|| BillingError::MalformedPayload("missing event id".to_string()))?;
        let event_type = str_field(&event, "event_type")
            .ok_or_else(|| BillingError::MalformedPayload("missing event_type".to_string()))?;

        // Durability point: the raw event is on disk before we acknowledge
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (id, event_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event_id)
        .bind(&event_type)
        .bind(&event)
        .fetch_optional(&self.pool)
        .await?;

        match &inserted {
            Some((record_id,)) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    record_id = %record_id,
                    "Webhook event accepted"
                );
            }
            None => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook delivery, already persisted"
                );
            }
        }

        Ok(ReceivedEvent {
            record_id: inserted.map(|(id,)| id),
            event_id,
            event_type,
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch registry
// ---------------------------------------------------------------------------

/// A handler for one webhook event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn call(&self, event: &Value) -> BillingResult<()>;
}

/// How a dispatch resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler registered, a forward-compatible no-op
    Ignored,
}

/// Static mapping from event-type string to exactly one handler.
///
/// Registering a second handler for the same key is an error rather than an
/// override; silently picking one of two conflicting handlers is exactly the
/// failure mode construction should catch.
#[derive(Default)]
pub struct WebhookRouter {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl WebhookRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BillingResult<()> {
        if self.handlers.contains_key(event_type) {
            return Err(BillingError::DuplicateHandler(event_type.to_string()));
        }
        self.handlers.insert(event_type.to_string(), handler);
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to its handler. Unknown event types are dropped
    /// silently; handler failures propagate to the caller, which isolates
    /// them per event.
    pub async fn dispatch(
        &self,
        event_type: &str,
        event: &Value,
    ) -> BillingResult<DispatchOutcome> {
        match self.handlers.get(event_type) {
            Some(handler) => {
                handler.call(event).await?;
                Ok(DispatchOutcome::Handled)
            }
            None => {
                tracing::debug!(
                    event_type = %event_type,
                    "No handler registered for event type, ignoring"
                );
                Ok(DispatchOutcome::Ignored)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Shared dependencies for event handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub client: FrisbiiClient,
    pub pool: PgPool,
    pub email: BillingEmailService,
}

impl HandlerContext {
    pub fn new(client: FrisbiiClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self { client, pool, email }
    }

    fn customers(&self) -> CustomerService {
        CustomerService::new(self.client.clone(), self.pool.clone())
    }

    fn charges(&self) -> ChargeService {
        ChargeService::new(self.client.clone(), self.pool.clone())
    }

    fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.client.clone(), self.pool.clone())
    }

    fn payment_methods(&self) -> PaymentMethodService {
        PaymentMethodService::new(self.client.clone(), self.pool.clone())
    }

    async fn customer_email(&self, customer_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT email FROM customers WHERE id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(email,)| email))
    }
}

/// Build the production router with one handler per Frisbii event type
pub fn default_router(ctx: HandlerContext) -> BillingResult<WebhookRouter> {
    let mut router = WebhookRouter::new();

    // Customer events
    router.register("customer_created", Arc::new(CustomerCreated { ctx: ctx.clone() }))?;
    router.register("customer_updated", Arc::new(CustomerUpdated { ctx: ctx.clone() }))?;
    router.register("customer_deleted", Arc::new(CustomerDeleted { ctx: ctx.clone() }))?;

    // Invoice (charge) events
    router.register("invoice_settled", Arc::new(InvoiceSettled { ctx: ctx.clone() }))?;
    router.register("invoice_authorized", Arc::new(InvoiceSynced { ctx: ctx.clone() }))?;
    router.register("invoice_failed", Arc::new(InvoiceFailed { ctx: ctx.clone() }))?;
    router.register("invoice_refunded", Arc::new(InvoiceRefunded { ctx: ctx.clone() }))?;
    router.register("invoice_cancelled", Arc::new(InvoiceSynced { ctx: ctx.clone() }))?;

    // Subscription events
    router.register(
        "subscription_created",
        Arc::new(SubscriptionSynced { ctx: ctx.clone(), note: "created" }),
    )?;
    router.register(
        "subscription_renewal",
        Arc::new(SubscriptionRenewal { ctx: ctx.clone() }),
    )?;
    router.register(
        "subscription_cancelled",
        Arc::new(SubscriptionCancelled { ctx: ctx.clone() }),
    )?;
    router.register(
        "subscription_uncancelled",
        Arc::new(SubscriptionSynced { ctx: ctx.clone(), note: "uncancelled" }),
    )?;
    router.register(
        "subscription_on_hold",
        Arc::new(SubscriptionSynced { ctx: ctx.clone(), note: "put on hold" }),
    )?;
    router.register(
        "subscription_reactivated",
        Arc::new(SubscriptionSynced { ctx: ctx.clone(), note: "reactivated" }),
    )?;
    router.register(
        "subscription_expired",
        Arc::new(SubscriptionSynced { ctx: ctx.clone(), note: "expired" }),
    )?;
    router.register(
        "subscription_trial_end",
        Arc::new(SubscriptionTrialEnd { ctx: ctx.clone() }),
    )?;

    // Payment method events
    router.register(
        "payment_method_created",
        Arc::new(PaymentMethodUpserted { ctx: ctx.clone() }),
    )?;
    router.register(
        "payment_method_updated",
        Arc::new(PaymentMethodUpserted { ctx: ctx.clone() }),
    )?;
    router.register("payment_method_deleted", Arc::new(PaymentMethodDeleted { ctx }))?;

    Ok(router)
}

struct CustomerCreated {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for CustomerCreated {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("customer") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };
        self.ctx.customers().sync(&handle, Some(object)).await?;
        Ok(())
    }
}

struct CustomerUpdated {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for CustomerUpdated {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("customer") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };

        if self.ctx.customers().sync(&handle, Some(object)).await?.is_none() {
            return Ok(());
        }

        // Reconcile the default payment method: sync the new default, or
        // clear all defaults when the customer no longer has one.
        match str_field(object, "default_payment_method") {
            Some(pm_handle) => {
                self.ctx.payment_methods().sync(&pm_handle, None).await?;
            }
            None => {
                self.ctx.payment_methods().unset_defaults(&handle).await?;
            }
        }
        Ok(())
    }
}

struct CustomerDeleted {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for CustomerDeleted {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("customer") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };
        self.ctx.customers().mark_deleted(&handle).await?;
        Ok(())
    }
}

/// Sync-only invoice events (authorized, cancelled)
struct InvoiceSynced {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for InvoiceSynced {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(invoice) = event.get("invoice") else {
            return Ok(());
        };
        let Some(charge_id) = str_field(invoice, "id") else {
            return Ok(());
        };
        self.ctx.charges().sync(&charge_id, Some(invoice)).await?;
        Ok(())
    }
}

struct InvoiceSettled {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for InvoiceSettled {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(invoice) = event.get("invoice") else {
            return Ok(());
        };
        let Some(charge_id) = str_field(invoice, "id") else {
            return Ok(());
        };

        let Some(charge) = self.ctx.charges().sync(&charge_id, Some(invoice)).await? else {
            return Ok(());
        };

        if self.ctx.email.is_enabled("receipt") {
            if let Some(to) = self.ctx.customer_email(charge.customer_id).await? {
                if let Err(e) = self
                    .ctx
                    .email
                    .send_receipt(&to, &charge.processor_id, charge.amount, &charge.currency)
                    .await
                {
                    tracing::error!(
                        error = %e,
                        charge_id = %charge.processor_id,
                        "Failed to send receipt email"
                    );
                }
            }
        }
        Ok(())
    }
}

struct InvoiceFailed {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for InvoiceFailed {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(invoice) = event.get("invoice") else {
            return Ok(());
        };
        let Some(charge_id) = str_field(invoice, "id") else {
            return Ok(());
        };

        let charge = self.ctx.charges().sync(&charge_id, Some(invoice)).await?;

        // A failed subscription invoice usually means the subscription went
        // into dunning; pull its authoritative state too.
        if let Some(subscription_id) = str_field(invoice, "subscription") {
            let subscription = self.ctx.subscriptions().sync(&subscription_id, None).await?;

            if let (Some(subscription), Some(_)) = (&subscription, &charge) {
                if self.ctx.email.is_enabled("payment_failed") {
                    if let Some(to) = self.ctx.customer_email(subscription.customer_id).await? {
                        if let Err(e) = self
                            .ctx
                            .email
                            .send_payment_failed(&to, &subscription.processor_id)
                            .await
                        {
                            tracing::error!(error = %e, "Failed to send payment failed email");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

struct InvoiceRefunded {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for InvoiceRefunded {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(invoice) = event.get("invoice") else {
            return Ok(());
        };
        let Some(charge_id) = str_field(invoice, "id") else {
            return Ok(());
        };

        let Some(charge) = self.ctx.charges().sync(&charge_id, Some(invoice)).await? else {
            return Ok(());
        };

        if self.ctx.email.is_enabled("refund") {
            if let Some(to) = self.ctx.customer_email(charge.customer_id).await? {
                if let Err(e) = self
                    .ctx
                    .email
                    .send_refund(
                        &to,
                        &charge.processor_id,
                        charge.amount_refunded,
                        &charge.currency,
                    )
                    .await
                {
                    tracing::error!(
                        error = %e,
                        charge_id = %charge.processor_id,
                        "Failed to send refund email"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Sync-only subscription events (created, uncancelled, on_hold,
/// reactivated, expired)
struct SubscriptionSynced {
    ctx: HandlerContext,
    note: &'static str,
}

#[async_trait]
impl EventHandler for SubscriptionSynced {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("subscription") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };

        if self.ctx.subscriptions().sync(&handle, Some(object)).await?.is_some() {
            tracing::info!(subscription = %handle, "Subscription {}", self.note);
        }
        Ok(())
    }
}

struct SubscriptionRenewal {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for SubscriptionRenewal {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("subscription") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };

        let Some(subscription) = self.ctx.subscriptions().sync(&handle, Some(object)).await?
        else {
            return Ok(());
        };

        if self.ctx.email.is_enabled("subscription_renewing") {
            if let Some(to) = self.ctx.customer_email(subscription.customer_id).await? {
                if let Err(e) = self
                    .ctx
                    .email
                    .send_subscription_renewing(&to, &subscription.processor_id)
                    .await
                {
                    tracing::error!(error = %e, "Failed to send renewal email");
                }
            }
        }
        Ok(())
    }
}

struct SubscriptionCancelled {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for SubscriptionCancelled {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("subscription") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };

        let Some(subscription) = self.ctx.subscriptions().sync(&handle, Some(object)).await?
        else {
            return Ok(());
        };

        if self.ctx.email.is_enabled("subscription_canceled") {
            if let Some(to) = self.ctx.customer_email(subscription.customer_id).await? {
                if let Err(e) = self
                    .ctx
                    .email
                    .send_subscription_canceled(
                        &to,
                        &subscription.processor_id,
                        subscription.ends_at,
                    )
                    .await
                {
                    tracing::error!(error = %e, "Failed to send cancellation email");
                }
            }
        }
        Ok(())
    }
}

/// Which trial email a subscription should get, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrialNotice {
    WillEnd,
    Ended,
}

/// A subscription with no `trial_ends_at` was never on a trial, so it
/// gets no notification at all.
fn trial_notification(
    trial_ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<TrialNotice> {
    let ends_at = trial_ends_at?;
    if now < ends_at {
        Some(TrialNotice::WillEnd)
    } else {
        Some(TrialNotice::Ended)
    }
}

struct SubscriptionTrialEnd {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for SubscriptionTrialEnd {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("subscription") else {
            return Ok(());
        };
        let Some(handle) = str_field(object, "handle") else {
            return Ok(());
        };

        let subscriptions = self.ctx.subscriptions();
        // Only subscriptions we already track get trial notifications
        if subscriptions.find_by_processor_id(&handle).await?.is_none() {
            return Ok(());
        }

        let Some(subscription) = subscriptions.sync(&handle, Some(object)).await? else {
            return Ok(());
        };

        let Some(notice) =
            trial_notification(subscription.trial_ends_at, OffsetDateTime::now_utc())
        else {
            return Ok(());
        };

        let Some(to) = self.ctx.customer_email(subscription.customer_id).await? else {
            return Ok(());
        };

        let result = match notice {
            TrialNotice::WillEnd => {
                if !self.ctx.email.is_enabled("subscription_trial_will_end") {
                    return Ok(());
                }
                self.ctx
                    .email
                    .send_trial_will_end(&to, &subscription.processor_id)
                    .await
            }
            TrialNotice::Ended => {
                if !self.ctx.email.is_enabled("subscription_trial_ended") {
                    return Ok(());
                }
                self.ctx
                    .email
                    .send_trial_ended(&to, &subscription.processor_id)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to send trial notification email");
        }
        Ok(())
    }
}

/// Created/updated payment methods: sync when attached to a customer,
/// remove the local row when the customer link was dropped.
struct PaymentMethodUpserted {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for PaymentMethodUpserted {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("payment_method") else {
            return Ok(());
        };
        let Some(id) = str_field(object, "id") else {
            return Ok(());
        };

        if object.get("customer").and_then(Value::as_str).is_some() {
            self.ctx.payment_methods().sync(&id, Some(object)).await?;
        } else {
            self.ctx.payment_methods().delete_local(&id).await?;
        }
        Ok(())
    }
}

struct PaymentMethodDeleted {
    ctx: HandlerContext,
}

#[async_trait]
impl EventHandler for PaymentMethodDeleted {
    async fn call(&self, event: &Value) -> BillingResult<()> {
        let Some(object) = event.get("payment_method") else {
            return Ok(());
        };
        let Some(id) = str_field(object, "id") else {
            return Ok(());
        };
        self.ctx.payment_methods().delete_local(&id).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Claims persisted webhook events and runs them through the router.
///
/// Claiming is atomic (UPDATE ... RETURNING): only one worker wins a given
/// event, and events stuck in `processing` past the timeout are re-claimable
/// so a crashed worker can't strand them.
#[derive(Clone)]
pub struct WebhookProcessor {
    pool: PgPool,
    router: Arc<WebhookRouter>,
}

impl WebhookProcessor {
    pub fn new(pool: PgPool, router: Arc<WebhookRouter>) -> Self {
        Self { pool, router }
    }

    /// Process a single persisted event by row id. Fire-and-forget safe: a
    /// handler failure is recorded on the row and logged, never propagated.
    pub async fn process_event(&self, record_id: Uuid) -> BillingResult<()> {
        let claimed: Option<(String, String, Value)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET processing_result = 'processing', processing_started_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND (processing_result = 'pending'
                   OR (processing_result = 'processing'
                       AND processing_started_at < NOW() - $2 * INTERVAL '1 minute'))
            RETURNING event_id, event_type, payload
            "#,
        )
        .bind(record_id)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        let Some((event_id, event_type, payload)) = claimed else {
            tracing::debug!(
                record_id = %record_id,
                "Webhook event already claimed or processed"
            );
            return Ok(());
        };

        self.run_claimed(record_id, &event_id, &event_type, &payload)
            .await;
        Ok(())
    }

    /// Sweep pending (and stuck) events, oldest first. Returns how many
    /// events were claimed in this pass.
    pub async fn process_pending(&self, limit: i64) -> BillingResult<usize> {
        let claimed: Vec<(Uuid, String, String, Value)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET processing_result = 'processing', processing_started_at = NOW(), updated_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE processing_result = 'pending'
                   OR (processing_result = 'processing'
                       AND processing_started_at < NOW() - $2 * INTERVAL '1 minute')
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, event_type, payload
            "#,
        )
        .bind(limit)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        let count = claimed.len();
        for (record_id, event_id, event_type, payload) in claimed {
            // One handler's failure must not stall the rest of the batch
            self.run_claimed(record_id, &event_id, &event_type, &payload)
                .await;
        }

        Ok(count)
    }

    async fn run_claimed(
        &self,
        record_id: Uuid,
        event_id: &str,
        event_type: &str,
        payload: &Value,
    ) {
        let (result, error_message) = match self.router.dispatch(event_type, payload).await {
            Ok(DispatchOutcome::Handled) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Webhook event processed"
                );
                ("success", None)
            }
            Ok(DispatchOutcome::Ignored) => ("ignored", None),
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                ("error", Some(e.to_string()))
            }
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(result)
        .bind(&error_message)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                record_id = %record_id,
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result; event may be re-processed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn valid_signature_verifies() {
        let secret = "test_webhook_secret";
        let timestamp = "2026-04-02T10:00:00Z";
        let event_id = "evt_0001";

        let signature = compute_signature(secret, timestamp, event_id);
        assert!(verify_signature(secret, timestamp, event_id, &signature));
    }

    #[test]
    fn wrong_signature_rejected_regardless_of_mismatch_position() {
        let secret = "test_webhook_secret";
        let timestamp = "2026-04-02T10:00:00Z";
        let event_id = "evt_0001";
        let good = compute_signature(secret, timestamp, event_id);

        // Flip one hex digit at every position; all must fail
        for i in 0..good.len() {
            let mut bad = good.clone().into_bytes();
            bad[i] = if bad[i] == b'0' { b'1' } else { b'0' };
            let bad = String::from_utf8(bad).unwrap();
            assert!(
                !verify_signature(secret, timestamp, event_id, &bad),
                "mismatch at position {} accepted",
                i
            );
        }
    }

    #[test]
    fn length_mismatched_signature_rejected() {
        let secret = "s";
        let good = compute_signature(secret, "t", "id");
        assert!(!verify_signature(secret, "t", "id", &good[..good.len() - 1]));
        assert!(!verify_signature(secret, "t", "id", &format!("{}0", good)));
        assert!(!verify_signature(secret, "t", "id", ""));
    }

    #[test]
    fn signature_binds_timestamp_and_id() {
        let secret = "s";
        let signature = compute_signature(secret, "t1", "evt_1");
        assert!(!verify_signature(secret, "t2", "evt_1", &signature));
        assert!(!verify_signature(secret, "t1", "evt_2", &signature));
        // Raw concatenation: moving the boundary must change the MAC
        assert!(!verify_signature(secret, "t", "1evt_1", &signature));
    }

    #[test]
    fn authenticate_skips_when_no_secret_configured() {
        let event = json!({"id": "evt_1", "event_type": "invoice_settled"});
        assert!(authenticate_event(None, &event).is_ok());
        assert!(authenticate_event(Some(""), &event).is_ok());
    }

    #[test]
    fn authenticate_fails_closed_on_missing_fields() {
        // Secret configured but no signature/timestamp present
        let event = json!({"id": "evt_1", "event_type": "invoice_settled"});
        assert!(matches!(
            authenticate_event(Some("secret"), &event),
            Err(BillingError::WebhookSignatureInvalid)
        ));

        let unsigned = json!({
            "id": "evt_1",
            "timestamp": "2026-04-02T10:00:00Z",
            "event_type": "invoice_settled"
        });
        assert!(authenticate_event(Some("secret"), &unsigned).is_err());
    }

    #[test]
    fn authenticate_accepts_valid_event() {
        let secret = "secret";
        let timestamp = "2026-04-02T10:00:00Z";
        let event_id = "evt_1";
        let event = json!({
            "id": event_id,
            "timestamp": timestamp,
            "signature": compute_signature(secret, timestamp, event_id),
            "event_type": "invoice_settled",
            "invoice": {"id": "ch_1"}
        });
        assert!(authenticate_event(Some(secret), &event).is_ok());

        let mut tampered = event.clone();
        tampered["signature"] = json!("deadbeef");
        assert!(authenticate_event(Some(secret), &tampered).is_err());
    }

    struct RecordingHandler {
        calls: AtomicUsize,
        last_event: Mutex<Option<Value>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_event: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn call(&self, event: &Value) -> BillingResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_event.lock().unwrap() = Some(event.clone());
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn call(&self, _event: &Value) -> BillingResult<()> {
            Err(BillingError::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let handler = RecordingHandler::new();
        let mut router = WebhookRouter::new();
        router.register("invoice_settled", handler.clone()).unwrap();

        let event = json!({
            "id": "evt_1",
            "event_type": "invoice_settled",
            "invoice": {
                "id": "ch_1",
                "amount": 1000,
                "currency": "USD",
                "state": "settled",
                "customer": "cust_1"
            }
        });
        let outcome = router.dispatch("invoice_settled", &event).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let seen = handler.last_event.lock().unwrap().clone().unwrap();
        assert_eq!(seen["invoice"]["amount"], 1000);
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored_not_an_error() {
        let router = WebhookRouter::new();
        let outcome = router
            .dispatch("some_future_event", &json!({"id": "evt_9"}))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut router = WebhookRouter::new();
        router
            .register("customer_deleted", RecordingHandler::new())
            .unwrap();

        let err = router
            .register("customer_deleted", RecordingHandler::new())
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateHandler(t) if t == "customer_deleted"));
        assert_eq!(router.handler_count(), 1);
    }

    #[tokio::test]
    async fn one_handler_failure_does_not_affect_siblings() {
        let recording = RecordingHandler::new();
        let mut router = WebhookRouter::new();
        router.register("bad_event", Arc::new(FailingHandler)).unwrap();
        router.register("good_event", recording.clone()).unwrap();

        assert!(router.dispatch("bad_event", &json!({})).await.is_err());

        let outcome = router.dispatch("good_event", &json!({})).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_trial_end_gets_will_end_notice() {
        let now = OffsetDateTime::now_utc();
        let ends_at = now + time::Duration::days(3);
        assert_eq!(
            trial_notification(Some(ends_at), now),
            Some(TrialNotice::WillEnd)
        );
    }

    #[test]
    fn past_trial_end_gets_ended_notice() {
        let now = OffsetDateTime::now_utc();
        let ends_at = now - time::Duration::hours(1);
        assert_eq!(
            trial_notification(Some(ends_at), now),
            Some(TrialNotice::Ended)
        );
        // Expiring exactly now counts as ended
        assert_eq!(trial_notification(Some(now), now), Some(TrialNotice::Ended));
    }

    #[test]
    fn subscription_without_trial_gets_no_notice() {
        assert_eq!(trial_notification(None, OffsetDateTime::now_utc()), None);
    }
}
