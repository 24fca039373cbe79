// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some gateway operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Frisbii payment integration
//!
//! Keeps a local Postgres mirror of Frisbii billing entities and drives the
//! gateway API on behalf of the application.
//!
//! ## Features
//!
//! - **Entity Sync**: Full-overwrite mirroring of customers, charges,
//!   subscriptions, payment methods, and merchant accounts
//! - **Gateway Client**: Authenticated JSON client for the Frisbii API
//! - **Webhooks**: Signed event intake, durable persistence, and per-event-type
//!   dispatch with async processing
//! - **Email Notifications**: Receipts, refunds, payment failures, and
//!   subscription lifecycle notices

pub mod charge;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
mod fields;
pub mod merchant;
pub mod payment_method;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{FrisbiiClient, FrisbiiConfig};

// Error
pub use error::{BillingError, BillingResult};

// Customer
pub use customer::{CreateCustomerParams, CustomerRecord, CustomerService};

// Charge
pub use charge::{ChargeParams, ChargeRecord, ChargeService};

// Subscription
pub use subscription::{
    ChangeTiming, SubscribeParams, SubscriptionRecord, SubscriptionService,
};

// Payment method
pub use payment_method::{PaymentMethodRecord, PaymentMethodService};

// Merchant
pub use merchant::{MerchantRecord, MerchantService};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Webhooks
pub use webhooks::{
    default_router, verify_signature, DispatchOutcome, EventHandler, HandlerContext,
    ReceivedEvent, WebhookEventRecord, WebhookProcessor, WebhookReceiver, WebhookRouter,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub customers: CustomerService,
    pub charges: ChargeService,
    pub subscriptions: SubscriptionService,
    pub payment_methods: PaymentMethodService,
    pub merchants: MerchantService,
    pub email: BillingEmailService,
    pub receiver: WebhookReceiver,
    pub processor: WebhookProcessor,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(FrisbiiConfig::from_env()?, pool)
    }

    /// Create a new billing service with explicit config
    pub fn new(config: FrisbiiConfig, pool: PgPool) -> BillingResult<Self> {
        let client = FrisbiiClient::new(config.clone());
        let email_service = BillingEmailService::from_env();

        let receiver = WebhookReceiver::new(&config, pool.clone());
        let router = default_router(HandlerContext::new(
            client.clone(),
            pool.clone(),
            email_service.clone(),
        ))?;
        let processor = WebhookProcessor::new(pool.clone(), Arc::new(router));

        Ok(Self {
            customers: CustomerService::new(client.clone(), pool.clone()),
            charges: ChargeService::new(client.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(client.clone(), pool.clone()),
            payment_methods: PaymentMethodService::new(client.clone(), pool.clone()),
            merchants: MerchantService::new(client, pool),
            email: email_service,
            receiver,
            processor,
        })
    }
}
