//! Billing notification emails
//!
//! Webhook handlers fire templated notifications (receipts, refunds, payment
//! failures, subscription lifecycle) through here. Delivery is an enqueue-style
//! POST to an external mailer service; failures are the caller's to log and
//! must never fail webhook processing.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Mailer service endpoint. When absent, notifications are log-only.
    pub mailer_url: Option<String>,
    /// Enabled template names; `None` means all templates are enabled.
    pub enabled_templates: Option<HashSet<String>>,
}

impl EmailConfig {
    /// `BILLING_EMAILS` is `all` (default), `none`, or a comma-separated
    /// template list, e.g. `receipt,refund,payment_failed`.
    pub fn from_env() -> Self {
        let enabled_templates = match std::env::var("BILLING_EMAILS").as_deref() {
            Ok("none") => Some(HashSet::new()),
            Ok("all") | Err(_) => None,
            Ok(list) => Some(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        };

        Self {
            mailer_url: std::env::var("MAILER_URL").ok().filter(|s| !s.is_empty()),
            enabled_templates,
        }
    }
}

/// Billing email service
#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: Arc<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Whether a template is enabled by configuration
    pub fn is_enabled(&self, template: &str) -> bool {
        match &self.config.enabled_templates {
            None => true,
            Some(set) => set.contains(template),
        }
    }

    pub async fn send_receipt(
        &self,
        to: &str,
        charge_id: &str,
        amount: i64,
        currency: &str,
    ) -> BillingResult<()> {
        self.deliver(
            "receipt",
            to,
            json!({ "charge_id": charge_id, "amount": amount, "currency": currency }),
        )
        .await
    }

    pub async fn send_refund(
        &self,
        to: &str,
        charge_id: &str,
        amount_refunded: i64,
        currency: &str,
    ) -> BillingResult<()> {
        self.deliver(
            "refund",
            to,
            json!({
                "charge_id": charge_id,
                "amount_refunded": amount_refunded,
                "currency": currency,
            }),
        )
        .await
    }

    pub async fn send_payment_failed(&self, to: &str, subscription_id: &str) -> BillingResult<()> {
        self.deliver(
            "payment_failed",
            to,
            json!({ "subscription_id": subscription_id }),
        )
        .await
    }

    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        subscription_id: &str,
        ends_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let ends_at = ends_at.and_then(|t| t.format(&Rfc3339).ok());
        self.deliver(
            "subscription_canceled",
            to,
            json!({ "subscription_id": subscription_id, "ends_at": ends_at }),
        )
        .await
    }

    pub async fn send_subscription_renewing(
        &self,
        to: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        self.deliver(
            "subscription_renewing",
            to,
            json!({ "subscription_id": subscription_id }),
        )
        .await
    }

    pub async fn send_trial_will_end(&self, to: &str, subscription_id: &str) -> BillingResult<()> {
        self.deliver(
            "subscription_trial_will_end",
            to,
            json!({ "subscription_id": subscription_id }),
        )
        .await
    }

    pub async fn send_trial_ended(&self, to: &str, subscription_id: &str) -> BillingResult<()> {
        self.deliver(
            "subscription_trial_ended",
            to,
            json!({ "subscription_id": subscription_id }),
        )
        .await
    }

    async fn deliver(&self, template: &str, to: &str, params: Value) -> BillingResult<()> {
        if !self.is_enabled(template) {
            tracing::debug!(template = %template, "Billing email disabled, skipping");
            return Ok(());
        }

        let Some(url) = &self.config.mailer_url else {
            tracing::info!(template = %template, to = %to, "No mailer configured, logging only");
            return Ok(());
        };

        let response = self
            .http
            .post(url)
            .json(&json!({ "template": template, "to": to, "params": params }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "mailer rejected {} notification: http {}",
                template,
                response.status()
            )));
        }

        tracing::info!(template = %template, to = %to, "Billing email enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_templates_enabled_by_default() {
        let service = BillingEmailService::new(EmailConfig {
            mailer_url: None,
            enabled_templates: None,
        });
        assert!(service.is_enabled("receipt"));
        assert!(service.is_enabled("subscription_canceled"));
    }

    #[test]
    fn template_list_restricts_delivery() {
        let service = BillingEmailService::new(EmailConfig {
            mailer_url: None,
            enabled_templates: Some(["receipt".to_string()].into_iter().collect()),
        });
        assert!(service.is_enabled("receipt"));
        assert!(!service.is_enabled("refund"));
    }

    #[tokio::test]
    async fn disabled_template_is_a_noop() {
        let service = BillingEmailService::new(EmailConfig {
            mailer_url: Some("http://mailer.invalid".to_string()),
            enabled_templates: Some(HashSet::new()),
        });
        // Would fail on the unreachable mailer if delivery were attempted
        service
            .send_receipt("a@b.c", "ch_1", 1000, "USD")
            .await
            .unwrap();
    }
}
