//! Frisbii API client
//!
//! Thin authenticated wrapper over the Frisbii REST API. Frisbii uses basic
//! auth with the private API key as the username and an empty password, JSON
//! bodies on mutating verbs, and returns JSON everywhere. No retry or rate
//! limiting here; that belongs to the sync layer.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;

use crate::error::{BillingError, BillingResult};

/// Configuration for the Frisbii client and webhook verifier.
///
/// Built explicitly and passed at construction time; `from_env` is the
/// process-wide convenience constructor.
#[derive(Debug, Clone)]
pub struct FrisbiiConfig {
    /// API endpoint, e.g. `https://api.frisbii.com`
    pub api_base_url: String,
    /// API version path segment (Frisbii uses `v1`)
    pub api_version: String,
    /// Private API key
    pub private_key: String,
    /// Webhook signing secret. When absent, webhook signature verification
    /// is skipped (logged as a degraded-security condition).
    pub webhook_secret: Option<String>,
}

impl FrisbiiConfig {
    pub fn from_env() -> BillingResult<Self> {
        let private_key = std::env::var("FRISBII_PRIVATE_KEY")
            .map_err(|_| BillingError::Config("FRISBII_PRIVATE_KEY must be set".to_string()))?;

        let webhook_secret = std::env::var("FRISBII_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            api_base_url: std::env::var("FRISBII_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.frisbii.com".to_string()),
            api_version: std::env::var("FRISBII_API_VERSION").unwrap_or_else(|_| "v1".to_string()),
            private_key,
            webhook_secret,
        })
    }
}

/// Authenticated HTTP client for the Frisbii API
#[derive(Clone)]
pub struct FrisbiiClient {
    http: reqwest::Client,
    config: Arc<FrisbiiConfig>,
}

impl FrisbiiClient {
    pub fn new(config: FrisbiiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(FrisbiiConfig::from_env()?))
    }

    pub fn config(&self) -> &FrisbiiConfig {
        &self.config
    }

    /// Make a request against the Frisbii API.
    ///
    /// `path` is relative to the versioned root, e.g. `/charge/ch_123`.
    /// Non-2xx responses become [`BillingError::Api`] with any structured
    /// error code extracted from the body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&Value>,
    ) -> BillingResult<Value> {
        let url = format!(
            "{}/{}{}",
            self.config.api_base_url, self.config.api_version, path
        );

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.config.private_key, Some(""));

        if let Some(body) = params {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Self::api_error(status.as_u16(), &body));
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| {
            BillingError::Internal(format!("invalid JSON from {} {}: {}", method, path, e))
        })
    }

    pub async fn get(&self, path: &str) -> BillingResult<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, params: &Value) -> BillingResult<Value> {
        self.request(Method::POST, path, Some(params)).await
    }

    pub async fn put(&self, path: &str, params: &Value) -> BillingResult<Value> {
        self.request(Method::PUT, path, Some(params)).await
    }

    pub async fn delete(&self, path: &str) -> BillingResult<Value> {
        self.request(Method::DELETE, path, None).await
    }

    /// Build an [`BillingError::Api`] from a non-2xx response body.
    ///
    /// Frisbii error bodies carry `error`/`message` text and an
    /// `error_code`/`code` field; all are optional in practice.
    fn api_error(status: u16, body: &str) -> BillingError {
        let parsed: Option<Value> = serde_json::from_str(body).ok();

        let message = parsed
            .as_ref()
            .and_then(|v| {
                v.get("error_message")
                    .or_else(|| v.get("error"))
                    .or_else(|| v.get("message"))
            })
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if body.is_empty() {
                    format!("http {}", status)
                } else {
                    body.chars().take(200).collect()
                }
            });

        let code = parsed
            .as_ref()
            .and_then(|v| v.get("error_code").or_else(|| v.get("code")))
            .and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        BillingError::Api {
            status,
            code,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_extracts_structured_code_and_message() {
        let body = r#"{"error": "Customer not found", "error_code": 404, "code": "not_found"}"#;
        match FrisbiiClient::api_error(404, body) {
            BillingError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 404);
                assert_eq!(code.as_deref(), Some("404"));
                assert_eq!(message, "Customer not found");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn api_error_tolerates_unparseable_body() {
        match FrisbiiClient::api_error(502, "<html>Bad Gateway</html>") {
            BillingError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 502);
                assert!(code.is_none());
                assert!(message.contains("Bad Gateway"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn api_error_with_empty_body_reports_status() {
        match FrisbiiClient::api_error(500, "") {
            BillingError::Api { message, .. } => assert_eq!(message, "http 500"),
            other => panic!("expected Api error, got {:?}", other),
        }
    }
}
