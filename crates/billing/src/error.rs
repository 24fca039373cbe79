//! Error types for the billing crate.

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the Frisbii integration.
///
/// Gateway-side failures keep the HTTP status and any structured error code
/// Frisbii returned in the response body, so callers can distinguish a
/// declined charge from a transport blip.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Non-2xx response from the Frisbii API
    #[error("frisbii api error (http {status}): {message}")]
    Api {
        status: u16,
        /// Structured error code from the response body, when present
        code: Option<String>,
        message: String,
    },

    /// Network-level failure talking to the gateway
    #[error("frisbii transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Inbound webhook body was not valid JSON, or required fields were missing
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Webhook signature did not match (or was absent while a secret is configured)
    #[error("invalid webhook signature")]
    WebhookSignatureInvalid,

    /// Two handlers were registered for the same event type
    #[error("duplicate webhook handler registered for event type {0}")]
    DuplicateHandler(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a sync-layer retry is worth attempting.
    ///
    /// Only transient remote failures qualify: transport errors and 5xx
    /// responses. Client errors (4xx), signature failures, and local logic
    /// errors fail fast.
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Transport(_) => true,
            BillingError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_5xx_are_transient() {
        let err = BillingError::Api {
            status: 503,
            code: None,
            message: "service unavailable".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = BillingError::Api {
            status: 402,
            code: Some("credit_card_declined".to_string()),
            message: "declined".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::MalformedPayload("nope".to_string()).is_transient());
    }
}
