//! Inbound Frisbii webhook endpoint
//!
//! Acknowledges fast: the event is verified and persisted inside the request,
//! then processed on a detached task. The gateway retries on non-2xx, so a
//! 500 here (for example, a database outage) gets the event redelivered.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;

use payhook_billing::BillingError;

use crate::state::AppState;

pub async fn receive_frisbii_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> StatusCode {
    let received = match state.billing.receiver.receive(&body).await {
        Ok(received) => received,
        Err(e) => {
            let status = rejection_status(&e);
            tracing::warn!(error = %e, status = %status, "Rejected inbound webhook");
            return status;
        }
    };

    // Redeliveries come back with no record id; nothing left to do for those
    if let Some(record_id) = received.record_id {
        let processor = state.billing.processor.clone();
        tokio::spawn(async move {
            if let Err(e) = processor.process_event(record_id).await {
                tracing::error!(
                    record_id = %record_id,
                    error = %e,
                    "Webhook processing task failed; worker sweep will retry"
                );
            }
        });
    }

    StatusCode::OK
}

/// Map intake failures to response codes: the caller's fault is a 400,
/// ours is a 500.
fn rejection_status(error: &BillingError) -> StatusCode {
    match error {
        BillingError::MalformedPayload(_) | BillingError::WebhookSignatureInvalid => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_get_400() {
        assert_eq!(
            rejection_status(&BillingError::MalformedPayload("bad json".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            rejection_status(&BillingError::WebhookSignatureInvalid),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn server_errors_get_500() {
        assert_eq!(
            rejection_status(&BillingError::Internal("broken".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            rejection_status(&BillingError::Config("missing".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
