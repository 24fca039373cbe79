// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Frisbii Integration
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification
//! - Status mapping (charge, subscription, payment method type)
//! - Event dispatch
//! - Instrument descriptor extraction
//! - Payload field extraction

#[cfg(test)]
mod signature_tests {
    use crate::webhooks::{compute_signature, verify_signature};

    // =========================================================================
    // Unicode secrets and ids must round-trip
    // =========================================================================
    #[test]
    fn test_unicode_inputs_round_trip() {
        let secret = "hemmelighed-æøå";
        let timestamp = "2026-04-02T10:00:00.123+02:00";
        let event_id = "evt-βήτα";

        let signature = compute_signature(secret, timestamp, event_id);
        assert!(verify_signature(secret, timestamp, event_id, &signature));
    }

    // =========================================================================
    // Uppercase hex is not accepted; the gateway sends lowercase
    // =========================================================================
    #[test]
    fn test_uppercase_hex_rejected() {
        let secret = "secret";
        let signature = compute_signature(secret, "t", "evt_1");
        assert!(!verify_signature(secret, "t", "evt_1", &signature.to_uppercase()));
    }

    // =========================================================================
    // Empty event id is still signed deterministically
    // =========================================================================
    #[test]
    fn test_empty_event_id_signs_consistently() {
        let secret = "secret";
        let a = compute_signature(secret, "2026-01-01T00:00:00Z", "");
        let b = compute_signature(secret, "2026-01-01T00:00:00Z", "");
        assert_eq!(a, b);
        assert!(verify_signature(secret, "2026-01-01T00:00:00Z", "", &a));
    }

    // =========================================================================
    // Different secrets never validate each other's signatures
    // =========================================================================
    #[test]
    fn test_secret_mismatch_rejected() {
        let signature = compute_signature("secret_a", "t", "evt_1");
        assert!(!verify_signature("secret_b", "t", "evt_1", &signature));
    }

    // =========================================================================
    // Signature output is 64 lowercase hex chars (SHA-256)
    // =========================================================================
    #[test]
    fn test_signature_shape() {
        let signature = compute_signature("secret", "t", "evt_1");
        assert_eq!(signature.len(), 64);
        assert!(signature
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

#[cfg(test)]
mod status_mapping_tests {
    use crate::charge::{charge_status_from_state, payment_method_type_from_raw};
    use crate::subscription::subscription_status_from_state;

    // =========================================================================
    // Every documented charge state maps to its local status
    // =========================================================================
    #[test]
    fn test_charge_state_grid() {
        let cases = [
            ("created", "pending"),
            ("pending", "pending"),
            ("authorized", "requires_capture"),
            ("settled", "succeeded"),
            ("failed", "failed"),
            ("cancelled", "canceled"),
            ("canceled", "canceled"),
        ];
        for (state, expected) in cases {
            assert_eq!(charge_status_from_state(state), expected, "state {}", state);
        }
    }

    // =========================================================================
    // Unknown states pass through untouched rather than erroring
    // =========================================================================
    #[test]
    fn test_unknown_states_pass_through() {
        assert_eq!(charge_status_from_state("disputed"), "disputed");
        assert_eq!(subscription_status_from_state("frozen"), "frozen");
        assert_eq!(payment_method_type_from_raw("applepay"), "applepay");
    }

    // =========================================================================
    // Subscription state grid, including dunning and hold
    // =========================================================================
    #[test]
    fn test_subscription_state_grid() {
        let cases = [
            ("active", "active"),
            ("cancelled", "canceled"),
            ("canceled", "canceled"),
            ("expired", "canceled"),
            ("on_hold", "paused"),
            ("pending", "incomplete"),
            ("dunning", "past_due"),
            ("trial", "trialing"),
            ("trialing", "trialing"),
        ];
        for (state, expected) in cases {
            assert_eq!(
                subscription_status_from_state(state),
                expected,
                "state {}",
                state
            );
        }
    }

    // =========================================================================
    // Regional mobile payment schemes all normalize to one local type
    // =========================================================================
    #[test]
    fn test_mobile_scheme_normalization() {
        for raw in ["mobilepay", "vipps", "swish"] {
            assert_eq!(payment_method_type_from_raw(raw), "mobile_payment");
        }
    }

    // =========================================================================
    // Empty state string passes through as-is
    // =========================================================================
    #[test]
    fn test_empty_state_passes_through() {
        assert_eq!(charge_status_from_state(""), "");
        assert_eq!(subscription_status_from_state(""), "");
    }
}

#[cfg(test)]
mod dispatch_tests {
    use crate::error::BillingError;
    use crate::webhooks::{DispatchOutcome, EventHandler, WebhookRouter};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn call(&self, _event: &Value) -> crate::error::BillingResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // =========================================================================
    // Event type lookup is exact: no prefix or case-folded matching
    // =========================================================================
    #[tokio::test]
    async fn test_event_type_match_is_exact() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut router = WebhookRouter::new();
        router.register("invoice_settled", counter.clone()).unwrap();

        for wrong in ["invoice_settled_v2", "Invoice_Settled", "invoice", ""] {
            let outcome = router.dispatch(wrong, &json!({})).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Ignored, "matched {:?}", wrong);
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Replayed events reach the handler each time; idempotency lives in
    // the full-overwrite sync, not the router
    // =========================================================================
    #[tokio::test]
    async fn test_router_does_not_deduplicate() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut router = WebhookRouter::new();
        router.register("customer_updated", counter.clone()).unwrap();

        let event = json!({"id": "evt_1", "event_type": "customer_updated"});
        for _ in 0..3 {
            router.dispatch("customer_updated", &event).await.unwrap();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    // =========================================================================
    // Duplicate registration reports the conflicting event type
    // =========================================================================
    #[test]
    fn test_duplicate_registration_names_event_type() {
        let mut router = WebhookRouter::new();
        router
            .register("subscription_renewal", Arc::new(Counter(AtomicUsize::new(0))))
            .unwrap();

        match router.register("subscription_renewal", Arc::new(Counter(AtomicUsize::new(0)))) {
            Err(BillingError::DuplicateHandler(t)) => assert_eq!(t, "subscription_renewal"),
            other => panic!("expected DuplicateHandler, got {:?}", other.map(|_| ())),
        }
    }
}

#[cfg(test)]
mod instrument_tests {
    use crate::charge::{extract_instrument, last4_from_masked};
    use serde_json::json;

    // =========================================================================
    // Masked PANs with varied mask characters still yield the last 4 digits
    // =========================================================================
    #[test]
    fn test_last4_ignores_mask_characters() {
        assert_eq!(last4_from_masked("457111XXXXXX3742").as_deref(), Some("3742"));
        assert_eq!(last4_from_masked("4571-11**-****-9010").as_deref(), Some("9010"));
        assert_eq!(last4_from_masked("9010").as_deref(), Some("9010"));
    }

    // =========================================================================
    // Too few digits means no last4 rather than a short string
    // =========================================================================
    #[test]
    fn test_last4_requires_four_digits() {
        assert!(last4_from_masked("XXX12").is_none());
        assert!(last4_from_masked("").is_none());
        assert!(last4_from_masked("XXXX").is_none());
    }

    // =========================================================================
    // Charges without payment details leave descriptors empty
    // =========================================================================
    #[test]
    fn test_missing_payment_info_extracts_nothing() {
        let instrument = extract_instrument(&json!({"id": "ch_1", "amount": 100}));
        assert!(instrument.pm_type.is_none());
        assert!(instrument.brand.is_none());
        assert!(instrument.last4.is_none());
    }
}

#[cfg(test)]
mod field_extraction_tests {
    use crate::fields::{i64_field, str_field, ts_field};
    use serde_json::json;

    // =========================================================================
    // Null and wrong-typed fields read as absent, not as errors
    // =========================================================================
    #[test]
    fn test_null_and_mistyped_fields_are_absent() {
        let object = json!({"a": null, "b": 42, "c": "x", "d": ["y"]});
        assert!(str_field(&object, "a").is_none());
        assert!(str_field(&object, "b").is_none());
        assert!(str_field(&object, "d").is_none());
        assert!(i64_field(&object, "c").is_none());
        assert!(i64_field(&object, "missing").is_none());
    }

    // =========================================================================
    // Timestamps with offsets parse; garbage reads as absent
    // =========================================================================
    #[test]
    fn test_timestamp_parsing_edges() {
        let object = json!({
            "ok_z": "2026-04-02T10:00:00Z",
            "ok_offset": "2026-04-02T10:00:00.500+02:00",
            "bad": "next tuesday",
            "epoch_num": 1700000000
        });
        assert!(ts_field(&object, "ok_z").is_some());
        assert!(ts_field(&object, "ok_offset").is_some());
        assert!(ts_field(&object, "bad").is_none());
        assert!(ts_field(&object, "epoch_num").is_none());
    }
}
