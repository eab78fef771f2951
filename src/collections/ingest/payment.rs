//! Payment processor callbacks.
//!
//! Two body shapes are accepted. Stripe-style events carry the payment object
//! under `data.object` with amounts in minor units and correlation hints in
//! `metadata`, scaled by the currency's ISO 4217 exponent. The flat processor-neutral shape is
//! `{"payment_id", "status", "link_ref"?, "debtor_id"?, "amount"?, "currency"?}`
//! with a major-unit decimal amount.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::collections::currency::from_minor_units;
use crate::collections::ingest::PaymentEvent;
use crate::db::PaymentStatus;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PaymentPayload {
    Stripe(StripeEvent),
    Flat(FlatPayment),
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created: Option<i64>,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeObject,
}

#[derive(Debug, Deserialize)]
struct StripeObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FlatPayment {
    payment_id: String,
    status: String,
    #[serde(default)]
    link_ref: Option<String>,
    #[serde(default)]
    debtor_id: Option<Uuid>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Status carried by the payment object itself.
pub(crate) fn normalize_object_status(raw: &str) -> PaymentStatus {
    match raw {
        "created" | "requires_payment_method" | "requires_confirmation" | "open" => {
            PaymentStatus::Created
        }
        "pending" | "processing" | "requires_action" | "requires_capture" | "unpaid" => {
            PaymentStatus::Pending
        }
        "succeeded" | "paid" | "complete" => PaymentStatus::Succeeded,
        "failed" | "canceled" | "cancelled" | "expired" => PaymentStatus::Failed,
        "refunded" => PaymentStatus::Refunded,
        _ => PaymentStatus::Unrecognized,
    }
}

/// Status implied by a Stripe event type, falling back to the object status.
pub(crate) fn normalize_event(kind: &str, object_status: Option<&str>) -> PaymentStatus {
    match kind {
        "payment_intent.created" => PaymentStatus::Created,
        "payment_intent.processing" | "payment_intent.requires_action" => PaymentStatus::Pending,
        "checkout.session.completed"
        | "checkout.session.async_payment_succeeded"
        | "payment_intent.succeeded"
        | "charge.succeeded" => PaymentStatus::Succeeded,
        "payment_intent.payment_failed"
        | "payment_intent.canceled"
        | "checkout.session.async_payment_failed"
        | "checkout.session.expired"
        | "charge.failed" => PaymentStatus::Failed,
        "charge.refunded" => PaymentStatus::Refunded,
        _ => object_status
            .map(normalize_object_status)
            .unwrap_or(PaymentStatus::Unrecognized),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `default_currency` scales Stripe minor-unit amounts that arrive without a currency.
pub(crate) fn parse(body: &[u8], default_currency: &str) -> Result<PaymentEvent, String> {
    let payload: PaymentPayload = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let event = match payload {
        PaymentPayload::Stripe(event) => {
            let mut object = event.data.object;
            let provider_status = event.kind.trim().to_ascii_lowercase();
            let status = normalize_event(&provider_status, object.status.as_deref());
            let provider_payment_id = non_empty(object.payment_intent.take())
                .unwrap_or_else(|| object.id.trim().to_string());
            let debtor_hint = object
                .metadata
                .get("debtor_id")
                .and_then(|raw| Uuid::parse_str(raw.trim()).ok());
            let link_ref = non_empty(object.metadata.remove("link_ref"))
                .or_else(|| non_empty(object.client_reference_id.take()));
            let currency = non_empty(object.currency).map(|c| c.to_ascii_lowercase());
            PaymentEvent {
                provider_payment_id,
                link_ref,
                debtor_hint,
                amount: object.amount_total.or(object.amount).map(|minor| {
                    from_minor_units(minor, currency.as_deref().unwrap_or(default_currency))
                }),
                currency,
                status,
                provider_status,
                occurred_at: event
                    .created
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .unwrap_or_else(Utc::now),
            }
        }
        PaymentPayload::Flat(flat) => {
            let provider_status = flat.status.trim().to_ascii_lowercase();
            PaymentEvent {
                provider_payment_id: flat.payment_id.trim().to_string(),
                link_ref: non_empty(flat.link_ref),
                debtor_hint: flat.debtor_id,
                amount: flat.amount,
                currency: non_empty(flat.currency).map(|c| c.to_ascii_lowercase()),
                status: normalize_object_status(&provider_status),
                provider_status,
                occurred_at: flat.timestamp.unwrap_or_else(Utc::now),
            }
        }
    };

    if event.provider_payment_id.is_empty() {
        return Err("payment id is empty".to_string());
    }
    if event.provider_status.is_empty() {
        return Err("status is empty".to_string());
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{normalize_event, parse};
    use crate::db::PaymentStatus;

    #[test]
    fn stripe_event_types_take_precedence_over_object_status() {
        assert_eq!(
            normalize_event("charge.refunded", Some("succeeded")),
            PaymentStatus::Refunded
        );
        assert_eq!(
            normalize_event("checkout.session.completed", Some("complete")),
            PaymentStatus::Succeeded
        );
        assert_eq!(
            normalize_event("payment_intent.amount_capturable_updated", Some("processing")),
            PaymentStatus::Pending
        );
        assert_eq!(
            normalize_event("customer.created", None),
            PaymentStatus::Unrecognized
        );
    }

    #[test]
    fn stripe_checkout_session_is_correlated_by_metadata() {
        let body = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1767225600,
            "data": {"object": {
                "id": "cs_test_1",
                "payment_intent": "pi_42",
                "amount_total": 12550,
                "currency": "USD",
                "metadata": {"link_ref": "pl_abc", "debtor_id": "not-a-uuid"}
            }}
        }"#;
        let event = parse(body, "usd").expect("parse");
        assert_eq!(event.provider_payment_id, "pi_42");
        assert_eq!(event.link_ref.as_deref(), Some("pl_abc"));
        assert_eq!(event.debtor_hint, None);
        assert_eq!(event.amount, Some(dec!(125.50)));
        assert_eq!(event.currency.as_deref(), Some("usd"));
        assert_eq!(event.status, PaymentStatus::Succeeded);
        assert_eq!(event.provider_status, "checkout.session.completed");
        assert_eq!(event.occurred_at.timestamp(), 1_767_225_600);
    }

    #[test]
    fn stripe_amounts_use_the_currency_exponent() {
        let jpy = br#"{
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_jp", "amount": 5000, "currency": "jpy"}}
        }"#;
        let event = parse(jpy, "usd").expect("parse");
        assert_eq!(event.amount, Some(dec!(5000)));
        assert_eq!(event.currency.as_deref(), Some("jpy"));

        let bare = br#"{
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_kw", "amount": 1250}}
        }"#;
        assert_eq!(parse(bare, "kwd").expect("parse").amount, Some(dec!(1.250)));
        assert_eq!(parse(bare, "usd").expect("parse").amount, Some(dec!(12.50)));
    }

    #[test]
    fn flat_shape_is_accepted() {
        let body =
            br#"{"payment_id":"pay_9","link_ref":"pl_1","status":"succeeded","amount":"50.00"}"#;
        let event = parse(body, "usd").expect("parse");
        assert_eq!(event.provider_payment_id, "pay_9");
        assert_eq!(event.link_ref.as_deref(), Some("pl_1"));
        assert_eq!(event.status, PaymentStatus::Succeeded);
        assert_eq!(event.amount, Some(dec!(50.00)));
    }

    #[test]
    fn unknown_statuses_do_not_fail_parsing() {
        let event = parse(br#"{"payment_id":"pay_1","status":"disputed"}"#, "usd").expect("parse");
        assert_eq!(event.status, PaymentStatus::Unrecognized);
        assert!(parse(br#"{"payment_id":"","status":"succeeded"}"#, "usd").is_err());
        assert!(parse(br#"{"status":"succeeded"}"#, "usd").is_err());
    }
}
