//! Email provider callbacks.
//!
//! JSON body, SES-flavoured event names:
//! `{"message_id": "...", "status": "delivery", "timestamp": "...",
//!   "message_ref": "msg_...", "from": "..."}`.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::collections::ingest::CommunicationEvent;
use crate::db::{Channel, CommunicationStatus, Direction};

#[derive(Debug, Deserialize)]
struct EmailPayload {
    #[serde(alias = "messageId")]
    message_id: String,
    #[serde(alias = "eventType", alias = "notificationType")]
    status: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "messageRef")]
    message_ref: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Map provider vocabulary onto the domain enumeration.
pub(crate) fn normalize(raw: &str) -> (Direction, CommunicationStatus) {
    let status = match raw {
        "queued" => CommunicationStatus::Queued,
        "send" | "sent" | "deliverydelay" => CommunicationStatus::Sent,
        // A complaint proves the message reached the inbox.
        "delivery" | "delivered" | "complaint" => CommunicationStatus::Delivered,
        "open" | "opened" | "click" | "clicked" => CommunicationStatus::Opened,
        "bounce" | "bounced" | "reject" | "rejected" | "renderingfailure" | "failed" => {
            CommunicationStatus::Failed
        }
        "received" | "inbound" => return (Direction::Inbound, CommunicationStatus::Delivered),
        _ => CommunicationStatus::Unrecognized,
    };
    (Direction::Outbound, status)
}

pub(crate) fn parse(body: &[u8]) -> Result<CommunicationEvent, String> {
    let payload: EmailPayload = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let provider_message_id = payload.message_id.trim().to_string();
    if provider_message_id.is_empty() {
        return Err("message_id is empty".to_string());
    }
    let provider_status = payload.status.trim().to_ascii_lowercase();
    if provider_status.is_empty() {
        return Err("status is empty".to_string());
    }
    let (direction, status) = normalize(&provider_status);

    Ok(CommunicationEvent {
        channel: Channel::Email,
        direction,
        provider_message_id,
        message_ref: payload.message_ref.filter(|r| !r.trim().is_empty()),
        status,
        provider_status,
        counterpart: payload.from,
        detail: payload.detail,
        occurred_at: payload.timestamp.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::{normalize, parse};
    use crate::db::{CommunicationStatus, Direction};

    #[test]
    fn ses_vocabulary_normalizes() {
        assert_eq!(normalize("delivery").1, CommunicationStatus::Delivered);
        assert_eq!(normalize("click").1, CommunicationStatus::Opened);
        assert_eq!(normalize("bounce").1, CommunicationStatus::Failed);
        assert_eq!(normalize("subscription").1, CommunicationStatus::Unrecognized);
        assert_eq!(normalize("received").0, Direction::Inbound);
    }

    #[test]
    fn parse_accepts_minimal_payload() {
        let event = parse(br#"{"message_id":"m1","status":"Delivered"}"#).expect("parse");
        assert_eq!(event.provider_message_id, "m1");
        assert_eq!(event.provider_status, "delivered");
        assert_eq!(event.status, CommunicationStatus::Delivered);
        assert_eq!(event.direction, Direction::Outbound);
        assert!(event.message_ref.is_none());
    }

    #[test]
    fn parse_accepts_ses_field_names() {
        let event = parse(
            br#"{"messageId":"0100-abc","eventType":"Open","timestamp":"2026-04-01T10:00:00Z","messageRef":"msg_1"}"#,
        )
        .expect("parse");
        assert_eq!(event.status, CommunicationStatus::Opened);
        assert_eq!(event.message_ref.as_deref(), Some("msg_1"));
        assert_eq!(event.occurred_at.to_rfc3339(), "2026-04-01T10:00:00+00:00");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse(br#"{"status":"delivery"}"#).is_err());
        assert!(parse(br#"{"message_id":" ","status":"delivery"}"#).is_err());
        assert!(parse(b"not json").is_err());
    }
}
