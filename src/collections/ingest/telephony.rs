//! Telephony provider callbacks (Twilio-style form posts).
//!
//! Voice callbacks carry `CallSid`/`CallStatus`, SMS callbacks carry
//! `MessageSid`/`MessageStatus` (older accounts send `SmsSid`/`SmsStatus`).
//! The outbound intent ref travels in the callback URL as `?ref=msg_...`.

use chrono::{DateTime, Utc};

use crate::collections::ingest::CommunicationEvent;
use crate::db::{Channel, CommunicationStatus, Direction};

pub(crate) fn form_params(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

pub(crate) fn normalize(raw: &str) -> CommunicationStatus {
    match raw {
        "queued" | "initiated" | "accepted" | "scheduled" => CommunicationStatus::Queued,
        "ringing" | "sending" | "sent" => CommunicationStatus::Sent,
        "in-progress" | "answered" | "completed" | "delivered" | "received" => {
            CommunicationStatus::Delivered
        }
        "read" => CommunicationStatus::Opened,
        "busy" | "failed" | "no-answer" | "canceled" | "undelivered" => CommunicationStatus::Failed,
        _ => CommunicationStatus::Unrecognized,
    }
}

/// Build an event from the callback form and the `ref` query parameter, if any.
pub(crate) fn parse(
    params: &[(String, String)],
    message_ref: Option<String>,
) -> Result<CommunicationEvent, String> {
    let (channel, provider_message_id, raw_status) = if let Some(sid) = param(params, "MessageSid")
        .or_else(|| param(params, "SmsSid"))
    {
        let status = param(params, "MessageStatus")
            .or_else(|| param(params, "SmsStatus"))
            .ok_or("MessageStatus is missing")?;
        (Channel::Sms, sid, status)
    } else if let Some(sid) = param(params, "CallSid") {
        let status = param(params, "CallStatus").ok_or("CallStatus is missing")?;
        (Channel::Voice, sid, status)
    } else {
        return Err("neither MessageSid nor CallSid present".to_string());
    };

    let provider_status = raw_status.to_ascii_lowercase();
    let inbound = provider_status == "received"
        || param(params, "Direction").is_some_and(|d| d.eq_ignore_ascii_case("inbound"));
    let direction = if inbound {
        Direction::Inbound
    } else {
        Direction::Outbound
    };
    // Inbound events identify the debtor by the number they called or texted from.
    let counterpart = if inbound {
        param(params, "From")
    } else {
        param(params, "To")
    };
    let occurred_at = param(params, "Timestamp")
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(CommunicationEvent {
        channel,
        direction,
        provider_message_id: provider_message_id.to_string(),
        message_ref,
        status: normalize(&provider_status),
        provider_status,
        counterpart: counterpart.map(str::to_string),
        detail: param(params, "ErrorCode").map(|code| format!("error_code={code}")),
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::{form_params, normalize, parse};
    use crate::db::{Channel, CommunicationStatus, Direction};

    #[test]
    fn call_and_message_vocabulary() {
        assert_eq!(normalize("no-answer"), CommunicationStatus::Failed);
        assert_eq!(normalize("completed"), CommunicationStatus::Delivered);
        assert_eq!(normalize("read"), CommunicationStatus::Opened);
        assert_eq!(normalize("initiated"), CommunicationStatus::Queued);
        assert_eq!(normalize("partially-delivered"), CommunicationStatus::Unrecognized);
    }

    #[test]
    fn sms_status_callback() {
        let params = form_params(b"MessageSid=SM123&MessageStatus=undelivered&To=%2B15550100&ErrorCode=30003");
        let event = parse(&params, Some("msg_1".into())).expect("parse");
        assert_eq!(event.channel, Channel::Sms);
        assert_eq!(event.provider_message_id, "SM123");
        assert_eq!(event.status, CommunicationStatus::Failed);
        assert_eq!(event.direction, Direction::Outbound);
        assert_eq!(event.counterpart.as_deref(), Some("+15550100"));
        assert_eq!(event.detail.as_deref(), Some("error_code=30003"));
        assert_eq!(event.message_ref.as_deref(), Some("msg_1"));
    }

    #[test]
    fn inbound_sms_uses_sender_number() {
        let params = form_params(b"SmsSid=SM9&SmsStatus=received&From=%2B15550199&To=%2B15550000");
        let event = parse(&params, None).expect("parse");
        assert_eq!(event.direction, Direction::Inbound);
        assert_eq!(event.counterpart.as_deref(), Some("+15550199"));
    }

    #[test]
    fn voice_callback_requires_status() {
        let params = form_params(b"CallSid=CA1&CallStatus=busy");
        let event = parse(&params, None).expect("parse");
        assert_eq!(event.channel, Channel::Voice);
        assert_eq!(event.status, CommunicationStatus::Failed);

        assert!(parse(&form_params(b"CallSid=CA1"), None).is_err());
        assert!(parse(&form_params(b"AccountSid=AC1"), None).is_err());
    }
}
