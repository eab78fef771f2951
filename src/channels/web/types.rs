//! Request and response DTOs for the gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collections::status::{DebtorStatus, StatusSnapshot};
use crate::db::{DebtorRecord, UpdateDebtorParams};

// --- Debtors ---

#[derive(Debug, Deserialize)]
pub struct CreateDebtorRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateDebtorResponse {
    pub debtor: DebtorRecord,
    pub token: String,
    pub page_url: String,
}

/// Contact patch. An empty string clears `email` or `phone`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateDebtorRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl UpdateDebtorRequest {
    pub fn into_params(self) -> UpdateDebtorParams {
        let clearable = |value: Option<String>| {
            value.map(|v| {
                let v = v.trim().to_string();
                (!v.is_empty()).then_some(v)
            })
        };
        UpdateDebtorParams {
            first_name: self.first_name,
            last_name: self.last_name,
            email: clearable(self.email),
            phone: clearable(self.phone),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DebtorResponse {
    pub debtor: DebtorRecord,
    pub status: StatusSnapshot,
}

#[derive(Debug, Serialize)]
pub struct RotateTokenResponse {
    pub debtor_id: Uuid,
    pub token: String,
}

// --- Outbound ---

#[derive(Debug, Deserialize)]
pub struct SendEmailRequest {
    pub debtor_id: Uuid,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    pub debtor_id: Uuid,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct OutboundCallRequest {
    pub debtor_id: Uuid,
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentLinkRequest {
    pub debtor_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub older_than_minutes: Option<i64>,
}

// --- Debtor pages ---

#[derive(Debug, Serialize)]
pub struct PageResponse {
    pub page: &'static str,
    pub first_name: String,
    pub status: DebtorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_engagement_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PageViewRequest {
    pub token: String,
    pub path: String,
    #[serde(default)]
    pub event: Option<String>,
}

// --- Webhooks ---

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::UpdateDebtorRequest;

    #[test]
    fn empty_contact_fields_clear_and_absent_fields_keep() {
        let params = UpdateDebtorRequest {
            email: Some("  ".into()),
            phone: Some("+15550100".into()),
            ..Default::default()
        }
        .into_params();
        assert_eq!(params.email, Some(None));
        assert_eq!(params.phone, Some(Some("+15550100".into())));
        assert_eq!(params.first_name, None);
    }
}
