//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. The libSQL backend (embedded file, or a remote replica of a Turso
//! database) lives behind the default `libsql` feature.
//!
//! Ledger tables are append-only. Dedup keys are enforced by UNIQUE constraints
//! in the schema, and callers learn whether a row was new or already present via
//! [`InsertOutcome`].

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret as _;

            let default_path = crate::config::default_libsql_path();
            let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);

            let backend = if let Some(ref url) = config.libsql_url {
                let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                    DatabaseError::Pool(
                        "LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string(),
                    )
                })?;
                libsql::LibSqlBackend::new_remote_replica(db_path, url, token.expose_secret())
                    .await?
            } else {
                libsql::LibSqlBackend::new_local(db_path).await?
            };
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        _ => Err(DatabaseError::Pool(
            "No database backend available. Enable the 'libsql' feature.".to_string(),
        )),
    }
}

/// Communication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Voice,
    Sms,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Voice => "voice",
            Self::Sms => "sms",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "email" => Some(Self::Email),
            "voice" => Some(Self::Voice),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "outbound" => Some(Self::Outbound),
            "inbound" => Some(Self::Inbound),
            _ => None,
        }
    }
}

/// Normalized delivery status of one communication event.
///
/// `Unrecognized` is the catch-all for provider vocabulary this service does not
/// know yet; the raw value is kept in `provider_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    Queued,
    Sent,
    Delivered,
    Opened,
    Failed,
    Unrecognized,
}

impl CommunicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Failed => "failed",
            Self::Unrecognized => "unrecognized",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "opened" => Some(Self::Opened),
            "failed" => Some(Self::Failed),
            "unrecognized" => Some(Self::Unrecognized),
            _ => None,
        }
    }
}

/// Normalized status of one payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Pending,
    Succeeded,
    Failed,
    Refunded,
    Unrecognized,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Unrecognized => "unrecognized",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            "unrecognized" => Some(Self::Unrecognized),
            _ => None,
        }
    }
}

/// Result of an insert guarded by a unique dedup key.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// The key already existed; carries the stored row, unchanged.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn record(&self) -> &T {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtorRecord {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateDebtorParams {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Contact-field patch. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct UpdateDebtorParams {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct AccessTokenRecord {
    pub debtor_id: Uuid,
    pub token_hash: String,
    /// Token encrypted under the service's sealing key; never the plaintext.
    pub sealed_token: String,
    pub issued_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Token row to insert. The plaintext never reaches storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccessToken {
    pub token_hash: String,
    pub sealed_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationRecord {
    pub id: Uuid,
    /// Global ledger insertion order.
    pub seq: i64,
    pub debtor_id: Uuid,
    pub channel: Channel,
    pub direction: Direction,
    pub provider_message_id: String,
    /// Internal correlation id of the outbound intent, when known.
    pub message_ref: Option<String>,
    pub status: CommunicationStatus,
    /// Raw provider vocabulary (or an internal marker for dispatcher rows).
    pub provider_status: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCommunication {
    pub debtor_id: Uuid,
    pub channel: Channel,
    pub direction: Direction,
    pub provider_message_id: String,
    pub message_ref: Option<String>,
    pub status: CommunicationStatus,
    pub provider_status: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub seq: i64,
    pub debtor_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub payment_link_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_status: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub debtor_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub payment_link_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_status: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageViewRecord {
    pub id: Uuid,
    pub seq: i64,
    pub debtor_id: Uuid,
    pub token: String,
    pub path: String,
    pub event: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPageView {
    pub debtor_id: Uuid,
    pub token: String,
    pub path: String,
    pub event: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Outbound message registered before the provider is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationIntentRecord {
    pub message_ref: String,
    pub debtor_id: Uuid,
    pub channel: Channel,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pre-payment intent registered before the payment processor is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLinkRecord {
    pub id: String,
    pub debtor_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub provider_link_id: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentLink {
    pub id: String,
    pub debtor_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

#[async_trait]
pub trait DebtorStore: Send + Sync {
    async fn create_debtor(&self, input: &CreateDebtorParams) -> Result<DebtorRecord, DatabaseError>;
    /// Insert a debtor and its first access token atomically.
    async fn create_debtor_with_token(
        &self,
        input: &CreateDebtorParams,
        token: &NewAccessToken,
    ) -> Result<(DebtorRecord, AccessTokenRecord), DatabaseError>;
    async fn get_debtor(&self, id: Uuid) -> Result<Option<DebtorRecord>, DatabaseError>;
    async fn update_debtor(
        &self,
        id: Uuid,
        input: &UpdateDebtorParams,
    ) -> Result<Option<DebtorRecord>, DatabaseError>;
    async fn find_debtor_by_email(&self, email: &str) -> Result<Option<DebtorRecord>, DatabaseError>;
    async fn find_debtor_by_phone(&self, phone: &str) -> Result<Option<DebtorRecord>, DatabaseError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Revoke the debtor's active token (if any) and insert `token` in one
    /// transaction. Returns the new row and the number of rows revoked.
    async fn replace_access_token(
        &self,
        debtor_id: Uuid,
        token: &NewAccessToken,
    ) -> Result<(AccessTokenRecord, u64), DatabaseError>;
    /// Active (non-revoked) token row for a hash, if any.
    async fn find_active_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessTokenRecord>, DatabaseError>;
    async fn active_token_for_debtor(
        &self,
        debtor_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, DatabaseError>;
    /// Revoke every active token of a debtor; returns how many were revoked.
    async fn revoke_tokens(&self, debtor_id: Uuid) -> Result<u64, DatabaseError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_communication(
        &self,
        input: &NewCommunication,
    ) -> Result<InsertOutcome<CommunicationRecord>, DatabaseError>;
    async fn append_payment(
        &self,
        input: &NewPayment,
    ) -> Result<InsertOutcome<PaymentRecord>, DatabaseError>;
    async fn append_page_view(&self, input: &NewPageView) -> Result<PageViewRecord, DatabaseError>;
    async fn list_communications(
        &self,
        debtor_id: Uuid,
    ) -> Result<Vec<CommunicationRecord>, DatabaseError>;
    async fn list_payments(&self, debtor_id: Uuid) -> Result<Vec<PaymentRecord>, DatabaseError>;
    async fn list_page_views(&self, debtor_id: Uuid) -> Result<Vec<PageViewRecord>, DatabaseError>;
    /// Highest ledger sequence owned by the debtor (0 when empty).
    async fn ledger_version(&self, debtor_id: Uuid) -> Result<i64, DatabaseError>;
    /// Owner and correlation ref of any earlier event for this provider message.
    async fn find_communication_owner(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<(Uuid, Option<String>)>, DatabaseError>;
    /// Owner and payment link of any earlier event for this provider payment.
    async fn find_payment_owner(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> Result<Option<(Uuid, Option<String>)>, DatabaseError>;
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn create_communication_intent(
        &self,
        message_ref: &str,
        debtor_id: Uuid,
        channel: Channel,
    ) -> Result<CommunicationIntentRecord, DatabaseError>;
    /// Attach the provider's message id; only fills an empty slot.
    async fn bind_provider_message(
        &self,
        message_ref: &str,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError>;
    async fn find_intent_by_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<CommunicationIntentRecord>, DatabaseError>;
    async fn find_intent_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<CommunicationIntentRecord>, DatabaseError>;
    async fn create_payment_link(
        &self,
        input: &NewPaymentLink,
    ) -> Result<PaymentLinkRecord, DatabaseError>;
    async fn attach_provider_link(
        &self,
        link_id: &str,
        provider_link_id: &str,
        url: &str,
    ) -> Result<Option<PaymentLinkRecord>, DatabaseError>;
    async fn get_payment_link(&self, link_id: &str)
    -> Result<Option<PaymentLinkRecord>, DatabaseError>;
    /// Intents older than `cutoff` whose ledger rows never moved past `queued`.
    async fn list_unresolved_intents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CommunicationIntentRecord>, DatabaseError>;
    /// Links older than `cutoff` with no payment event attached.
    async fn list_unpaid_links(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentLinkRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
///
/// Combines all sub-traits into one; leaf consumers can depend on a specific
/// sub-trait instead.
#[async_trait]
pub trait Database: DebtorStore + TokenStore + LedgerStore + IntentStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::{Channel, CommunicationStatus, Direction, PaymentStatus};

    #[test]
    fn enum_db_values_round_trip() {
        for channel in [Channel::Email, Channel::Voice, Channel::Sms] {
            assert_eq!(Channel::from_db_value(channel.as_str()), Some(channel));
        }
        for direction in [Direction::Outbound, Direction::Inbound] {
            assert_eq!(Direction::from_db_value(direction.as_str()), Some(direction));
        }
        assert_eq!(
            CommunicationStatus::from_db_value("opened"),
            Some(CommunicationStatus::Opened)
        );
        assert_eq!(PaymentStatus::from_db_value("refunded"), Some(PaymentStatus::Refunded));
        assert_eq!(PaymentStatus::from_db_value("chargeback"), None);
    }
}
