//! Error types for every layer of the service.

use std::time::Duration;

/// Configuration resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage-layer failures. Duplicate dedup keys are never reported here.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_))
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Access-token failures.
///
/// `NotFound` covers unknown and revoked tokens alike.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token generation failed: {0}")]
    Generation(String),

    #[error("Token sealing failed: {0}")]
    Sealing(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Webhook ingestion failures.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Webhook verification failed for {provider}: {reason}")]
    Verification {
        provider: &'static str,
        reason: String,
    },

    #[error("Malformed {provider} payload: {reason}")]
    Malformed {
        provider: &'static str,
        reason: String,
    },

    #[error("No debtor matches {provider} reference {reference}")]
    UnknownDebtor {
        provider: &'static str,
        reference: String,
    },

    #[error("Persistence failed after {attempts} attempts: {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: DatabaseError,
    },
}

/// Outbound provider call failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider transport error: {0}")]
    Transport(String),
}

/// Outbound dispatch failures raised before anything reaches a provider.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Debtor {0} not found")]
    UnknownDebtor(uuid::Uuid),

    #[error("Debtor {debtor_id} has no {field} on file")]
    MissingContact {
        debtor_id: uuid::Uuid,
        field: &'static str,
    },

    #[error("No provider configured for {0}")]
    ChannelUnavailable(&'static str),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error(transparent)]
    Persistence(#[from] DatabaseError),
}

/// HTTP gateway failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}
