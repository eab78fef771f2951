//! Reconciliation sweep over intents whose provider outcome never arrived.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::{CommunicationIntentRecord, Database, PaymentLinkRecord};
use crate::error::DatabaseError;

/// Intents an operator should re-query at the provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub cutoff: Option<DateTime<Utc>>,
    /// Outbound messages with nothing past `queued` in the ledger.
    pub unresolved_messages: Vec<CommunicationIntentRecord>,
    /// Payment links no payment event has referenced.
    pub unpaid_links: Vec<PaymentLinkRecord>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved_messages.is_empty() && self.unpaid_links.is_empty()
    }
}

pub async fn sweep(
    db: &Arc<dyn Database>,
    older_than: Duration,
) -> Result<ReconcileReport, DatabaseError> {
    sweep_at(db, Utc::now() - older_than).await
}

pub async fn sweep_at(
    db: &Arc<dyn Database>,
    cutoff: DateTime<Utc>,
) -> Result<ReconcileReport, DatabaseError> {
    let unresolved_messages = db.list_unresolved_intents(cutoff).await?;
    let unpaid_links = db.list_unpaid_links(cutoff).await?;

    for intent in &unresolved_messages {
        tracing::warn!(
            debtor_id = %intent.debtor_id,
            channel = intent.channel.as_str(),
            message_ref = %intent.message_ref,
            provider_message_id = intent.provider_message_id.as_deref().unwrap_or("-"),
            "Outbound message has no provider outcome"
        );
    }
    tracing::info!(
        cutoff = %cutoff,
        unresolved_messages = unresolved_messages.len(),
        unpaid_links = unpaid_links.len(),
        "Reconciliation sweep finished"
    );

    Ok(ReconcileReport {
        cutoff: Some(cutoff),
        unresolved_messages,
        unpaid_links,
    })
}
