//! Webhook ingestion: verify, resolve, normalize, append.
//!
//! Each provider callback is authenticated first and fails closed. The event
//! is then attributed to a debtor, normalized into the domain vocabulary, and
//! appended to the ledger, whose dedup keys make provider redelivery a no-op.
//! Storage failures are retried with backoff before surfacing, so the provider
//! sees a 5xx only once retrying in-process has been exhausted.

pub mod email;
pub mod payment;
pub mod signature;
pub mod telephony;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use uuid::Uuid;

use crate::collections::audit;
use crate::collections::ledger::{AppendOutcome, EventLedger, LedgerEntry};
use crate::collections::retry::{RetryExhausted, RetryPolicy, retry_transient};
use crate::config::WebhookConfig;
use crate::db::{
    Channel, CommunicationStatus, Database, Direction, NewCommunication, NewPayment, PaymentStatus,
};
use crate::error::{DatabaseError, IngestError};

use self::signature::SignatureFailure;

pub const EMAIL_PROVIDER: &str = "email";
pub const PAYMENT_PROVIDER: &str = "stripe";
pub const TELEPHONY_PROVIDER: &str = "twilio";

/// A communication callback after parsing, before attribution.
#[derive(Debug, Clone)]
pub struct CommunicationEvent {
    pub channel: Channel,
    pub direction: Direction,
    pub provider_message_id: String,
    pub message_ref: Option<String>,
    pub status: CommunicationStatus,
    pub provider_status: String,
    /// Address or number on the debtor's side of the exchange.
    pub counterpart: Option<String>,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A payment callback after parsing, before attribution.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub provider_payment_id: String,
    pub link_ref: Option<String>,
    pub debtor_hint: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub status: PaymentStatus,
    pub provider_status: String,
    pub occurred_at: DateTime<Utc>,
}

/// What an accepted callback did to the ledger.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub debtor_id: Uuid,
    pub duplicate: bool,
    pub entry: LedgerEntry,
}

impl IngestOutcome {
    fn from_append(outcome: AppendOutcome<LedgerEntry>) -> Self {
        let duplicate = outcome.is_duplicate();
        let entry = outcome.into_entry();
        Self {
            debtor_id: entry.debtor_id(),
            duplicate,
            entry,
        }
    }
}

struct CommunicationOwner {
    debtor_id: Uuid,
    message_ref: Option<String>,
}

struct PaymentOwner {
    debtor_id: Uuid,
    link_id: Option<String>,
    link_amount: Option<(Decimal, String)>,
}

pub struct WebhookIngestor {
    db: Arc<dyn Database>,
    ledger: EventLedger,
    email_secret: Option<SecretString>,
    payment_secret: Option<SecretString>,
    telephony_secret: Option<SecretString>,
    tolerance_secs: i64,
    retry: RetryPolicy,
    public_base_url: String,
    default_currency: String,
}

impl WebhookIngestor {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: EventLedger,
        config: WebhookConfig,
        public_base_url: impl Into<String>,
        default_currency: impl Into<String>,
    ) -> Self {
        let retry = RetryPolicy::from_webhook_config(&config);
        Self {
            db,
            ledger,
            tolerance_secs: i64::try_from(config.tolerance.as_secs()).unwrap_or(i64::MAX),
            email_secret: config.email_secret,
            payment_secret: config.payment_secret,
            telephony_secret: config.telephony_secret,
            retry,
            public_base_url: public_base_url.into(),
            default_currency: default_currency.into(),
        }
    }

    pub async fn ingest_email(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        signature::verify_timestamped(
            self.email_secret.as_ref(),
            signature,
            body,
            self.tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(|f| reject(EMAIL_PROVIDER, f))?;

        let event = email::parse(body).map_err(|reason| malformed(EMAIL_PROVIDER, reason))?;
        self.record_communication(EMAIL_PROVIDER, event).await
    }

    pub async fn ingest_payment(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        signature::verify_timestamped(
            self.payment_secret.as_ref(),
            signature,
            body,
            self.tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(|f| reject(PAYMENT_PROVIDER, f))?;

        let event = payment::parse(body, &self.default_currency)
            .map_err(|reason| malformed(PAYMENT_PROVIDER, reason))?;
        self.record_payment(event).await
    }

    /// `path_and_query` is the request target as received; it is joined to the
    /// public base URL because the provider signs the URL it was given.
    pub async fn ingest_telephony(
        &self,
        signature: Option<&str>,
        path_and_query: &str,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let url = format!("{}{}", self.public_base_url, path_and_query);
        let params = telephony::form_params(body);
        signature::verify_telephony(self.telephony_secret.as_ref(), signature, &url, &params)
            .map_err(|f| reject(TELEPHONY_PROVIDER, f))?;

        let message_ref = url::Url::parse(&url).ok().and_then(|parsed| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == "ref")
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        });
        let event = telephony::parse(&params, message_ref)
            .map_err(|reason| malformed(TELEPHONY_PROVIDER, reason))?;
        self.record_communication(TELEPHONY_PROVIDER, event).await
    }

    async fn record_communication(
        &self,
        provider: &'static str,
        event: CommunicationEvent,
    ) -> Result<IngestOutcome, IngestError> {
        let owner = self
            .with_retry("resolve_communication", || self.resolve_communication(&event))
            .await?;
        let Some(owner) = owner else {
            return Err(unknown_debtor(provider, &event.provider_message_id));
        };

        let input = NewCommunication {
            debtor_id: owner.debtor_id,
            channel: event.channel,
            direction: event.direction,
            provider_message_id: event.provider_message_id.clone(),
            message_ref: owner.message_ref,
            status: event.status,
            provider_status: event.provider_status.clone(),
            detail: event.detail.clone(),
            occurred_at: event.occurred_at,
        };
        let outcome = self
            .with_retry("append_communication", || {
                self.ledger.append_communication(&input)
            })
            .await?
            .map(LedgerEntry::Communication);

        if event.status == CommunicationStatus::Unrecognized {
            tracing::warn!(
                provider,
                provider_status = %event.provider_status,
                provider_message_id = %event.provider_message_id,
                "Recorded communication event with unrecognized status"
            );
        }
        tracing::info!(
            provider,
            debtor_id = %owner.debtor_id,
            channel = event.channel.as_str(),
            provider_message_id = %event.provider_message_id,
            status = event.status.as_str(),
            duplicate = outcome.is_duplicate(),
            "Communication webhook ingested"
        );
        Ok(IngestOutcome::from_append(outcome))
    }

    async fn record_payment(&self, event: PaymentEvent) -> Result<IngestOutcome, IngestError> {
        let owner = self
            .with_retry("resolve_payment", || self.resolve_payment(&event))
            .await?;
        let Some(owner) = owner else {
            return Err(unknown_debtor(PAYMENT_PROVIDER, &event.provider_payment_id));
        };

        let (link_amount, link_currency) = owner.link_amount.unzip();
        let input = NewPayment {
            debtor_id: owner.debtor_id,
            provider: PAYMENT_PROVIDER.to_string(),
            provider_payment_id: event.provider_payment_id.clone(),
            payment_link_id: owner.link_id,
            amount: event.amount.or(link_amount).unwrap_or(Decimal::ZERO),
            currency: event
                .currency
                .clone()
                .or(link_currency)
                .unwrap_or_else(|| self.default_currency.clone()),
            status: event.status,
            provider_status: event.provider_status.clone(),
            occurred_at: event.occurred_at,
        };
        let outcome = self
            .with_retry("append_payment", || self.ledger.append_payment(&input))
            .await?
            .map(LedgerEntry::Payment);

        if event.status == PaymentStatus::Unrecognized {
            tracing::warn!(
                provider_status = %event.provider_status,
                provider_payment_id = %event.provider_payment_id,
                "Recorded payment event with unrecognized status"
            );
        }
        tracing::info!(
            provider = PAYMENT_PROVIDER,
            debtor_id = %owner.debtor_id,
            provider_payment_id = %event.provider_payment_id,
            status = event.status.as_str(),
            duplicate = outcome.is_duplicate(),
            "Payment webhook ingested"
        );
        Ok(IngestOutcome::from_append(outcome))
    }

    /// Attribution order: intent ref, intent bound to the provider id, an
    /// earlier event for the same provider id, then (inbound only) the sender.
    async fn resolve_communication(
        &self,
        event: &CommunicationEvent,
    ) -> Result<Option<CommunicationOwner>, DatabaseError> {
        if let Some(message_ref) = event.message_ref.as_deref()
            && let Some(intent) = self.db.find_intent_by_ref(message_ref).await?
            && intent.channel == event.channel
        {
            if intent.provider_message_id.is_none() {
                self.db
                    .bind_provider_message(&intent.message_ref, &event.provider_message_id)
                    .await?;
            }
            return Ok(Some(CommunicationOwner {
                debtor_id: intent.debtor_id,
                message_ref: Some(intent.message_ref),
            }));
        }

        if let Some(intent) = self
            .db
            .find_intent_by_provider_id(event.channel, &event.provider_message_id)
            .await?
        {
            return Ok(Some(CommunicationOwner {
                debtor_id: intent.debtor_id,
                message_ref: Some(intent.message_ref),
            }));
        }

        if let Some((debtor_id, message_ref)) = self
            .db
            .find_communication_owner(event.channel, &event.provider_message_id)
            .await?
        {
            return Ok(Some(CommunicationOwner {
                debtor_id,
                message_ref,
            }));
        }

        if event.direction == Direction::Inbound
            && let Some(counterpart) = event.counterpart.as_deref()
        {
            let debtor = match event.channel {
                Channel::Email => self.db.find_debtor_by_email(counterpart).await?,
                Channel::Sms | Channel::Voice => self.db.find_debtor_by_phone(counterpart).await?,
            };
            return Ok(debtor.map(|d| CommunicationOwner {
                debtor_id: d.id,
                message_ref: None,
            }));
        }

        Ok(None)
    }

    /// Attribution order: pre-registered link, an earlier event for the same
    /// payment, then debtor id carried in processor metadata.
    async fn resolve_payment(
        &self,
        event: &PaymentEvent,
    ) -> Result<Option<PaymentOwner>, DatabaseError> {
        if let Some(link_ref) = event.link_ref.as_deref()
            && let Some(link) = self.db.get_payment_link(link_ref).await?
        {
            return Ok(Some(PaymentOwner {
                debtor_id: link.debtor_id,
                link_id: Some(link.id),
                link_amount: Some((link.amount, link.currency)),
            }));
        }

        if let Some((debtor_id, link_id)) = self
            .db
            .find_payment_owner(PAYMENT_PROVIDER, &event.provider_payment_id)
            .await?
        {
            return Ok(Some(PaymentOwner {
                debtor_id,
                link_id,
                link_amount: None,
            }));
        }

        if let Some(hint) = event.debtor_hint
            && let Some(debtor) = self.db.get_debtor(hint).await?
        {
            return Ok(Some(PaymentOwner {
                debtor_id: debtor.id,
                link_id: None,
                link_amount: None,
            }));
        }

        Ok(None)
    }

    async fn with_retry<F, Fut, T>(&self, context: &str, operation: F) -> Result<T, IngestError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        retry_transient(&self.retry, context, operation)
            .await
            .map_err(|RetryExhausted { attempts, source }| {
                tracing::error!(context, attempts, error = %source, "Webhook persistence failed");
                IngestError::Persistence { attempts, source }
            })
    }
}

fn reject(provider: &'static str, failure: SignatureFailure) -> IngestError {
    tracing::warn!(provider, reason = failure.as_str(), "Rejected webhook");
    audit::inc_rejected_webhook();
    audit::record(
        "webhook_rejected",
        serde_json::json!({ "provider": provider, "reason": failure.as_str() }),
    );
    IngestError::Verification {
        provider,
        reason: failure.as_str().to_string(),
    }
}

fn malformed(provider: &'static str, reason: String) -> IngestError {
    tracing::warn!(provider, reason = %reason, "Malformed webhook payload");
    IngestError::Malformed { provider, reason }
}

fn unknown_debtor(provider: &'static str, reference: &str) -> IngestError {
    tracing::warn!(provider, reference, "Webhook does not match any debtor; acknowledging");
    audit::inc_unknown_debtor();
    audit::record(
        "webhook_unknown_debtor",
        serde_json::json!({ "provider": provider, "reference": reference }),
    );
    IngestError::UnknownDebtor {
        provider,
        reference: reference.to_string(),
    }
}
