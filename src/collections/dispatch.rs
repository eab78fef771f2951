//! Outbound communications and payment links.
//!
//! Intent is always persisted before a provider is called: a communication
//! gets an intent row plus a `queued` ledger entry, a payment link gets its
//! `pl_` row. A synchronous provider failure appends a `failed` entry right
//! away. A timeout leaves the queued entry alone, because the provider may
//! still have acted; webhooks or the reconciliation sweep settle it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::collections::currency::minor_unit_exponent;
use crate::collections::ledger::EventLedger;
use crate::collections::tokens::TokenService;
use crate::config::DispatchConfig;
use crate::db::{
    Channel, CommunicationIntentRecord, CommunicationRecord, CommunicationStatus, Database,
    DebtorRecord, Direction, NewCommunication, NewPaymentLink, PaymentLinkRecord,
};
use crate::error::{DispatchError, ProviderError};

/// Provider status recorded on the dispatcher's own ledger entries.
pub const QUEUED_MARKER: &str = "queued";
pub const DISPATCH_FAILED_MARKER: &str = "dispatch_failed";

/// One message handed to a channel provider.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Correlation id; providers should echo it back (tag, metadata, or callback URL).
    pub message_ref: String,
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    /// Status callback for providers that take one per message.
    pub status_callback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
}

#[async_trait]
pub trait CommunicationProvider: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct PaymentLinkRequest {
    /// Our `pl_` id; processors carry it back as `link_ref` metadata.
    pub link_id: String,
    pub debtor_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub success_url: String,
}

#[derive(Debug, Clone)]
pub struct ProviderLink {
    pub provider_link_id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_link(&self, request: &PaymentLinkRequest) -> Result<ProviderLink, ProviderError>;
}

/// What the provider said, if anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Accepted { provider_id: String },
    /// Unknown outcome; the intent stays open for webhooks or the sweep.
    TimedOut,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub intent: CommunicationIntentRecord,
    /// `queued`, or `failed` when the provider refused synchronously.
    pub record: CommunicationRecord,
    pub outcome: ProviderOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkDispatched {
    pub link: PaymentLinkRecord,
    pub outcome: ProviderOutcome,
}

/// Message content; `{{page_url}}` and `{{pay_url}}` are filled per debtor.
#[derive(Debug, Clone)]
pub struct OutboundContent {
    pub subject: Option<String>,
    pub body: String,
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    ledger: EventLedger,
    tokens: TokenService,
    channels: HashMap<Channel, Arc<dyn CommunicationProvider>>,
    payments: Option<Arc<dyn PaymentProvider>>,
    provider_timeout: Duration,
    default_currency: String,
    public_base_url: String,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: EventLedger,
        tokens: TokenService,
        config: &DispatchConfig,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            ledger,
            tokens,
            channels: HashMap::new(),
            payments: None,
            provider_timeout: config.provider_timeout,
            default_currency: config.default_currency.clone(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn with_channel_provider(mut self, provider: Arc<dyn CommunicationProvider>) -> Self {
        self.channels.insert(provider.channel(), provider);
        self
    }

    pub fn with_payment_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.payments = Some(provider);
        self
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.channels.contains_key(&channel)
    }

    pub async fn send_communication(
        &self,
        debtor_id: Uuid,
        channel: Channel,
        content: OutboundContent,
    ) -> Result<Dispatched, DispatchError> {
        let debtor = self
            .db
            .get_debtor(debtor_id)
            .await?
            .ok_or(DispatchError::UnknownDebtor(debtor_id))?;
        let to = recipient(&debtor, channel)?;
        let provider = self
            .channels
            .get(&channel)
            .cloned()
            .ok_or(DispatchError::ChannelUnavailable(channel.as_str()))?;

        let message_ref = format!("msg_{}", Uuid::new_v4().simple());
        let intent = self
            .db
            .create_communication_intent(&message_ref, debtor_id, channel)
            .await?;
        let queued = self
            .ledger
            .append_communication(&NewCommunication {
                debtor_id,
                channel,
                direction: Direction::Outbound,
                provider_message_id: message_ref.clone(),
                message_ref: Some(message_ref.clone()),
                status: CommunicationStatus::Queued,
                provider_status: QUEUED_MARKER.to_string(),
                detail: None,
                occurred_at: Utc::now(),
            })
            .await?
            .into_entry();

        let links = self.debtor_links(debtor_id).await;
        let message = OutboundMessage {
            message_ref: message_ref.clone(),
            channel,
            to,
            subject: content.subject.map(|s| render(&s, &links)),
            body: render(&content.body, &links),
            status_callback: match channel {
                Channel::Email => None,
                Channel::Sms | Channel::Voice => Some(format!(
                    "{}/webhook/twilio?ref={message_ref}",
                    self.public_base_url
                )),
            },
        };

        let (record, outcome) =
            match tokio::time::timeout(self.provider_timeout, provider.send(&message)).await {
                Ok(Ok(receipt)) => {
                    // The provider has acted; a lost binding must not turn that into an error.
                    // Callbacks echoing `message_ref` still correlate, and the sweep lists the rest.
                    if let Err(e) = self
                        .db
                        .bind_provider_message(&message_ref, &receipt.provider_message_id)
                        .await
                    {
                        tracing::warn!(
                            debtor_id = %debtor_id,
                            message_ref = %message_ref,
                            provider_message_id = %receipt.provider_message_id,
                            error = %e,
                            "Failed to bind provider message id to intent"
                        );
                    }
                    tracing::info!(
                        debtor_id = %debtor_id,
                        channel = channel.as_str(),
                        message_ref = %message_ref,
                        provider_message_id = %receipt.provider_message_id,
                        "Provider accepted outbound message"
                    );
                    (
                        queued,
                        ProviderOutcome::Accepted {
                            provider_id: receipt.provider_message_id,
                        },
                    )
                }
                Ok(Err(ProviderError::Timeout(_))) | Err(_) => {
                    tracing::warn!(
                        debtor_id = %debtor_id,
                        channel = channel.as_str(),
                        message_ref = %message_ref,
                        timeout_ms = self.provider_timeout.as_millis() as u64,
                        "Provider call timed out; message left queued"
                    );
                    (queued, ProviderOutcome::TimedOut)
                }
                Ok(Err(e)) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        debtor_id = %debtor_id,
                        channel = channel.as_str(),
                        message_ref = %message_ref,
                        error = %reason,
                        "Provider rejected outbound message"
                    );
                    let failed = self
                        .ledger
                        .append_communication(&NewCommunication {
                            debtor_id,
                            channel,
                            direction: Direction::Outbound,
                            provider_message_id: message_ref.clone(),
                            message_ref: Some(message_ref.clone()),
                            status: CommunicationStatus::Failed,
                            provider_status: DISPATCH_FAILED_MARKER.to_string(),
                            detail: Some(reason.clone()),
                            occurred_at: Utc::now(),
                        })
                        .await?
                        .into_entry();
                    (failed, ProviderOutcome::Rejected { reason })
                }
            };

        Ok(Dispatched {
            intent,
            record,
            outcome,
        })
    }

    pub async fn create_payment_link(
        &self,
        debtor_id: Uuid,
        amount: Decimal,
        currency: Option<&str>,
    ) -> Result<LinkDispatched, DispatchError> {
        if amount <= Decimal::ZERO {
            return Err(DispatchError::InvalidAmount(format!(
                "amount must be positive, got {amount}"
            )));
        }
        let currency = match currency.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) if c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
                c.to_ascii_lowercase()
            }
            Some(c) => {
                return Err(DispatchError::InvalidAmount(format!(
                    "'{c}' is not a three-letter currency code"
                )));
            }
            None => self.default_currency.clone(),
        };
        let exponent = minor_unit_exponent(&currency);
        if amount.normalize().scale() > exponent {
            return Err(DispatchError::InvalidAmount(format!(
                "amount {amount} has more than {exponent} decimal places for {currency}"
            )));
        }

        if self.db.get_debtor(debtor_id).await?.is_none() {
            return Err(DispatchError::UnknownDebtor(debtor_id));
        }
        let provider = self
            .payments
            .clone()
            .ok_or(DispatchError::ChannelUnavailable("payment"))?;

        let link = self
            .db
            .create_payment_link(&NewPaymentLink {
                id: format!("pl_{}", Uuid::new_v4().simple()),
                debtor_id,
                amount,
                currency: currency.clone(),
            })
            .await?;

        let links = self.debtor_links(debtor_id).await;
        let request = PaymentLinkRequest {
            link_id: link.id.clone(),
            debtor_id,
            amount,
            currency,
            success_url: links.page_url,
        };

        match tokio::time::timeout(self.provider_timeout, provider.create_link(&request)).await {
            Ok(Ok(created)) => {
                let link = self
                    .db
                    .attach_provider_link(&link.id, &created.provider_link_id, &created.url)
                    .await?
                    .unwrap_or(link);
                tracing::info!(
                    debtor_id = %debtor_id,
                    link_id = %link.id,
                    provider_link_id = %created.provider_link_id,
                    "Payment link created"
                );
                Ok(LinkDispatched {
                    link,
                    outcome: ProviderOutcome::Accepted {
                        provider_id: created.provider_link_id,
                    },
                })
            }
            Ok(Err(ProviderError::Timeout(_))) | Err(_) => {
                tracing::warn!(
                    debtor_id = %debtor_id,
                    link_id = %link.id,
                    "Payment link creation timed out; intent kept for correlation"
                );
                Ok(LinkDispatched {
                    link,
                    outcome: ProviderOutcome::TimedOut,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    debtor_id = %debtor_id,
                    link_id = %link.id,
                    error = %e,
                    "Payment processor rejected link creation"
                );
                Ok(LinkDispatched {
                    link,
                    outcome: ProviderOutcome::Rejected {
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    async fn debtor_links(&self, debtor_id: Uuid) -> DebtorLinks {
        let token = match self.tokens.active_token(debtor_id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(debtor_id = %debtor_id, error = %e, "Could not load debtor token");
                None
            }
        };
        match token {
            Some(token) => DebtorLinks {
                page_url: format!("{}/debtor/{token}", self.public_base_url),
                pay_url: format!("{}/pay/{token}", self.public_base_url),
            },
            None => DebtorLinks {
                page_url: self.public_base_url.clone(),
                pay_url: self.public_base_url.clone(),
            },
        }
    }
}

struct DebtorLinks {
    page_url: String,
    pay_url: String,
}

fn render(template: &str, links: &DebtorLinks) -> String {
    template
        .replace("{{page_url}}", &links.page_url)
        .replace("{{pay_url}}", &links.pay_url)
}

fn recipient(debtor: &DebtorRecord, channel: Channel) -> Result<String, DispatchError> {
    let (value, field) = match channel {
        Channel::Email => (debtor.email.as_deref(), "email"),
        Channel::Sms | Channel::Voice => (debtor.phone.as_deref(), "phone"),
    };
    value
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or(DispatchError::MissingContact {
            debtor_id: debtor.id,
            field,
        })
}
