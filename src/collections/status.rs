//! Debtor status derived from the ledger.
//!
//! Derivation runs in two pure steps. [`summarize`] folds the ordered ledger
//! into a [`LedgerSummary`] (highest progress reached plus the last time the
//! debtor moved the case forward). [`resolve`] layers the time-dependent
//! `delinquent` state on top. Only the summary is cached, keyed by the
//! debtor's ledger version, so a cached answer never outlives an append.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use uuid::Uuid;

use crate::collections::ledger::{EventLedger, LedgerEntry};
use crate::config::StatusPolicyConfig;
use crate::db::{CommunicationStatus, DebtorRecord, Direction, PaymentStatus};
use crate::error::DatabaseError;

/// Progress states in ascending priority; the derived variant order is the priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    New,
    FailedContact,
    Contacted,
    Viewed,
    PaymentInitiated,
    Paid,
}

/// What a debtor page and the dashboard show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtorStatus {
    New,
    FailedContact,
    Contacted,
    Viewed,
    PaymentInitiated,
    Paid,
    Delinquent,
}

impl DebtorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::FailedContact => "failed_contact",
            Self::Contacted => "contacted",
            Self::Viewed => "viewed",
            Self::PaymentInitiated => "payment_initiated",
            Self::Paid => "paid",
            Self::Delinquent => "delinquent",
        }
    }
}

impl From<ProgressState> for DebtorStatus {
    fn from(state: ProgressState) -> Self {
        match state {
            ProgressState::New => Self::New,
            ProgressState::FailedContact => Self::FailedContact,
            ProgressState::Contacted => Self::Contacted,
            ProgressState::Viewed => Self::Viewed,
            ProgressState::PaymentInitiated => Self::PaymentInitiated,
            ProgressState::Paid => Self::Paid,
        }
    }
}

/// Order-independent digest of a debtor's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSummary {
    pub progress: ProgressState,
    /// Latest debtor-originated event (open, reply, payment activity).
    pub last_engagement_at: Option<DateTime<Utc>>,
    /// Latest record that reached or sustained a progress state; the delinquency clock.
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// Rank of one outbound attempt's events; an attempt settles on its highest rank.
fn attempt_rank(status: CommunicationStatus) -> u8 {
    match status {
        CommunicationStatus::Unrecognized => 0,
        CommunicationStatus::Queued => 1,
        CommunicationStatus::Sent => 2,
        CommunicationStatus::Failed => 3,
        CommunicationStatus::Delivered => 4,
        CommunicationStatus::Opened => 5,
    }
}

#[derive(Default)]
struct PaymentHistory {
    succeeded: bool,
    refunded: bool,
}

/// Fold a ledger into its summary. Page views never affect the result.
pub fn summarize<'a, I>(entries: I) -> LedgerSummary
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut progress = ProgressState::New;
    let mut last_engagement_at: Option<DateTime<Utc>> = None;
    let mut last_progress_at: Option<DateTime<Utc>> = None;
    let mut attempts: HashMap<&str, CommunicationStatus> = HashMap::new();
    let mut payments: HashMap<(&str, &str), PaymentHistory> = HashMap::new();

    let latest = |slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>| {
        *slot = Some(slot.map_or(at, |prev| prev.max(at)));
    };

    for entry in entries {
        match entry {
            LedgerEntry::Communication(c) if c.direction == Direction::Inbound => {
                progress = progress.max(ProgressState::Viewed);
                latest(&mut last_engagement_at, c.occurred_at);
                latest(&mut last_progress_at, c.occurred_at);
            }
            LedgerEntry::Communication(c) => {
                let key = c.message_ref.as_deref().unwrap_or(&c.provider_message_id);
                attempts
                    .entry(key)
                    .and_modify(|best| {
                        if attempt_rank(c.status) > attempt_rank(*best) {
                            *best = c.status;
                        }
                    })
                    .or_insert(c.status);
                match c.status {
                    CommunicationStatus::Opened => {
                        latest(&mut last_engagement_at, c.occurred_at);
                        latest(&mut last_progress_at, c.occurred_at);
                    }
                    CommunicationStatus::Sent | CommunicationStatus::Delivered => {
                        latest(&mut last_progress_at, c.occurred_at);
                    }
                    _ => {}
                }
            }
            LedgerEntry::Payment(p) => {
                let history = payments
                    .entry((p.provider.as_str(), p.provider_payment_id.as_str()))
                    .or_default();
                match p.status {
                    PaymentStatus::Succeeded => history.succeeded = true,
                    PaymentStatus::Refunded => history.refunded = true,
                    _ => {}
                }
                latest(&mut last_engagement_at, p.occurred_at);
                latest(&mut last_progress_at, p.occurred_at);
            }
            LedgerEntry::PageView(_) => {}
        }
    }

    if !attempts.is_empty()
        && attempts
            .values()
            .all(|s| *s == CommunicationStatus::Failed)
    {
        progress = progress.max(ProgressState::FailedContact);
    }
    for status in attempts.values() {
        let reached = match status {
            CommunicationStatus::Opened => ProgressState::Viewed,
            CommunicationStatus::Sent | CommunicationStatus::Delivered => ProgressState::Contacted,
            _ => continue,
        };
        progress = progress.max(reached);
    }
    for history in payments.values() {
        let reached = if history.succeeded && !history.refunded {
            ProgressState::Paid
        } else {
            ProgressState::PaymentInitiated
        };
        progress = progress.max(reached);
    }

    LedgerSummary {
        progress,
        last_engagement_at,
        last_progress_at,
    }
}

/// Apply the inactivity rule. `paid` is never delinquent.
pub fn resolve(
    summary: &LedgerSummary,
    debtor_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    inactivity_threshold: chrono::Duration,
) -> DebtorStatus {
    if summary.progress == ProgressState::Paid {
        return DebtorStatus::Paid;
    }
    let anchor = summary
        .last_progress_at
        .map_or(debtor_created_at, |at| at.max(debtor_created_at));
    if now - anchor > inactivity_threshold {
        DebtorStatus::Delinquent
    } else {
        summary.progress.into()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: DebtorStatus,
    pub progress: ProgressState,
    pub last_engagement_at: Option<DateTime<Utc>>,
    pub ledger_version: i64,
}

/// Derives statuses on read, caching summaries per ledger version.
pub struct StatusService {
    ledger: EventLedger,
    policy: StatusPolicyConfig,
    cache: Mutex<LruCache<Uuid, (i64, LedgerSummary)>>,
}

impl StatusService {
    pub fn new(ledger: EventLedger, policy: StatusPolicyConfig) -> Self {
        let capacity = NonZeroUsize::new(policy.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ledger,
            policy,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn status(&self, debtor: &DebtorRecord) -> Result<StatusSnapshot, DatabaseError> {
        self.status_at(debtor, Utc::now()).await
    }

    pub async fn status_at(
        &self,
        debtor: &DebtorRecord,
        now: DateTime<Utc>,
    ) -> Result<StatusSnapshot, DatabaseError> {
        // Version first: an append racing the list below leaves a stale tag, never a stale summary.
        let version = self.ledger.version(debtor.id).await?;
        let summary = match self.cached(debtor.id, version) {
            Some(summary) => summary,
            None => {
                let ledger = self.ledger.list(debtor.id, None).await?;
                let summary = summarize(&ledger);
                if let Ok(mut cache) = self.cache.lock() {
                    cache.put(debtor.id, (version, summary));
                }
                summary
            }
        };

        let status = resolve(
            &summary,
            debtor.created_at,
            now,
            self.policy.inactivity_threshold,
        );
        tracing::debug!(
            debtor_id = %debtor.id,
            status = status.as_str(),
            ledger_version = version,
            "Derived debtor status"
        );
        Ok(StatusSnapshot {
            status,
            progress: summary.progress,
            last_engagement_at: summary.last_engagement_at,
            ledger_version: version,
        })
    }

    fn cached(&self, debtor_id: Uuid, version: i64) -> Option<LedgerSummary> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(&debtor_id) {
            Some((cached_version, summary)) if *cached_version == version => Some(*summary),
            _ => None,
        }
    }
}
