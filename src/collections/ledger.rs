//! Append-only event ledger.
//!
//! Communications and payments carry a dedup key that the storage layer
//! enforces; re-appending a known key hands back the stored entry as
//! [`AppendOutcome::Duplicate`]. Page views are never deduplicated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::{
    CommunicationRecord, Database, InsertOutcome, NewCommunication, NewPageView, NewPayment,
    PageViewRecord, PaymentRecord,
};
use crate::error::DatabaseError;

/// Record set selector for [`EventLedger::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Communication,
    Payment,
    PageView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Communication(CommunicationRecord),
    Payment(PaymentRecord),
    PageView(PageViewRecord),
}

impl LedgerEntry {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Communication(r) => r.occurred_at,
            Self::Payment(r) => r.occurred_at,
            Self::PageView(r) => r.occurred_at,
        }
    }

    /// Global insertion order.
    pub fn seq(&self) -> i64 {
        match self {
            Self::Communication(r) => r.seq,
            Self::Payment(r) => r.seq,
            Self::PageView(r) => r.seq,
        }
    }

    pub fn debtor_id(&self) -> Uuid {
        match self {
            Self::Communication(r) => r.debtor_id,
            Self::Payment(r) => r.debtor_id,
            Self::PageView(r) => r.debtor_id,
        }
    }
}

/// Input to [`EventLedger::append`].
#[derive(Debug, Clone)]
pub enum NewEntry {
    Communication(NewCommunication),
    Payment(NewPayment),
    PageView(NewPageView),
}

/// A duplicate is a success: the stored entry is returned unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome<T> {
    Appended(T),
    Duplicate(T),
}

impl<T> AppendOutcome<T> {
    pub fn entry(&self) -> &T {
        match self {
            Self::Appended(e) | Self::Duplicate(e) => e,
        }
    }

    pub fn into_entry(self) -> T {
        match self {
            Self::Appended(e) | Self::Duplicate(e) => e,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AppendOutcome<U> {
        match self {
            Self::Appended(e) => AppendOutcome::Appended(f(e)),
            Self::Duplicate(e) => AppendOutcome::Duplicate(f(e)),
        }
    }
}

impl<T> From<InsertOutcome<T>> for AppendOutcome<T> {
    fn from(outcome: InsertOutcome<T>) -> Self {
        match outcome {
            InsertOutcome::Inserted(r) => Self::Appended(r),
            InsertOutcome::Existing(r) => Self::Duplicate(r),
        }
    }
}

/// A debtor's ledger, ordered by `occurred_at` with insertion order breaking ties.
///
/// Materialized once per `list` call; iterating it any number of times yields
/// the same sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn from_entries(mut entries: Vec<LedgerEntry>) -> Self {
        entries.sort_by_key(|e| (e.occurred_at(), e.seq()));
        Self { entries }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LedgerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn communications(&self) -> impl Iterator<Item = &CommunicationRecord> + '_ {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::Communication(r) => Some(r),
            _ => None,
        })
    }

    pub fn payments(&self) -> impl Iterator<Item = &PaymentRecord> + '_ {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::Payment(r) => Some(r),
            _ => None,
        })
    }

    pub fn page_views(&self) -> impl Iterator<Item = &PageViewRecord> + '_ {
        self.entries.iter().filter_map(|e| match e {
            LedgerEntry::PageView(r) => Some(r),
            _ => None,
        })
    }

    /// Analytics-only engagement score over page-view events.
    pub fn engagement_score(&self) -> i64 {
        self.page_views()
            .map(|v| engagement_points(v.event.as_deref().unwrap_or("page_visit")))
            .sum()
    }
}

impl<'a> IntoIterator for &'a Ledger {
    type Item = &'a LedgerEntry;
    type IntoIter = std::slice::Iter<'a, LedgerEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Points per tracked page event. Unknown events score zero.
pub fn engagement_points(event: &str) -> i64 {
    match event {
        "payment_page_visit" => 15,
        "payment_button_click" => 20,
        "contact_button_click" => 10,
        "payment_success_page_visit" => 50,
        "receipt_download" => 5,
        "payment_form_started" => 20,
        "payment_form_completed" => 50,
        "payment_form_abandoned" => -5,
        "page_visit" => 5,
        "time_on_page_high" => 10,
        _ => 0,
    }
}

/// Writes and reads the per-debtor event ledger.
#[derive(Clone)]
pub struct EventLedger {
    db: Arc<dyn Database>,
}

impl EventLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: NewEntry) -> Result<AppendOutcome<LedgerEntry>, DatabaseError> {
        match entry {
            NewEntry::Communication(input) => Ok(self
                .append_communication(&input)
                .await?
                .map(LedgerEntry::Communication)),
            NewEntry::Payment(input) => Ok(self
                .append_payment(&input)
                .await?
                .map(LedgerEntry::Payment)),
            NewEntry::PageView(input) => Ok(AppendOutcome::Appended(LedgerEntry::PageView(
                self.append_page_view(&input).await?,
            ))),
        }
    }

    pub async fn append_communication(
        &self,
        input: &NewCommunication,
    ) -> Result<AppendOutcome<CommunicationRecord>, DatabaseError> {
        let outcome: AppendOutcome<_> = self.db.append_communication(input).await?.into();
        let record = outcome.entry();
        if outcome.is_duplicate() {
            tracing::debug!(
                debtor_id = %record.debtor_id,
                channel = record.channel.as_str(),
                provider_message_id = %record.provider_message_id,
                provider_status = %record.provider_status,
                "Duplicate communication event ignored"
            );
        } else {
            tracing::debug!(
                debtor_id = %record.debtor_id,
                channel = record.channel.as_str(),
                provider_message_id = %record.provider_message_id,
                status = record.status.as_str(),
                seq = record.seq,
                "Communication event appended"
            );
        }
        Ok(outcome)
    }

    pub async fn append_payment(
        &self,
        input: &NewPayment,
    ) -> Result<AppendOutcome<PaymentRecord>, DatabaseError> {
        let outcome: AppendOutcome<_> = self.db.append_payment(input).await?.into();
        let record = outcome.entry();
        if outcome.is_duplicate() {
            tracing::debug!(
                debtor_id = %record.debtor_id,
                provider = %record.provider,
                provider_payment_id = %record.provider_payment_id,
                "Duplicate payment event ignored"
            );
        } else {
            tracing::debug!(
                debtor_id = %record.debtor_id,
                provider = %record.provider,
                provider_payment_id = %record.provider_payment_id,
                status = record.status.as_str(),
                seq = record.seq,
                "Payment event appended"
            );
        }
        Ok(outcome)
    }

    pub async fn append_page_view(&self, input: &NewPageView) -> Result<PageViewRecord, DatabaseError> {
        self.db.append_page_view(input).await
    }

    /// Ordered ledger for a debtor, optionally restricted to one record set.
    pub async fn list(
        &self,
        debtor_id: Uuid,
        kind: Option<LedgerKind>,
    ) -> Result<Ledger, DatabaseError> {
        let mut entries = Vec::new();
        if matches!(kind, None | Some(LedgerKind::Communication)) {
            entries.extend(
                self.db
                    .list_communications(debtor_id)
                    .await?
                    .into_iter()
                    .map(LedgerEntry::Communication),
            );
        }
        if matches!(kind, None | Some(LedgerKind::Payment)) {
            entries.extend(
                self.db
                    .list_payments(debtor_id)
                    .await?
                    .into_iter()
                    .map(LedgerEntry::Payment),
            );
        }
        if matches!(kind, None | Some(LedgerKind::PageView)) {
            entries.extend(
                self.db
                    .list_page_views(debtor_id)
                    .await?
                    .into_iter()
                    .map(LedgerEntry::PageView),
            );
        }
        Ok(Ledger::from_entries(entries))
    }

    /// Changes whenever a status-relevant entry is appended for the debtor.
    pub async fn version(&self, debtor_id: Uuid) -> Result<i64, DatabaseError> {
        self.db.ledger_version(debtor_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::{AppendOutcome, EventLedger, LedgerEntry, LedgerKind, NewEntry, engagement_points};
    use crate::db::{
        Channel, CommunicationStatus, Direction, NewCommunication, NewPageView, NewPayment,
        PaymentStatus,
    };
    use crate::testing::{seed_debtor, test_db};

    fn email_event(debtor_id: uuid::Uuid, pid: &str, raw: &str, at_min: i64) -> NewCommunication {
        NewCommunication {
            debtor_id,
            channel: Channel::Email,
            direction: Direction::Outbound,
            provider_message_id: pid.to_string(),
            message_ref: None,
            status: match raw {
                "delivery" => CommunicationStatus::Delivered,
                _ => CommunicationStatus::Sent,
            },
            provider_status: raw.to_string(),
            detail: None,
            occurred_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
                + Duration::minutes(at_min),
        }
    }

    #[tokio::test]
    async fn duplicate_communication_returns_stored_entry() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "a@example.com", "+1555").await;
        let ledger = EventLedger::new(db);

        let first = ledger
            .append_communication(&email_event(debtor.id, "m1", "delivery", 0))
            .await
            .expect("append");
        assert!(matches!(first, AppendOutcome::Appended(_)));

        let mut replay = email_event(debtor.id, "m1", "delivery", 5);
        replay.detail = Some("redelivered".into());
        let second = ledger.append_communication(&replay).await.expect("replay");
        assert!(second.is_duplicate());
        assert_eq!(second.entry(), first.entry());

        let listed = ledger
            .list(debtor.id, Some(LedgerKind::Communication))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_append_exactly_once() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "race@example.com", "+1559").await;
        let ledger = EventLedger::new(db);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let event = email_event(debtor.id, "m-race", "delivery", 0);
            tasks.spawn(async move { ledger.append_communication(&event).await });
        }

        let mut appended = 0;
        let mut entries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.expect("task").expect("append");
            if !outcome.is_duplicate() {
                appended += 1;
            }
            entries.push(outcome.into_entry());
        }
        assert_eq!(appended, 1);
        assert!(entries.windows(2).all(|pair| pair[0] == pair[1]));

        let listed = ledger
            .list(debtor.id, Some(LedgerKind::Communication))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_payment_is_not_an_error() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "b@example.com", "+1556").await;
        let ledger = EventLedger::new(db);
        let payment = NewPayment {
            debtor_id: debtor.id,
            provider: "stripe".into(),
            provider_payment_id: "pay_9".into(),
            payment_link_id: None,
            amount: dec!(40.00),
            currency: "usd".into(),
            status: PaymentStatus::Succeeded,
            provider_status: "succeeded".into(),
            occurred_at: Utc::now(),
        };

        let first = ledger
            .append(NewEntry::Payment(payment.clone()))
            .await
            .expect("append");
        let second = ledger
            .append(NewEntry::Payment(payment))
            .await
            .expect("replay");
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.into_entry(), second.into_entry());
        assert_eq!(ledger.list(debtor.id, None).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn list_orders_by_time_then_insertion() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "c@example.com", "+1557").await;
        let ledger = EventLedger::new(db);

        // Later event first, then two events sharing one timestamp.
        ledger
            .append_communication(&email_event(debtor.id, "m2", "delivery", 10))
            .await
            .expect("late");
        ledger
            .append_communication(&email_event(debtor.id, "m2", "send", 1))
            .await
            .expect("tie a");
        let tie_at = Utc.with_ymd_and_hms(2026, 5, 1, 9, 1, 0).unwrap();
        ledger
            .append_page_view(&NewPageView {
                debtor_id: debtor.id,
                token: "tok_x".into(),
                path: "/pay/tok_x".into(),
                event: Some("payment_page_visit".into()),
                user_agent: None,
                occurred_at: tie_at,
            })
            .await
            .expect("tie b");

        let listed = ledger.list(debtor.id, None).await.expect("list");
        let kinds: Vec<&str> = listed
            .iter()
            .map(|e| match e {
                LedgerEntry::Communication(c) => c.provider_status.as_str(),
                LedgerEntry::PageView(_) => "page_view",
                LedgerEntry::Payment(_) => "payment",
            })
            .collect();
        assert_eq!(kinds, vec!["send", "page_view", "delivery"]);

        // Restartable: a second pass sees the same sequence.
        let again: Vec<i64> = (&listed).into_iter().map(|e| e.seq()).collect();
        let first: Vec<i64> = listed.iter().map(|e| e.seq()).collect();
        assert_eq!(first, again);
        assert_eq!(listed.engagement_score(), 15);
    }

    #[tokio::test]
    async fn page_views_are_never_deduplicated() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d@example.com", "+1558").await;
        let ledger = EventLedger::new(db);
        let view = NewPageView {
            debtor_id: debtor.id,
            token: "tok_y".into(),
            path: "/debtor/tok_y".into(),
            event: None,
            user_agent: Some("test".into()),
            occurred_at: Utc::now(),
        };
        ledger.append(NewEntry::PageView(view.clone())).await.expect("first");
        ledger.append(NewEntry::PageView(view)).await.expect("second");

        let listed = ledger
            .list(debtor.id, Some(LedgerKind::PageView))
            .await
            .expect("list");
        assert_eq!(listed.page_views().count(), 2);
        assert_eq!(listed.engagement_score(), 10);
        // Page views do not move the status version.
        assert_eq!(ledger.version(debtor.id).await.expect("version"), 0);
    }

    #[test]
    fn engagement_points_cover_known_events() {
        assert_eq!(engagement_points("payment_form_completed"), 50);
        assert_eq!(engagement_points("payment_form_abandoned"), -5);
        assert_eq!(engagement_points("scrolled"), 0);
    }
}
