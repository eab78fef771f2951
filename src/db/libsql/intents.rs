use chrono::{DateTime, Utc};
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    Channel, CommunicationIntentRecord, IntentStore, NewPaymentLink, PaymentLinkRecord,
};
use crate::error::DatabaseError;

use super::{LibSqlBackend, fmt_ts, get_opt_text, get_text, parse_timestamp, parse_uuid};

const INTENT_COLUMNS: &str = "message_ref, debtor_id, channel, provider_message_id, created_at";
const LINK_COLUMNS: &str = "id, debtor_id, amount, currency, provider_link_id, url, created_at";

fn row_to_intent_record(row: &libsql::Row) -> Result<CommunicationIntentRecord, DatabaseError> {
    let channel_raw = get_text(row, 2);
    Ok(CommunicationIntentRecord {
        message_ref: get_text(row, 0),
        debtor_id: parse_uuid(&get_text(row, 1), "communication_intents.debtor_id")?,
        channel: Channel::from_db_value(&channel_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid channel '{}'", channel_raw))
        })?,
        provider_message_id: get_opt_text(row, 3),
        created_at: parse_timestamp(&get_text(row, 4))?,
    })
}

fn row_to_link_record(row: &libsql::Row) -> Result<PaymentLinkRecord, DatabaseError> {
    let amount_raw = get_text(row, 2);
    Ok(PaymentLinkRecord {
        id: get_text(row, 0),
        debtor_id: parse_uuid(&get_text(row, 1), "payment_links.debtor_id")?,
        amount: amount_raw.parse::<Decimal>().map_err(|e| {
            DatabaseError::Serialization(format!("invalid amount '{}': {}", amount_raw, e))
        })?,
        currency: get_text(row, 3),
        provider_link_id: get_opt_text(row, 4),
        url: get_opt_text(row, 5),
        created_at: parse_timestamp(&get_text(row, 6))?,
    })
}

#[async_trait::async_trait]
impl IntentStore for LibSqlBackend {
    async fn create_communication_intent(
        &self,
        message_ref: &str,
        debtor_id: Uuid,
        channel: Channel,
    ) -> Result<CommunicationIntentRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO communication_intents (message_ref, debtor_id, channel, provider_message_id, created_at) \
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                message_ref,
                debtor_id.to_string(),
                channel.as_str(),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.find_intent_by_ref(message_ref)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created intent".to_string()))
    }

    async fn bind_provider_message(
        &self,
        message_ref: &str,
        provider_message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE communication_intents SET provider_message_id = ?2 \
                 WHERE message_ref = ?1 AND provider_message_id IS NULL",
                params![message_ref, provider_message_id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn find_intent_by_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<CommunicationIntentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {INTENT_COLUMNS} FROM communication_intents WHERE message_ref = ?1 LIMIT 1"
                ),
                params![message_ref],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_intent_record(&row)).transpose()
    }

    async fn find_intent_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<CommunicationIntentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {INTENT_COLUMNS} FROM communication_intents \
                     WHERE channel = ?1 AND provider_message_id = ?2 LIMIT 1"
                ),
                params![channel.as_str(), provider_message_id],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_intent_record(&row)).transpose()
    }

    async fn create_payment_link(
        &self,
        input: &NewPaymentLink,
    ) -> Result<PaymentLinkRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO payment_links (id, debtor_id, amount, currency, provider_link_id, url, created_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5)",
            params![
                input.id.as_str(),
                input.debtor_id.to_string(),
                input.amount.to_string(),
                input.currency.as_str(),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_payment_link(&input.id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created payment link".to_string()))
    }

    async fn attach_provider_link(
        &self,
        link_id: &str,
        provider_link_id: &str,
        url: &str,
    ) -> Result<Option<PaymentLinkRecord>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE payment_links SET provider_link_id = ?2, url = ?3 WHERE id = ?1",
            params![link_id, provider_link_id, url],
        )
        .await?;

        self.get_payment_link(link_id).await
    }

    async fn get_payment_link(
        &self,
        link_id: &str,
    ) -> Result<Option<PaymentLinkRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {LINK_COLUMNS} FROM payment_links WHERE id = ?1 LIMIT 1"),
                params![link_id],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_link_record(&row)).transpose()
    }

    async fn list_unresolved_intents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CommunicationIntentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT i.message_ref, i.debtor_id, i.channel, i.provider_message_id, i.created_at \
                 FROM communication_intents i \
                 WHERE i.created_at < ?1 \
                   AND NOT EXISTS ( \
                     SELECT 1 FROM communications c \
                     WHERE c.message_ref = i.message_ref AND c.status <> 'queued' \
                   ) \
                 ORDER BY i.created_at ASC",
                params![fmt_ts(&cutoff)],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_intent_record(&row)?);
        }
        Ok(out)
    }

    async fn list_unpaid_links(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentLinkRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT l.id, l.debtor_id, l.amount, l.currency, l.provider_link_id, l.url, l.created_at \
                 FROM payment_links l \
                 WHERE l.created_at < ?1 \
                   AND NOT EXISTS (SELECT 1 FROM payments p WHERE p.payment_link_id = l.id) \
                 ORDER BY l.created_at ASC",
                params![fmt_ts(&cutoff)],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_link_record(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use crate::db::{
        Channel, CommunicationStatus, CreateDebtorParams, Direction, NewCommunication,
        NewPayment, NewPaymentLink, PaymentStatus,
    };
    use crate::testing::test_db;

    #[tokio::test]
    async fn intent_binds_provider_id_once() {
        let (db, _dir) = test_db().await;
        let debtor = db
            .create_debtor(&CreateDebtorParams {
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: Some("ada@example.com".into()),
                phone: None,
            })
            .await
            .unwrap();

        db.create_communication_intent("msg_a", debtor.id, Channel::Email)
            .await
            .unwrap();
        assert!(db.bind_provider_message("msg_a", "ses-1").await.unwrap());
        assert!(!db.bind_provider_message("msg_a", "ses-2").await.unwrap());

        let found = db
            .find_intent_by_provider_id(Channel::Email, "ses-1")
            .await
            .unwrap()
            .expect("bound intent");
        assert_eq!(found.message_ref, "msg_a");
        assert_eq!(found.debtor_id, debtor.id);
        assert!(
            db.find_intent_by_provider_id(Channel::Sms, "ses-1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sweep_queries_skip_resolved_rows() {
        let (db, _dir) = test_db().await;
        let debtor = db
            .create_debtor(&CreateDebtorParams {
                first_name: "Grace".into(),
                last_name: "Hopper".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        db.create_communication_intent("msg_open", debtor.id, Channel::Sms)
            .await
            .unwrap();
        db.create_communication_intent("msg_done", debtor.id, Channel::Sms)
            .await
            .unwrap();
        db.append_communication(&NewCommunication {
            debtor_id: debtor.id,
            channel: Channel::Sms,
            direction: Direction::Outbound,
            provider_message_id: "SM1".into(),
            message_ref: Some("msg_done".into()),
            status: CommunicationStatus::Delivered,
            provider_status: "delivered".into(),
            detail: None,
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();

        for id in ["pl_open", "pl_paid"] {
            db.create_payment_link(&NewPaymentLink {
                id: id.into(),
                debtor_id: debtor.id,
                amount: dec!(125.50),
                currency: "usd".into(),
            })
            .await
            .unwrap();
        }
        db.append_payment(&NewPayment {
            debtor_id: debtor.id,
            provider: "stripe".into(),
            provider_payment_id: "pi_1".into(),
            payment_link_id: Some("pl_paid".into()),
            amount: dec!(125.50),
            currency: "usd".into(),
            status: PaymentStatus::Succeeded,
            provider_status: "succeeded".into(),
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let intents = db.list_unresolved_intents(cutoff).await.unwrap();
        let refs: Vec<_> = intents.iter().map(|i| i.message_ref.as_str()).collect();
        assert_eq!(refs, vec!["msg_open"]);

        let links = db.list_unpaid_links(cutoff).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].id, "pl_open");
        assert_eq!(links[0].amount, dec!(125.50));

        let earlier = Utc::now() - Duration::hours(1);
        assert!(db.list_unresolved_intents(earlier).await.unwrap().is_empty());
    }
}
