use chrono::Utc;
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    Channel, CommunicationRecord, CommunicationStatus, Direction, InsertOutcome, LedgerStore,
    NewCommunication, NewPageView, NewPayment, PageViewRecord, PaymentRecord, PaymentStatus,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, finish_tx, fmt_ts, get_i64, get_opt_text, get_text, opt_text, parse_timestamp,
    parse_uuid,
};

const COMMUNICATION_COLUMNS: &str = "id, seq, debtor_id, channel, direction, provider_message_id, \
     message_ref, status, provider_status, detail, occurred_at, recorded_at";
const PAYMENT_COLUMNS: &str = "id, seq, debtor_id, provider, provider_payment_id, payment_link_id, \
     amount, currency, status, provider_status, occurred_at, recorded_at";
const PAGE_VIEW_COLUMNS: &str =
    "id, seq, debtor_id, token, path, event, user_agent, occurred_at, recorded_at";

fn row_to_communication_record(row: &libsql::Row) -> Result<CommunicationRecord, DatabaseError> {
    let channel_raw = get_text(row, 3);
    let direction_raw = get_text(row, 4);
    let status_raw = get_text(row, 7);
    Ok(CommunicationRecord {
        id: parse_uuid(&get_text(row, 0), "communications.id")?,
        seq: get_i64(row, 1),
        debtor_id: parse_uuid(&get_text(row, 2), "communications.debtor_id")?,
        channel: Channel::from_db_value(&channel_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid channel '{}'", channel_raw))
        })?,
        direction: Direction::from_db_value(&direction_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid direction '{}'", direction_raw))
        })?,
        provider_message_id: get_text(row, 5),
        message_ref: get_opt_text(row, 6),
        status: CommunicationStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid communication status '{}'", status_raw))
        })?,
        provider_status: get_text(row, 8),
        detail: get_opt_text(row, 9),
        occurred_at: parse_timestamp(&get_text(row, 10))?,
        recorded_at: parse_timestamp(&get_text(row, 11))?,
    })
}

fn row_to_payment_record(row: &libsql::Row) -> Result<PaymentRecord, DatabaseError> {
    let amount_raw = get_text(row, 6);
    let status_raw = get_text(row, 8);
    Ok(PaymentRecord {
        id: parse_uuid(&get_text(row, 0), "payments.id")?,
        seq: get_i64(row, 1),
        debtor_id: parse_uuid(&get_text(row, 2), "payments.debtor_id")?,
        provider: get_text(row, 3),
        provider_payment_id: get_text(row, 4),
        payment_link_id: get_opt_text(row, 5),
        amount: amount_raw.parse::<Decimal>().map_err(|e| {
            DatabaseError::Serialization(format!("invalid amount '{}': {}", amount_raw, e))
        })?,
        currency: get_text(row, 7),
        status: PaymentStatus::from_db_value(&status_raw).ok_or_else(|| {
            DatabaseError::Serialization(format!("invalid payment status '{}'", status_raw))
        })?,
        provider_status: get_text(row, 9),
        occurred_at: parse_timestamp(&get_text(row, 10))?,
        recorded_at: parse_timestamp(&get_text(row, 11))?,
    })
}

fn row_to_page_view_record(row: &libsql::Row) -> Result<PageViewRecord, DatabaseError> {
    Ok(PageViewRecord {
        id: parse_uuid(&get_text(row, 0), "page_views.id")?,
        seq: get_i64(row, 1),
        debtor_id: parse_uuid(&get_text(row, 2), "page_views.debtor_id")?,
        token: get_text(row, 3),
        path: get_text(row, 4),
        event: get_opt_text(row, 5),
        user_agent: get_opt_text(row, 6),
        occurred_at: parse_timestamp(&get_text(row, 7))?,
        recorded_at: parse_timestamp(&get_text(row, 8))?,
    })
}

impl LibSqlBackend {
    async fn communication_by_key(
        conn: &libsql::Connection,
        channel: Channel,
        provider_message_id: &str,
        provider_status: &str,
    ) -> Result<Option<CommunicationRecord>, DatabaseError> {
        let row = conn
            .query(
                &format!(
                    "SELECT {COMMUNICATION_COLUMNS} FROM communications \
                     WHERE channel = ?1 AND provider_message_id = ?2 AND provider_status = ?3 LIMIT 1"
                ),
                params![channel.as_str(), provider_message_id, provider_status],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_communication_record(&row)).transpose()
    }

    async fn payment_by_key(
        conn: &libsql::Connection,
        provider: &str,
        provider_payment_id: &str,
        provider_status: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let row = conn
            .query(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments \
                     WHERE provider = ?1 AND provider_payment_id = ?2 AND provider_status = ?3 LIMIT 1"
                ),
                params![provider, provider_payment_id, provider_status],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_payment_record(&row)).transpose()
    }
}

#[async_trait::async_trait]
impl LedgerStore for LibSqlBackend {
    async fn append_communication(
        &self,
        input: &NewCommunication,
    ) -> Result<InsertOutcome<CommunicationRecord>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = async {
            let seq = Self::next_sequence(&conn, "communication").await?;
            let inserted = conn
                .execute(
                    "INSERT INTO communications \
                     (id, seq, debtor_id, channel, direction, provider_message_id, message_ref, \
                      status, provider_status, detail, occurred_at, recorded_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT (channel, provider_message_id, provider_status) DO NOTHING",
                    params![
                        Uuid::new_v4().to_string(),
                        seq,
                        input.debtor_id.to_string(),
                        input.channel.as_str(),
                        input.direction.as_str(),
                        input.provider_message_id.as_str(),
                        opt_text(input.message_ref.as_deref()),
                        input.status.as_str(),
                        input.provider_status.as_str(),
                        opt_text(input.detail.as_deref()),
                        fmt_ts(&input.occurred_at),
                        fmt_ts(&Utc::now()),
                    ],
                )
                .await?;

            let record = Self::communication_by_key(
                &conn,
                input.channel,
                &input.provider_message_id,
                &input.provider_status,
            )
            .await?
            .ok_or_else(|| {
                DatabaseError::Query("failed to load communication after append".to_string())
            })?;

            Ok::<_, DatabaseError>(if inserted > 0 {
                InsertOutcome::Inserted(record)
            } else {
                InsertOutcome::Existing(record)
            })
        }
        .await;

        // A duplicate reserved a sequence number it will never use; rolling back returns it.
        match result {
            Ok(InsertOutcome::Existing(record)) => {
                conn.execute("ROLLBACK", ()).await?;
                Ok(InsertOutcome::Existing(record))
            }
            other => finish_tx(&conn, other).await,
        }
    }

    async fn append_payment(
        &self,
        input: &NewPayment,
    ) -> Result<InsertOutcome<PaymentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = async {
            let seq = Self::next_sequence(&conn, "payment").await?;
            let inserted = conn
                .execute(
                    "INSERT INTO payments \
                     (id, seq, debtor_id, provider, provider_payment_id, payment_link_id, amount, \
                      currency, status, provider_status, occurred_at, recorded_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT (provider, provider_payment_id, provider_status) DO NOTHING",
                    params![
                        Uuid::new_v4().to_string(),
                        seq,
                        input.debtor_id.to_string(),
                        input.provider.as_str(),
                        input.provider_payment_id.as_str(),
                        opt_text(input.payment_link_id.as_deref()),
                        input.amount.to_string(),
                        input.currency.as_str(),
                        input.status.as_str(),
                        input.provider_status.as_str(),
                        fmt_ts(&input.occurred_at),
                        fmt_ts(&Utc::now()),
                    ],
                )
                .await?;

            let record = Self::payment_by_key(
                &conn,
                &input.provider,
                &input.provider_payment_id,
                &input.provider_status,
            )
            .await?
            .ok_or_else(|| {
                DatabaseError::Query("failed to load payment after append".to_string())
            })?;

            Ok::<_, DatabaseError>(if inserted > 0 {
                InsertOutcome::Inserted(record)
            } else {
                InsertOutcome::Existing(record)
            })
        }
        .await;

        match result {
            Ok(InsertOutcome::Existing(record)) => {
                conn.execute("ROLLBACK", ()).await?;
                Ok(InsertOutcome::Existing(record))
            }
            other => finish_tx(&conn, other).await,
        }
    }

    async fn append_page_view(&self, input: &NewPageView) -> Result<PageViewRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = async {
            let id = Uuid::new_v4().to_string();
            let seq = Self::next_sequence(&conn, "page_view").await?;
            conn.execute(
                "INSERT INTO page_views \
                 (id, seq, debtor_id, token, path, event, user_agent, occurred_at, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.as_str(),
                    seq,
                    input.debtor_id.to_string(),
                    input.token.as_str(),
                    input.path.as_str(),
                    opt_text(input.event.as_deref()),
                    opt_text(input.user_agent.as_deref()),
                    fmt_ts(&input.occurred_at),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await?;

            let row = conn
                .query(
                    &format!("SELECT {PAGE_VIEW_COLUMNS} FROM page_views WHERE id = ?1 LIMIT 1"),
                    params![id.as_str()],
                )
                .await?
                .next()
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load page view".to_string()))?;
            row_to_page_view_record(&row)
        }
        .await;

        finish_tx(&conn, result).await
    }

    async fn list_communications(
        &self,
        debtor_id: Uuid,
    ) -> Result<Vec<CommunicationRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {COMMUNICATION_COLUMNS} FROM communications \
                     WHERE debtor_id = ?1 ORDER BY occurred_at ASC, seq ASC"
                ),
                params![debtor_id.to_string()],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_communication_record(&row)?);
        }
        Ok(out)
    }

    async fn list_payments(&self, debtor_id: Uuid) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments \
                     WHERE debtor_id = ?1 ORDER BY occurred_at ASC, seq ASC"
                ),
                params![debtor_id.to_string()],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_payment_record(&row)?);
        }
        Ok(out)
    }

    async fn list_page_views(&self, debtor_id: Uuid) -> Result<Vec<PageViewRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PAGE_VIEW_COLUMNS} FROM page_views \
                     WHERE debtor_id = ?1 ORDER BY occurred_at ASC, seq ASC"
                ),
                params![debtor_id.to_string()],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_page_view_record(&row)?);
        }
        Ok(out)
    }

    async fn ledger_version(&self, debtor_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT MAX(v) FROM ( \
                   SELECT COALESCE(MAX(seq), 0) AS v FROM communications WHERE debtor_id = ?1 \
                   UNION ALL \
                   SELECT COALESCE(MAX(seq), 0) FROM payments WHERE debtor_id = ?1 \
                 )",
                params![debtor_id.to_string()],
            )
            .await?
            .next()
            .await?;
        Ok(row.map(|row| get_i64(&row, 0)).unwrap_or(0))
    }

    async fn find_communication_owner(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<(Uuid, Option<String>)>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT debtor_id, message_ref FROM communications \
                 WHERE channel = ?1 AND provider_message_id = ?2 \
                 ORDER BY seq ASC LIMIT 1",
                params![channel.as_str(), provider_message_id],
            )
            .await?
            .next()
            .await?;

        row.map(|row| {
            Ok((
                parse_uuid(&get_text(&row, 0), "communications.debtor_id")?,
                get_opt_text(&row, 1),
            ))
        })
        .transpose()
    }

    async fn find_payment_owner(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> Result<Option<(Uuid, Option<String>)>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT debtor_id, payment_link_id FROM payments \
                 WHERE provider = ?1 AND provider_payment_id = ?2 \
                 ORDER BY seq ASC LIMIT 1",
                params![provider, provider_payment_id],
            )
            .await?
            .next()
            .await?;

        row.map(|row| {
            Ok((
                parse_uuid(&get_text(&row, 0), "payments.debtor_id")?,
                get_opt_text(&row, 1),
            ))
        })
        .transpose()
    }
}
