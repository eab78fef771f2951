use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{
    AccessTokenRecord, CreateDebtorParams, DebtorRecord, DebtorStore, NewAccessToken, TokenStore,
    UpdateDebtorParams,
};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, finish_tx, fmt_ts, get_opt_text, get_text, opt_text, parse_opt_timestamp,
    parse_timestamp, parse_uuid,
};

const DEBTOR_COLUMNS: &str = "id, first_name, last_name, email, phone, created_at, updated_at";
const TOKEN_COLUMNS: &str = "debtor_id, token_hash, sealed_token, issued_at, revoked_at";

fn row_to_debtor_record(row: &libsql::Row) -> Result<DebtorRecord, DatabaseError> {
    Ok(DebtorRecord {
        id: parse_uuid(&get_text(row, 0), "debtors.id")?,
        first_name: get_text(row, 1),
        last_name: get_text(row, 2),
        email: get_opt_text(row, 3),
        phone: get_opt_text(row, 4),
        created_at: parse_timestamp(&get_text(row, 5))?,
        updated_at: parse_timestamp(&get_text(row, 6))?,
    })
}

fn row_to_token_record(row: &libsql::Row) -> Result<AccessTokenRecord, DatabaseError> {
    Ok(AccessTokenRecord {
        debtor_id: parse_uuid(&get_text(row, 0), "access_tokens.debtor_id")?,
        token_hash: get_text(row, 1),
        sealed_token: get_text(row, 2),
        issued_at: parse_timestamp(&get_text(row, 3))?,
        revoked_at: parse_opt_timestamp(get_opt_text(row, 4))?,
    })
}

/// Trim, and treat blank contact values as absent.
fn clean_contact(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

async fn insert_debtor(
    conn: &libsql::Connection,
    input: &CreateDebtorParams,
) -> Result<String, DatabaseError> {
    let first_name = input.first_name.trim();
    if first_name.is_empty() {
        return Err(DatabaseError::Serialization(
            "debtor first name cannot be empty".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = fmt_ts(&Utc::now());
    let email = clean_contact(input.email.as_deref()).map(|e| normalize_email(&e));
    conn.execute(
        "INSERT INTO debtors (id, first_name, last_name, email, phone, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            id.as_str(),
            first_name,
            input.last_name.trim(),
            opt_text(email.as_deref()),
            opt_text(clean_contact(input.phone.as_deref()).as_deref()),
            now.as_str(),
        ],
    )
    .await?;
    Ok(id)
}

async fn debtor_by_id(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<DebtorRecord>, DatabaseError> {
    let row = conn
        .query(
            &format!("SELECT {DEBTOR_COLUMNS} FROM debtors WHERE id = ?1 LIMIT 1"),
            params![id],
        )
        .await?
        .next()
        .await?;

    row.map(|row| row_to_debtor_record(&row)).transpose()
}

async fn insert_token(
    conn: &libsql::Connection,
    debtor_id: &str,
    token: &NewAccessToken,
) -> Result<AccessTokenRecord, DatabaseError> {
    conn.execute(
        "INSERT INTO access_tokens (token_hash, sealed_token, debtor_id, issued_at, revoked_at) \
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![
            token.token_hash.as_str(),
            token.sealed_token.as_str(),
            debtor_id,
            fmt_ts(&Utc::now()),
        ],
    )
    .await?;

    let row = conn
        .query(
            &format!("SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE token_hash = ?1 LIMIT 1"),
            params![token.token_hash.as_str()],
        )
        .await?
        .next()
        .await?
        .ok_or_else(|| DatabaseError::Query("failed to load issued token".to_string()))?;

    row_to_token_record(&row)
}

#[async_trait::async_trait]
impl DebtorStore for LibSqlBackend {
    async fn create_debtor(&self, input: &CreateDebtorParams) -> Result<DebtorRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = insert_debtor(&conn, input).await?;
        debtor_by_id(&conn, &id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created debtor".to_string()))
    }

    async fn create_debtor_with_token(
        &self,
        input: &CreateDebtorParams,
        token: &NewAccessToken,
    ) -> Result<(DebtorRecord, AccessTokenRecord), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = async {
            let id = insert_debtor(&conn, input).await?;
            let record = insert_token(&conn, &id, token).await?;
            let debtor = debtor_by_id(&conn, &id)
                .await?
                .ok_or_else(|| DatabaseError::Query("failed to load created debtor".to_string()))?;
            Ok::<_, DatabaseError>((debtor, record))
        }
        .await;

        finish_tx(&conn, result).await
    }

    async fn get_debtor(&self, id: Uuid) -> Result<Option<DebtorRecord>, DatabaseError> {
        let conn = self.connect().await?;
        debtor_by_id(&conn, &id.to_string()).await
    }

    async fn update_debtor(
        &self,
        id: Uuid,
        input: &UpdateDebtorParams,
    ) -> Result<Option<DebtorRecord>, DatabaseError> {
        let Some(existing) = self.get_debtor(id).await? else {
            return Ok(None);
        };

        let merged_first = input
            .first_name
            .as_deref()
            .unwrap_or(existing.first_name.as_str())
            .trim()
            .to_string();
        if merged_first.is_empty() {
            return Err(DatabaseError::Serialization(
                "debtor first name cannot be empty".to_string(),
            ));
        }
        let merged_last = input
            .last_name
            .as_deref()
            .unwrap_or(existing.last_name.as_str())
            .trim()
            .to_string();
        let merged_email = match &input.email {
            Some(value) => clean_contact(value.as_deref()).map(|e| normalize_email(&e)),
            None => existing.email,
        };
        let merged_phone = match &input.phone {
            Some(value) => clean_contact(value.as_deref()),
            None => existing.phone,
        };

        let conn = self.connect().await?;
        conn.execute(
            "UPDATE debtors SET \
               first_name = ?2, \
               last_name = ?3, \
               email = ?4, \
               phone = ?5, \
               updated_at = ?6 \
             WHERE id = ?1",
            params![
                id.to_string(),
                merged_first,
                merged_last,
                opt_text(merged_email.as_deref()),
                opt_text(merged_phone.as_deref()),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.get_debtor(id).await
    }

    async fn find_debtor_by_email(&self, email: &str) -> Result<Option<DebtorRecord>, DatabaseError> {
        let normalized = normalize_email(email);
        if normalized.is_empty() {
            return Ok(None);
        }
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {DEBTOR_COLUMNS} FROM debtors WHERE email = ?1 \
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![normalized],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_debtor_record(&row)).transpose()
    }

    async fn find_debtor_by_phone(&self, phone: &str) -> Result<Option<DebtorRecord>, DatabaseError> {
        let trimmed = phone.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {DEBTOR_COLUMNS} FROM debtors WHERE phone = ?1 \
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![trimmed],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_debtor_record(&row)).transpose()
    }
}

#[async_trait::async_trait]
impl TokenStore for LibSqlBackend {
    async fn replace_access_token(
        &self,
        debtor_id: Uuid,
        token: &NewAccessToken,
    ) -> Result<(AccessTokenRecord, u64), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        let result = async {
            let debtor_id = debtor_id.to_string();
            let revoked = conn
                .execute(
                    "UPDATE access_tokens SET revoked_at = ?2 \
                     WHERE debtor_id = ?1 AND revoked_at IS NULL",
                    params![debtor_id.as_str(), fmt_ts(&Utc::now())],
                )
                .await?;
            let record = insert_token(&conn, &debtor_id, token).await?;
            Ok::<_, DatabaseError>((record, revoked))
        }
        .await;

        finish_tx(&conn, result).await
    }

    async fn find_active_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessTokenRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM access_tokens \
                     WHERE token_hash = ?1 AND revoked_at IS NULL LIMIT 1"
                ),
                params![token_hash],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_token_record(&row)).transpose()
    }

    async fn active_token_for_debtor(
        &self,
        debtor_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM access_tokens \
                     WHERE debtor_id = ?1 AND revoked_at IS NULL \
                     ORDER BY issued_at DESC LIMIT 1"
                ),
                params![debtor_id.to_string()],
            )
            .await?
            .next()
            .await?;

        row.map(|row| row_to_token_record(&row)).transpose()
    }

    async fn revoke_tokens(&self, debtor_id: Uuid) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let revoked = conn
            .execute(
                "UPDATE access_tokens SET revoked_at = ?2 \
                 WHERE debtor_id = ?1 AND revoked_at IS NULL",
                params![debtor_id.to_string(), fmt_ts(&Utc::now())],
            )
            .await?;
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{CreateDebtorParams, NewAccessToken};
    use crate::testing::{seed_debtor, test_db};

    fn token_row(hash: &str) -> NewAccessToken {
        NewAccessToken {
            token_hash: hash.to_string(),
            sealed_token: format!("sealed-{hash}"),
        }
    }

    #[tokio::test]
    async fn replacing_a_token_leaves_one_active_row() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "one@example.com", "+15550100").await;

        let (_, revoked) = db
            .replace_access_token(debtor.id, &token_row("h1"))
            .await
            .unwrap();
        assert_eq!(revoked, 0);
        let (second, revoked) = db
            .replace_access_token(debtor.id, &token_row("h2"))
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        assert!(db.find_active_token("h1").await.unwrap().is_none());
        let active = db
            .active_token_for_debtor(debtor.id)
            .await
            .unwrap()
            .expect("active token");
        assert_eq!(active.token_hash, second.token_hash);
        assert_eq!(active.sealed_token, "sealed-h2");
    }

    #[tokio::test]
    async fn debtor_is_not_created_when_its_token_insert_fails() {
        let (db, _dir) = test_db().await;
        let existing = seed_debtor(&db, "first@example.com", "+15550101").await;
        db.replace_access_token(existing.id, &token_row("taken"))
            .await
            .unwrap();

        let input = CreateDebtorParams {
            first_name: "Second".into(),
            last_name: "Debtor".into(),
            email: Some("second@example.com".into()),
            phone: None,
        };
        assert!(
            db.create_debtor_with_token(&input, &token_row("taken"))
                .await
                .is_err()
        );
        assert!(
            db.find_debtor_by_email("second@example.com")
                .await
                .unwrap()
                .is_none()
        );

        let (debtor, token) = db
            .create_debtor_with_token(&input, &token_row("fresh"))
            .await
            .unwrap();
        assert_eq!(token.debtor_id, debtor.id);
        assert_eq!(debtor.email.as_deref(), Some("second@example.com"));
    }
}
