//! Shared helpers for unit tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::db::{CreateDebtorParams, Database, DebtorRecord};

/// Fresh migrated libSQL database in a temp dir. Keep the `TempDir` alive for
/// the duration of the test.
#[cfg(feature = "libsql")]
pub(crate) async fn test_db() -> (Arc<dyn Database>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let backend = crate::db::libsql::LibSqlBackend::new_local(&path)
        .await
        .expect("open libsql");
    backend.run_migrations().await.expect("migrations");
    (Arc::new(backend), dir)
}

pub(crate) async fn seed_debtor(db: &Arc<dyn Database>, email: &str, phone: &str) -> DebtorRecord {
    db.create_debtor(&CreateDebtorParams {
        first_name: "Test".to_string(),
        last_name: "Debtor".to_string(),
        email: Some(email.to_string()),
        phone: Some(phone.to_string()),
    })
    .await
    .expect("seed debtor")
}
