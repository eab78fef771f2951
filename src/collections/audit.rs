//! Hash-chained JSONL audit trail for security-relevant collection events.
//!
//! Webhook rejections, unknown-debtor acknowledgements, and token lifecycle
//! changes land here in addition to the tracing output. Token values never do.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AuditConfig;

/// Running counters embedded in every audit line.
#[derive(Debug, Default, Clone, Serialize)]
struct Counters {
    rejected_webhooks: u64,
    unknown_debtors: u64,
    revoked_tokens: u64,
}

#[derive(Debug, Serialize)]
struct AuditLine<'a> {
    ts: String,
    event_type: &'a str,
    details: serde_json::Value,
    counters: Counters,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Default)]
struct Chain {
    head: Option<String>,
    counters: Counters,
}

struct AuditLogger {
    path: PathBuf,
    hash_chain: bool,
    chain: Mutex<Chain>,
}

impl AuditLogger {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            chain: Mutex::new(Chain::default()),
        }
    }

    fn bump(&self, update: impl FnOnce(&mut Counters)) {
        if let Ok(mut chain) = self.chain.lock() {
            update(&mut chain.counters);
        }
    }

    fn write(&self, event_type: &str, details: serde_json::Value) {
        // Held through the append so the counter snapshot and chain head match the file.
        let mut chain = match self.chain.lock() {
            Ok(chain) => chain,
            Err(e) => {
                tracing::warn!("Audit chain lock poisoned: {}", e);
                return;
            }
        };

        let mut line = AuditLine {
            ts: Utc::now().to_rfc3339(),
            event_type,
            details,
            counters: chain.counters.clone(),
            prev_hash: chain.head.clone(),
            hash: None,
        };
        let result = serde_json::to_string(&line)
            .and_then(|unhashed| {
                if self.hash_chain {
                    line.hash = Some(format!("{:x}", Sha256::digest(unhashed.as_bytes())));
                    serde_json::to_string(&line)
                } else {
                    Ok(unhashed)
                }
            })
            .map_err(io::Error::other)
            .and_then(|json| append_owner_only(&self.path, &json));

        match result {
            Ok(()) => {
                if line.hash.is_some() {
                    chain.head = line.hash;
                }
            }
            Err(e) => {
                tracing::warn!(path = ?self.path, event_type, "Failed to append audit event: {}", e)
            }
        }
    }
}

/// Append one line, creating the file 0600. An existing file with a broader
/// mode is refused rather than tightened.
fn append_owner_only(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;

    #[cfg(unix)]
    {
        let mode = file.metadata()?.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("insecure mode {mode:o} (expected 600)"),
            ));
        }
    }

    writeln!(file, "{line}")
}

static LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Install the process-wide audit logger. Later calls are ignored.
pub fn init(config: &AuditConfig) {
    if !config.enabled {
        return;
    }
    let _ = LOGGER.set(AuditLogger::new(config.path.clone(), config.hash_chain));
}

pub fn record(event_type: &str, details: serde_json::Value) {
    if let Some(logger) = LOGGER.get() {
        logger.write(event_type, details);
    }
}

pub fn inc_rejected_webhook() {
    if let Some(logger) = LOGGER.get() {
        logger.bump(|c| c.rejected_webhooks += 1);
    }
}

pub fn inc_unknown_debtor() {
    if let Some(logger) = LOGGER.get() {
        logger.bump(|c| c.unknown_debtors += 1);
    }
}

pub fn inc_revoked_tokens(count: u64) {
    if let Some(logger) = LOGGER.get() {
        logger.bump(|c| c.revoked_tokens += count);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::AuditLogger;

    fn lines(path: &std::path::Path) -> Vec<Value> {
        fs::read_to_string(path)
            .expect("read audit log")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[test]
    fn hash_chain_links_consecutive_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(path.clone(), true);

        logger.write("webhook_rejected", serde_json::json!({"provider": "email"}));
        logger.bump(|c| c.rejected_webhooks += 1);
        logger.write("webhook_rejected", serde_json::json!({"provider": "stripe"}));

        let lines = lines(&path);
        assert_eq!(lines.len(), 2);
        let first_hash = lines[0]["hash"].as_str().expect("first hash");
        assert!(lines[0].get("prev_hash").is_none());
        assert_eq!(lines[1]["prev_hash"].as_str(), Some(first_hash));
        assert_eq!(lines[0]["counters"]["rejected_webhooks"], 0);
        assert_eq!(lines[1]["counters"]["rejected_webhooks"], 1);
    }

    #[test]
    fn unchained_lines_carry_no_hashes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(path.clone(), false);
        logger.write("token_issued", serde_json::json!({"replaced": 0}));
        logger.write("token_issued", serde_json::json!({"replaced": 1}));

        for line in lines(&path) {
            assert!(line.get("hash").is_none());
            assert!(line.get("prev_hash").is_none());
        }
    }

    #[cfg(unix)]
    #[test]
    fn refused_write_does_not_advance_the_chain() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "").expect("seed file");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let logger = AuditLogger::new(path.clone(), true);
        logger.write("token_revoked", serde_json::json!({"count": 1}));
        assert_eq!(fs::read_to_string(&path).expect("read"), "");

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");
        logger.write("token_revoked", serde_json::json!({"count": 2}));
        let lines = lines(&path);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].get("prev_hash").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn new_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("audit.jsonl");
        AuditLogger::new(path.clone(), false).write("token_issued", serde_json::json!({}));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
