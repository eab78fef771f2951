use std::path::{Component, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;

/// Signing secrets and replay window for inbound provider callbacks.
///
/// A missing secret leaves that provider's endpoint failing closed.
#[derive(Debug)]
pub struct WebhookConfig {
    pub email_secret: Option<SecretString>,
    pub payment_secret: Option<SecretString>,
    pub telephony_secret: Option<SecretString>,
    pub tolerance: Duration,
    pub max_persistence_retries: u32,
    pub retry_base_delay: Duration,
}

impl WebhookConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let tolerance_secs: u64 = parse_env("WEBHOOK_TOLERANCE_SECS", 300)?;
        if tolerance_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WEBHOOK_TOLERANCE_SECS".to_string(),
                message: "tolerance must be at least one second".to_string(),
            });
        }
        Ok(Self {
            email_secret: optional_env("EMAIL_WEBHOOK_SECRET")?.map(SecretString::from),
            payment_secret: optional_env("STRIPE_WEBHOOK_SECRET")?.map(SecretString::from),
            telephony_secret: optional_env("TELEPHONY_WEBHOOK_SECRET")?.map(SecretString::from),
            tolerance: Duration::from_secs(tolerance_secs),
            max_persistence_retries: parse_env("PERSISTENCE_MAX_RETRIES", 3)?,
            retry_base_delay: Duration::from_millis(parse_env("PERSISTENCE_RETRY_BASE_MS", 50)?),
        })
    }
}

/// Inputs to status derivation that are not part of the ledger.
#[derive(Debug, Clone)]
pub struct StatusPolicyConfig {
    pub inactivity_threshold: chrono::Duration,
    pub cache_capacity: usize,
}

impl StatusPolicyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let days: i64 = parse_env("INACTIVITY_THRESHOLD_DAYS", 30)?;
        if days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "INACTIVITY_THRESHOLD_DAYS".to_string(),
                message: "threshold must be a positive number of days".to_string(),
            });
        }
        Ok(Self {
            inactivity_threshold: chrono::Duration::days(days),
            cache_capacity: parse_env("STATUS_CACHE_CAPACITY", 1024)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub provider_timeout: Duration,
    pub default_currency: String,
}

impl DispatchConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let currency = parse_string_env("DEFAULT_CURRENCY", "usd")?;
        Ok(Self {
            provider_timeout: Duration::from_secs(parse_env("PROVIDER_TIMEOUT_SECS", 10)?),
            default_currency: validate_currency(&currency)?,
        })
    }
}

fn validate_currency(raw: &str) -> Result<String, ConfigError> {
    let code = raw.trim().to_ascii_lowercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ConfigError::InvalidValue {
            key: "DEFAULT_CURRENCY".to_string(),
            message: format!("'{raw}' is not a three-letter currency code"),
        });
    }
    Ok(code)
}

/// Key material for sealing stored access tokens.
///
/// Unset falls back to a per-process key: tokens keep validating across
/// restarts but outbound links cannot be rendered until the token is rotated.
#[derive(Debug)]
pub struct TokenConfig {
    pub sealing_key: Option<SecretString>,
}

/// HKDF input below this length is rejected as too guessable.
const MIN_SEALING_KEY_LEN: usize = 32;

impl TokenConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let sealing_key = optional_env("TOKEN_SEALING_KEY")?;
        if let Some(key) = &sealing_key
            && key.len() < MIN_SEALING_KEY_LEN
        {
            return Err(ConfigError::InvalidValue {
                key: "TOKEN_SEALING_KEY".to_string(),
                message: format!("must be at least {MIN_SEALING_KEY_LEN} bytes"),
            });
        }
        Ok(Self {
            sealing_key: sealing_key.map(SecretString::from),
        })
    }
}

/// Security audit trail controls.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

impl AuditConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: parse_bool_env("AUDIT_ENABLED", true)?,
            path: validate_audit_path(&parse_string_env(
                "AUDIT_PATH",
                "logs/collections_audit.jsonl",
            )?)?,
            hash_chain: parse_bool_env("AUDIT_HASH_CHAIN", true)?,
        })
    }
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must not be empty".to_string(),
        });
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must be relative to the working directory".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ConfigError::InvalidValue {
                    key: "AUDIT_PATH".to_string(),
                    message: "audit log path must not contain '..' components".to_string(),
                });
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ConfigError::InvalidValue {
                    key: "AUDIT_PATH".to_string(),
                    message: "audit log path must be relative to the working directory"
                        .to_string(),
                });
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(ConfigError::InvalidValue {
            key: "AUDIT_PATH".to_string(),
            message: "audit log path must be under 'logs/' and include a filename".to_string(),
        });
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::error::ConfigError;

    #[test]
    fn validate_audit_path_accepts_normalized_logs_subpaths() {
        let path = super::validate_audit_path("./logs//webhooks/./audit.jsonl/")
            .expect("path should be accepted");
        assert_eq!(path, PathBuf::from("logs/webhooks/audit.jsonl"));
    }

    #[test]
    fn validate_audit_path_rejects_parent_dir_traversal() {
        let err = super::validate_audit_path("logs/../audit.jsonl").expect_err("must reject '..'");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "AUDIT_PATH");
        assert!(message.contains(".."), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_absolute_paths() {
        let absolute = if cfg!(windows) {
            r"C:\tmp\audit.jsonl"
        } else {
            "/tmp/audit.jsonl"
        };
        let err =
            super::validate_audit_path(absolute).expect_err("absolute paths must be rejected");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "AUDIT_PATH");
        assert!(message.contains("relative"), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_paths_outside_logs_allowlist() {
        let err = super::validate_audit_path("tmp/audit.jsonl").expect_err("must stay under logs/");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(message.contains("under 'logs/'"), "unexpected message: {message}");
    }

    #[test]
    fn currency_codes_are_lowercased_and_checked() {
        assert_eq!(super::validate_currency(" USD ").expect("valid"), "usd");
        assert!(super::validate_currency("dollars").is_err());
        assert!(super::validate_currency("u$d").is_err());
    }
}
