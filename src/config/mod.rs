//! Configuration resolved from the environment (optionally seeded by `.env`).

mod collections;
pub(crate) mod helpers;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use secrecy::SecretString;

pub use collections::{
    AuditConfig, DispatchConfig, StatusPolicyConfig, TokenConfig, WebhookConfig,
};

use crate::config::helpers::{optional_env, parse_env, parse_string_env};
use crate::error::ConfigError;

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }
}

#[derive(Debug)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: Option<PathBuf>,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

impl DatabaseConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            backend: DatabaseBackend::from_str(&parse_string_env("DATABASE_BACKEND", "libsql")?)?,
            libsql_path: optional_env("LIBSQL_PATH")?.map(PathBuf::from),
            libsql_url: optional_env("LIBSQL_URL")?,
            libsql_auth_token: optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from),
        })
    }
}

/// Default on-disk location of the embedded database.
pub fn default_libsql_path() -> PathBuf {
    PathBuf::from("data").join("dunning.db")
}

#[derive(Debug)]
pub struct HttpConfig {
    pub addr: SocketAddr,
    /// Externally reachable origin used for debtor links and telephony signatures.
    pub public_base_url: String,
    /// Bearer token for the dashboard API. `None` locks the API entirely.
    pub api_token: Option<SecretString>,
}

impl HttpConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let host: IpAddr = parse_env("HTTP_HOST", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = parse_env("PORT", 8080)?;
        let public_base_url = validate_public_base_url(&parse_string_env(
            "PUBLIC_BASE_URL",
            format!("http://localhost:{port}"),
        )?)?;
        Ok(Self {
            addr: SocketAddr::new(host, port),
            public_base_url,
            api_token: optional_env("API_AUTH_TOKEN")?.map(SecretString::from),
        })
    }
}

fn validate_public_base_url(raw: &str) -> Result<String, ConfigError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: "PUBLIC_BASE_URL".to_string(),
        message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: "PUBLIC_BASE_URL".to_string(),
            message: "must be an http(s) URL".to_string(),
        });
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Fully resolved process configuration.
#[derive(Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub webhooks: WebhookConfig,
    pub status: StatusPolicyConfig,
    pub dispatch: DispatchConfig,
    pub tokens: TokenConfig,
    pub audit: AuditConfig,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_format = match parse_string_env("LOG_FORMAT", "pretty")?
            .to_ascii_lowercase()
            .as_str()
        {
            "pretty" | "text" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "LOG_FORMAT".to_string(),
                    message: format!("unsupported format '{other}'"),
                });
            }
        };

        Ok(Self {
            database: DatabaseConfig::resolve()?,
            http: HttpConfig::resolve()?,
            webhooks: WebhookConfig::resolve()?,
            status: StatusPolicyConfig::resolve()?,
            dispatch: DispatchConfig::resolve()?,
            tokens: TokenConfig::resolve()?,
            audit: AuditConfig::resolve()?,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseBackend, validate_public_base_url};
    use crate::error::ConfigError;

    #[test]
    fn public_base_url_drops_trailing_slash() {
        assert_eq!(
            validate_public_base_url("https://pay.example.com/").expect("valid"),
            "https://pay.example.com"
        );
    }

    #[test]
    fn public_base_url_rejects_non_http_schemes() {
        let err = validate_public_base_url("ftp://example.com").expect_err("must reject");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "PUBLIC_BASE_URL");
    }

    #[test]
    fn backend_aliases_resolve_to_libsql() {
        for raw in ["libsql", "SQLite", " turso "] {
            assert_eq!(
                DatabaseBackend::from_str(raw).expect("known backend"),
                DatabaseBackend::LibSql
            );
        }
        assert!(DatabaseBackend::from_str("postgres").is_err());
    }
}
