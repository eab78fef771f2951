//! Opaque per-debtor access tokens.
//!
//! A token is `tok_` followed by 32 bytes from the OS entropy source, URL-safe
//! base64 encoded. Rows are keyed by the SHA-256 of the token, so a presented
//! token is resolved by hash alone. The plaintext is kept only as an AES-256-GCM
//! sealed copy, needed to render the debtor's links into outbound messages; a
//! leaked database yields neither usable tokens nor the links built from them
//! without the sealing key.
//!
//! Each debtor has at most one active token. Issuing revokes the previous one
//! in the same transaction.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::collections::audit;
use crate::db::{CreateDebtorParams, Database, DebtorRecord, NewAccessToken};
use crate::error::TokenError;

const TOKEN_PREFIX: &str = "tok_";
const TOKEN_BYTES: usize = 32;
/// Longer inputs cannot be tokens we issued; skip the lookup entirely.
const MAX_TOKEN_LEN: usize = 128;
const NONCE_LEN: usize = 12;
const SEALING_INFO: &[u8] = b"dunning access-token seal v1";

pub(crate) fn generate_token() -> Result<String, TokenError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| TokenError::Generation(e.to_string()))?;
    Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

pub(crate) fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// AES-256-GCM envelope for stored tokens.
///
/// The ciphertext is bound to its row by using the token hash as associated
/// data, so a sealed value copied onto another row does not open.
#[derive(Clone)]
pub struct TokenSealer {
    cipher: Aes256Gcm,
}

impl TokenSealer {
    /// Derive the sealing key from a configured secret with HKDF-SHA256.
    pub fn from_secret(secret: &SecretString) -> Result<Self, TokenError> {
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, secret.expose_secret().as_bytes())
            .expand(SEALING_INFO, &mut key)
            .map_err(|e| TokenError::Sealing(e.to_string()))?;
        Ok(Self::from_key(key))
    }

    /// Process-local random key. Sealed tokens stop opening after a restart;
    /// validation is unaffected since it only uses the hash.
    pub fn ephemeral() -> Self {
        Self::from_key(rand::random::<[u8; 32]>())
    }

    fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    fn seal(&self, token_hash: &str, token: &str) -> Result<String, TokenError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| TokenError::Generation(e.to_string()))?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: token.as_bytes(),
                    aad: token_hash.as_bytes(),
                },
            )
            .map_err(|e| TokenError::Sealing(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    fn open(&self, token_hash: &str, sealed: &str) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(sealed).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: token_hash.as_bytes(),
                },
            )
            .ok()?;
        String::from_utf8(plain).ok()
    }
}

/// Issues, validates, and revokes debtor access tokens.
#[derive(Clone)]
pub struct TokenService {
    db: Arc<dyn Database>,
    sealer: TokenSealer,
}

impl TokenService {
    /// Service with a process-local sealing key. Use [`TokenService::with_sealer`]
    /// to keep outbound links renderable across restarts.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            sealer: TokenSealer::ephemeral(),
        }
    }

    pub fn with_sealer(mut self, sealer: TokenSealer) -> Self {
        self.sealer = sealer;
        self
    }

    fn mint(&self) -> Result<(String, NewAccessToken), TokenError> {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let sealed_token = self.sealer.seal(&token_hash, &token)?;
        Ok((
            token,
            NewAccessToken {
                token_hash,
                sealed_token,
            },
        ))
    }

    /// Create a debtor together with its first token. Either both rows exist
    /// afterwards or neither does.
    pub async fn create_debtor(
        &self,
        input: &CreateDebtorParams,
    ) -> Result<(DebtorRecord, String), TokenError> {
        let (token, row) = self.mint()?;
        let (debtor, _) = self.db.create_debtor_with_token(input, &row).await?;

        tracing::info!(debtor_id = %debtor.id, "Created debtor with access token");
        audit::record(
            "token_issued",
            serde_json::json!({ "debtor_id": debtor.id.to_string(), "replaced": 0 }),
        );
        Ok((debtor, token))
    }

    /// Mint a new token for an existing debtor, revoking the current one.
    pub async fn issue(&self, debtor_id: Uuid) -> Result<String, TokenError> {
        if self.db.get_debtor(debtor_id).await?.is_none() {
            return Err(TokenError::NotFound);
        }
        let (token, row) = self.mint()?;
        let (_, replaced) = self.db.replace_access_token(debtor_id, &row).await?;

        tracing::info!(debtor_id = %debtor_id, replaced, "Issued debtor access token");
        if replaced > 0 {
            audit::inc_revoked_tokens(replaced);
        }
        audit::record(
            "token_issued",
            serde_json::json!({ "debtor_id": debtor_id.to_string(), "replaced": replaced }),
        );
        Ok(token)
    }

    /// Resolve a presented token to its debtor.
    ///
    /// Unknown, malformed, and revoked tokens all yield `TokenError::NotFound`.
    pub async fn validate(&self, token: &str) -> Result<DebtorRecord, TokenError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::NotFound);
        }

        let Some(row) = self.db.find_active_token(&hash_token(token)).await? else {
            return Err(TokenError::NotFound);
        };

        self.db
            .get_debtor(row.debtor_id)
            .await?
            .ok_or(TokenError::NotFound)
    }

    /// Invalidate every active token of a debtor. Writes no ledger entry.
    pub async fn revoke(&self, debtor_id: Uuid) -> Result<u64, TokenError> {
        let revoked = self.db.revoke_tokens(debtor_id).await?;
        if revoked > 0 {
            tracing::info!(debtor_id = %debtor_id, revoked, "Revoked debtor access tokens");
            audit::inc_revoked_tokens(revoked);
            audit::record(
                "token_revoked",
                serde_json::json!({ "debtor_id": debtor_id.to_string(), "count": revoked }),
            );
        }
        Ok(revoked)
    }

    /// Replace the debtor's token; the old one stops validating immediately.
    pub async fn rotate(&self, debtor_id: Uuid) -> Result<String, TokenError> {
        self.issue(debtor_id).await
    }

    /// The debtor's current token, used to render outbound links.
    ///
    /// `None` when no token is active or its sealed copy cannot be opened with
    /// the current key.
    pub async fn active_token(&self, debtor_id: Uuid) -> Result<Option<String>, TokenError> {
        let Some(row) = self.db.active_token_for_debtor(debtor_id).await? else {
            return Ok(None);
        };
        let opened = self.sealer.open(&row.token_hash, &row.sealed_token);
        if opened.is_none() {
            tracing::warn!(
                debtor_id = %debtor_id,
                "Active token was sealed under a different key; rotate it to restore links"
            );
        }
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;

    use super::{TokenSealer, TokenService, generate_token, hash_token};
    use crate::db::CreateDebtorParams;
    use crate::error::TokenError;
    use crate::testing::{seed_debtor, test_db};

    #[test]
    fn generated_tokens_are_prefixed_and_unique() {
        let a = generate_token().expect("token");
        let b = generate_token().expect("token");
        assert!(a.starts_with("tok_"));
        // 32 bytes -> 43 base64 chars without padding.
        assert_eq!(a.len(), 4 + 43);
        assert_ne!(a, b);
        assert_ne!(hash_token(&a), hash_token(&b));
        assert_eq!(hash_token(&a).len(), 64);
    }

    #[test]
    fn sealed_tokens_open_only_under_their_key_and_row() {
        let secret = SecretString::from("0123456789abcdef0123456789abcdef");
        let sealer = TokenSealer::from_secret(&secret).expect("sealer");
        let token = generate_token().expect("token");
        let hash = hash_token(&token);

        let sealed = sealer.seal(&hash, &token).expect("seal");
        assert!(!sealed.contains(&token));
        assert_eq!(sealer.open(&hash, &sealed).as_deref(), Some(token.as_str()));

        let same_key = TokenSealer::from_secret(&secret).expect("sealer");
        assert_eq!(same_key.open(&hash, &sealed).as_deref(), Some(token.as_str()));
        assert_eq!(TokenSealer::ephemeral().open(&hash, &sealed), None);
        assert_eq!(sealer.open(&hash_token("tok_other"), &sealed), None);
        assert_eq!(sealer.open(&hash, "not base64!"), None);
    }

    #[tokio::test]
    async fn issued_token_validates_to_its_debtor() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d1@example.com", "+15550001").await;
        let tokens = TokenService::new(db);

        let token = tokens.issue(debtor.id).await.expect("issue");
        let resolved = tokens.validate(&token).await.expect("validate");
        assert_eq!(resolved.id, debtor.id);
        assert_eq!(
            tokens.active_token(debtor.id).await.expect("active"),
            Some(token)
        );
    }

    #[tokio::test]
    async fn stored_rows_never_hold_the_plaintext() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d5@example.com", "+15550005").await;
        let tokens = TokenService::new(Arc::clone(&db));

        let token = tokens.issue(debtor.id).await.expect("issue");
        let row = db
            .active_token_for_debtor(debtor.id)
            .await
            .expect("query")
            .expect("active row");
        assert_eq!(row.token_hash, hash_token(&token));
        assert!(!row.sealed_token.contains(&token));

        // A service holding another key still validates, but cannot render links.
        let restarted = TokenService::new(db);
        assert_eq!(restarted.validate(&token).await.expect("validate").id, debtor.id);
        assert_eq!(restarted.active_token(debtor.id).await.expect("active"), None);
    }

    #[tokio::test]
    async fn unknown_and_revoked_tokens_are_indistinguishable() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d2@example.com", "+15550002").await;
        let tokens = TokenService::new(db);
        let token = tokens.issue(debtor.id).await.expect("issue");

        for bogus in ["", "tok_abc", "not-a-token", &"x".repeat(4096)] {
            assert!(matches!(
                tokens.validate(bogus).await,
                Err(TokenError::NotFound)
            ));
        }

        assert_eq!(tokens.revoke(debtor.id).await.expect("revoke"), 1);
        let err = tokens.validate(&token).await.expect_err("revoked");
        assert!(matches!(err, TokenError::NotFound));
        assert_eq!(err.to_string(), "not found");
        assert_eq!(tokens.revoke(debtor.id).await.expect("revoke again"), 0);
    }

    #[tokio::test]
    async fn rotate_replaces_the_active_token() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d3@example.com", "+15550003").await;
        let tokens = TokenService::new(db);

        let first = tokens.issue(debtor.id).await.expect("issue");
        let second = tokens.rotate(debtor.id).await.expect("rotate");
        assert_ne!(first, second);
        assert!(tokens.validate(&first).await.is_err());
        assert_eq!(tokens.validate(&second).await.expect("new").id, debtor.id);
    }

    #[tokio::test]
    async fn issuing_twice_keeps_only_the_newest_token() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d6@example.com", "+15550006").await;
        let tokens = TokenService::new(db);

        let first = tokens.issue(debtor.id).await.expect("first issue");
        let second = tokens.issue(debtor.id).await.expect("second issue");
        assert!(matches!(
            tokens.validate(&first).await,
            Err(TokenError::NotFound)
        ));
        assert_eq!(tokens.validate(&second).await.expect("valid").id, debtor.id);
        assert_eq!(tokens.revoke(debtor.id).await.expect("revoke"), 1);
    }

    #[tokio::test]
    async fn concurrent_issues_leave_one_valid_token() {
        let (db, _dir) = test_db().await;
        let debtor = seed_debtor(&db, "d7@example.com", "+15550007").await;
        let tokens = TokenService::new(db);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let tokens = tokens.clone();
            tasks.spawn(async move { tokens.issue(debtor.id).await });
        }
        let mut issued = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            issued.push(joined.expect("task").expect("issue"));
        }

        let mut valid = 0;
        for token in &issued {
            if tokens.validate(token).await.is_ok() {
                valid += 1;
            }
        }
        assert_eq!(valid, 1);
        let active = tokens.active_token(debtor.id).await.expect("active");
        assert!(active.is_some_and(|t| issued.contains(&t)));
    }

    #[tokio::test]
    async fn create_debtor_returns_a_working_token() {
        let (db, _dir) = test_db().await;
        let tokens = TokenService::new(Arc::clone(&db));

        let (debtor, token) = tokens
            .create_debtor(&CreateDebtorParams {
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: Some("Ada@Example.com".into()),
                phone: None,
            })
            .await
            .expect("create");
        assert_eq!(debtor.email.as_deref(), Some("ada@example.com"));
        assert_eq!(tokens.validate(&token).await.expect("validate").id, debtor.id);
        assert_eq!(tokens.active_token(debtor.id).await.expect("active"), Some(token));

        let rejected = tokens
            .create_debtor(&CreateDebtorParams {
                first_name: "  ".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(rejected, Err(TokenError::Database(_))));
    }

    #[tokio::test]
    async fn issue_for_missing_debtor_is_not_found() {
        let (db, _dir) = test_db().await;
        let tokens = TokenService::new(db);
        assert!(matches!(
            tokens.issue(uuid::Uuid::new_v4()).await,
            Err(TokenError::NotFound)
        ));
    }
}
