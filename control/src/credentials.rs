//! API-key and cluster-secret issuance and verification.
//!
//! Plaintext secrets exist exactly once: in the response that issues
//! them. Only argon2 hashes are stored. Lookup for API keys is indexed
//! by the conventional 8-char prefix; the match is confirmed by a
//! constant-time hash verification over each candidate.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::password_hash::rand_core::OsRng;
use argon2::Argon2;
use deadpool_postgres::Pool;
use rand::RngCore;
use uuid::Uuid;

use crate::error::ControlError;
use crate::models::now_ms;

/// Conventional prefix boundary: the first 8 chars of the plaintext are
/// stored verbatim for candidate lookup.
pub const KEY_PREFIX_LEN: usize = 8;

const API_KEY_TAG: &str = "ck_live_";
const CLUSTER_SECRET_TAG: &str = "cs_";
const SECRET_BYTES: usize = 32;

/// Hash burned when there is nothing to verify against, so that a miss
/// takes the same wall time as a mismatch.
static DUMMY_HASH: LazyLock<String> =
    LazyLock::new(|| hash_secret(&random_token("dummy_")).expect("hash dummy secret"));

#[derive(Debug, Clone, Copy)]
pub struct ApiKeyIdentity {
    pub organization_id: Uuid,
    pub key_id: Uuid,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterIdentity {
    pub organization_id: Uuid,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: Pool,
    auth_timeout: Duration,
}

impl CredentialStore {
    pub fn new(pool: Pool, auth_timeout: Duration) -> Self {
        Self { pool, auth_timeout }
    }

    /// Verify an organization API key. Fails closed: storage errors and
    /// verification timeouts surface as `Unauthenticated`.
    pub async fn verify_api_key(&self, plaintext: &str) -> Result<ApiKeyIdentity, ControlError> {
        let Some(prefix) = plaintext.get(..KEY_PREFIX_LEN) else {
            return Err(ControlError::Unauthenticated);
        };

        let rows = match self.candidate_keys(prefix).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(?e, "api key candidate lookup failed");
                return Err(ControlError::Unauthenticated);
            }
        };

        if rows.is_empty() {
            // Equalize wall time with the candidate-present path.
            let _ = self.verify_bounded(plaintext, &DUMMY_HASH).await;
            return Err(ControlError::Unauthenticated);
        }

        for (key_id, organization_id, key_hash) in rows {
            if self.verify_bounded(plaintext, &key_hash).await {
                return Ok(ApiKeyIdentity {
                    organization_id,
                    key_id,
                });
            }
        }
        Err(ControlError::Unauthenticated)
    }

    /// Verify a cluster stream secret. A missing cluster burns a dummy
    /// verification so wrong-id and wrong-secret are indistinguishable
    /// by timing.
    pub async fn verify_cluster_secret(
        &self,
        cluster_id: Uuid,
        plaintext: &str,
    ) -> Result<ClusterIdentity, ControlError> {
        let row = match self.cluster_secret_row(cluster_id).await {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(?e, %cluster_id, "cluster secret lookup failed");
                return Err(ControlError::Unauthenticated);
            }
        };

        let Some((organization_id, secret_hash)) = row else {
            let _ = self.verify_bounded(plaintext, &DUMMY_HASH).await;
            return Err(ControlError::Unauthenticated);
        };

        if self.verify_bounded(plaintext, &secret_hash).await {
            Ok(ClusterIdentity { organization_id })
        } else {
            Err(ControlError::Unauthenticated)
        }
    }

    /// Argon2 verification is CPU-bound: run it on the blocking pool,
    /// bounded by the configured timeout. Timeout means "no".
    async fn verify_bounded(&self, plaintext: &str, hash: &str) -> bool {
        let plaintext = plaintext.to_string();
        let hash = hash.to_string();
        let verify = tokio::task::spawn_blocking(move || verify_hash(&plaintext, &hash));
        match tokio::time::timeout(self.auth_timeout, verify).await {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                tracing::error!(?e, "secret verification task failed");
                false
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.auth_timeout, "secret verification timed out");
                false
            }
        }
    }

    async fn candidate_keys(&self, prefix: &str) -> Result<Vec<(Uuid, Uuid, String)>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let rows = client
            .query(
                r#"
                SELECT id, organization_id, key_hash
                FROM api_keys
                WHERE key_prefix = $1
                  AND revoked_at IS NULL
                  AND (expires_at IS NULL OR expires_at > $2)
                "#,
                &[&prefix, &now_ms()],
            )
            .await
            .context("failed to query api keys")?;
        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get("organization_id"), r.get("key_hash")))
            .collect())
    }

    async fn cluster_secret_row(&self, cluster_id: Uuid) -> Result<Option<(Uuid, String)>> {
        let client = self.pool.get().await.context("failed to get db connection")?;
        let row = client
            .query_opt(
                "SELECT organization_id, secret_hash FROM clusters WHERE id = $1",
                &[&cluster_id],
            )
            .await
            .context("failed to query cluster")?;
        Ok(row.map(|r| (r.get("organization_id"), r.get("secret_hash"))))
    }

    /// Create an organization. Duplicate names are a `Conflict`.
    pub async fn create_organization(&self, name: &str) -> Result<Uuid, ControlError> {
        let client = self
            .pool
            .get()
            .await
            .context("failed to get db connection")?;
        let id = Uuid::new_v4();
        let inserted = client
            .execute(
                r#"
                INSERT INTO organizations (id, name, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO NOTHING
                "#,
                &[&id, &name, &now_ms()],
            )
            .await
            .context("failed to insert organization")?;
        if inserted == 0 {
            return Err(ControlError::Conflict(format!(
                "organization {name} already exists"
            )));
        }
        Ok(id)
    }

    /// Issue a new API key for an organization. The returned plaintext
    /// is shown once and never stored.
    pub async fn issue_api_key(
        &self,
        organization_id: Uuid,
        expires_at: Option<i64>,
    ) -> Result<(Uuid, String)> {
        let plaintext = random_token(API_KEY_TAG);
        let prefix = &plaintext[..KEY_PREFIX_LEN];
        let hash = hash_blocking(plaintext.clone()).await?;

        let client = self.pool.get().await.context("failed to get db connection")?;
        let id = Uuid::new_v4();
        client
            .execute(
                r#"
                INSERT INTO api_keys (id, organization_id, key_prefix, key_hash, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[&id, &organization_id, &prefix, &hash, &now_ms(), &expires_at],
            )
            .await
            .context("failed to insert api key")?;
        Ok((id, plaintext))
    }

    /// Generate a cluster secret: `(plaintext, hash)`. The caller stores
    /// the hash and forwards the plaintext exactly once.
    pub async fn generate_cluster_secret(&self) -> Result<(String, String)> {
        let plaintext = random_token(CLUSTER_SECRET_TAG);
        let hash = hash_blocking(plaintext.clone()).await?;
        Ok((plaintext, hash))
    }
}

/// `tag` + base64url of 32 random bytes.
fn random_token(tag: &str) -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}{}", tag, base64_url::encode(&bytes))
}

fn hash_secret(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash secret: {e}"))?
        .to_string())
}

async fn hash_blocking(plaintext: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_secret(&plaintext))
        .await
        .context("hash task failed")?
}

fn verify_hash(plaintext: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_format() {
        let key = random_token(API_KEY_TAG);
        assert!(key.starts_with("ck_live_"));
        assert!(key.len() > KEY_PREFIX_LEN + SECRET_BYTES);

        let secret = random_token(CLUSTER_SECRET_TAG);
        assert!(secret.starts_with("cs_"));

        // Two draws never collide.
        assert_ne!(random_token(API_KEY_TAG), random_token(API_KEY_TAG));
    }

    #[test]
    fn hash_verify_roundtrip() {
        let plaintext = random_token(CLUSTER_SECRET_TAG);
        let hash = hash_secret(&plaintext).unwrap();
        assert!(!hash.contains(&plaintext));
        assert!(verify_hash(&plaintext, &hash));
        assert!(!verify_hash("cs_wrong", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_hash("anything", "not-a-phc-string"));
    }

    #[test]
    fn short_plaintext_has_no_prefix() {
        assert!("ck_l".get(..KEY_PREFIX_LEN).is_none());
    }
}
