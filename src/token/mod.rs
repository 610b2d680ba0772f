// src/token/mod.rs

//! One-shot join tokens: issuance, presentation, and constant-time consumption.

use crate::db::Database;
use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The decoded form of a join token, as handed to a prospective joiner.
///
/// Encoded form (`spec.md` §6): base64 of the UTF-8 JSON of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub secret: String,
    pub cluster_cert: String,
    pub join_address: String,
}

impl Token {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded)
            .map_err(|e| Error::Validation(format!("malformed token encoding: {e}")))?;
        let token = serde_json::from_slice(&json)?;
        Ok(token)
    }
}

/// Generates a cryptographically random, URL-safe secret string.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The one-shot join-token registry, persisted in the replicated database.
///
/// Per `spec.md` §4.2, tokens never expire; an operator revokes one by
/// deleting it. [`TokenRegistry::consume`] is the *only* authenticator for
/// joiners, so it must run as a single transaction and compare secrets in
/// constant time.
#[derive(Clone)]
pub struct TokenRegistry {
    db: Database,
    /// The cluster's shared TLS identity, PEM-encoded. Unknown until this
    /// node completes bootstrap or join, so it's set once after
    /// construction rather than threaded through every coordinator's
    /// constructor ahead of time.
    cluster_cert: Arc<RwLock<String>>,
    local_address: String,
}

impl TokenRegistry {
    pub fn new(db: Database, cluster_cert: String, local_address: String) -> Self {
        Self {
            db,
            cluster_cert: Arc::new(RwLock::new(cluster_cert)),
            local_address,
        }
    }

    /// Records the cluster cert once it becomes known (post bootstrap/join).
    pub fn set_cluster_cert(&self, cluster_cert: String) {
        *self.cluster_cert.write() = cluster_cert;
    }

    /// Issues a new token bound to `joiner_fingerprint`.
    ///
    /// Fails with [`Error::Conflict`] if a token already exists for that
    /// fingerprint (an operator must `delete` the old one first).
    pub async fn issue(&self, joiner_fingerprint: &str) -> Result<String> {
        let secret = generate_secret();
        self.db
            .transaction(|tx| tx.issue_secret(joiner_fingerprint, &secret))
            .await?;

        Token {
            secret,
            cluster_cert: self.cluster_cert.read().clone(),
            join_address: self.local_address.clone(),
        }
        .encode()
    }

    /// Consumes a token atomically: looks up by fingerprint, compares in
    /// constant time, deletes the row on match.
    ///
    /// Two concurrent calls with the correct secret race for the database
    /// transaction; whichever wins deletes the row, so the loser always
    /// observes a missing row and returns `InvalidToken` -- exactly the
    /// idempotent-safety property required by `spec.md` §8.
    pub async fn consume(&self, fingerprint: &str, presented_secret: &str) -> Result<()> {
        self.db
            .transaction(|tx| {
                let stored = tx
                    .secret(fingerprint)
                    .ok_or_else(|| Error::Unauthorized("invalid token".into()))?;

                let matches: bool = stored
                    .secret
                    .as_bytes()
                    .ct_eq(presented_secret.as_bytes())
                    .into();
                if !matches {
                    return Err(Error::Unauthorized("invalid token".into()));
                }

                tx.delete_secret(fingerprint);
                Ok(())
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.db
            .transaction(|tx| Ok(tx.secrets().map(|s| s.fingerprint.clone()).collect()))
            .await
    }

    pub async fn delete(&self, fingerprint: &str) -> Result<()> {
        self.db
            .transaction(|tx| {
                tx.delete_secret(fingerprint)
                    .map(|_| ())
                    .ok_or_else(|| Error::NotFound(format!("no token for {fingerprint}")))
            })
            .await
    }
}
