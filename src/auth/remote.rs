//! Remote credential backend backed by redis
//!
//! Deployments running several stateless-ish replicas behind one external
//! URL need credentials visible to every replica; this backend keeps them
//! in a shared redis instance instead of per-host files.
//!
//! Records are stored as JSON strings under `tollgate:credential:<identity>`
//! with no TTL: credentials live until revoked.  The same read-side rules as
//! the local backends apply, so a corrupt value is deleted and reported as
//! absent rather than wedging the identity.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands as _;

use crate::auth::credentials::{validate_loaded, CredentialRecord, CredentialStore};
use crate::error::{Result, TollgateError};

const KEY_PREFIX: &str = "tollgate:credential:";

// ---------------------------------------------------------------------------
// RedisCredentialStore
// ---------------------------------------------------------------------------

/// Credential store over a shared redis instance.
///
/// The connection manager reconnects on its own; individual command failures
/// surface as [`TollgateError::Storage`].
pub struct RedisCredentialStore {
    conn: ConnectionManager,
}

impl RedisCredentialStore {
    /// Connects to redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Storage`] when the URL is malformed or the
    /// initial connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::Storage(format!("invalid redis URL: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| TollgateError::Storage(format!("redis connection failed: {e}")))?;
        tracing::info!("connected to redis credential backend");
        Ok(Self { conn })
    }

    fn key(identity: &str) -> String {
        format!("{KEY_PREFIX}{identity}")
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn get(&self, identity: &str) -> Result<Option<CredentialRecord>> {
        let key = Self::key(identity);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| TollgateError::Storage(format!("redis GET failed: {e}")))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let record: CredentialRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(identity, error = %e, "dropping corrupt credential record");
                let deleted: redis::RedisResult<()> = conn.del(&key).await;
                if let Err(e) = deleted {
                    tracing::warn!(identity, error = %e, "failed to delete corrupt record");
                }
                return Ok(None);
            }
        };
        Ok(validate_loaded(record))
    }

    async fn put(&self, record: &CredentialRecord) -> Result<()> {
        // Serialization skips the client secret, same as the file backend.
        let payload = serde_json::to_string(record).map_err(TollgateError::Serialization)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(&record.identity), payload)
            .await
            .map_err(|e| TollgateError::Storage(format!("redis SET failed: {e}")))?;
        tracing::debug!(identity = %record.identity, "credential record written to redis");
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(identity))
            .await
            .map_err(|e| TollgateError::Storage(format!("redis DEL failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
