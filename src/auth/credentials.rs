//! Credential records and pluggable credential stores
//!
//! A [`CredentialRecord`] holds one identity's OAuth grant: token pair,
//! expiry, and granted scopes.  Stores are deliberately dumb `get`/`put`/
//! `delete` maps; refresh policy and single-flight live in the broker.
//!
//! Behaviors common to every backend:
//! - `client_secret` is a legacy field: accepted on read for compatibility
//!   with records written by older deployments, stripped before the record
//!   is returned, and never serialized again
//! - A record missing its access/refresh token pair is treated as absent,
//!   forcing a fresh authorization instead of limping along half-granted
//! - Corrupt payloads are dropped, logged, and reported as absent rather
//!   than surfaced as hard errors (fail closed, self-heal)
//!
//! The file backend additionally enforces Unix hygiene: the credentials
//! directory is created `0700`, files are written `0600` via a uniquely
//! named temp file and an atomic rename, and files owned by another user
//! are refused.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use uuid::Uuid;

use crate::auth::config::{OAuthConfig, StorageBackend};
use crate::auth::remote::RedisCredentialStore;
use crate::auth::scopes::ScopeSet;
use crate::error::{Result, TollgateError};

/// Tokens are treated as expired this many seconds before their stated
/// expiry, so a token never dies mid-request.
pub const EXPIRY_BUFFER_SECONDS: i64 = 60;

// ---------------------------------------------------------------------------
// CredentialRecord
// ---------------------------------------------------------------------------

/// One identity's stored OAuth grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Identity the grant belongs to (verified email).
    pub identity: String,
    /// Current access token.
    pub access_token: String,
    /// Refresh token; a record without one is treated as absent on read.
    pub refresh_token: Option<String>,
    /// When the access token expires; `None` means it does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes the grant covers.
    pub scopes: ScopeSet,
    /// When the grant was first stored.
    pub created_at: DateTime<Utc>,
    /// Legacy field from older deployments that wrote the client secret
    /// alongside tokens.  Read for compatibility, stripped on load, and
    /// never written back.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
}

impl CredentialRecord {
    /// Returns true when the access token is expired or expires within the
    /// safety buffer.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at - Duration::seconds(EXPIRY_BUFFER_SECONDS),
            None => false,
        }
    }

    /// Returns true when both halves of the token pair are present and
    /// non-empty.
    pub fn has_token_pair(&self) -> bool {
        !self.access_token.is_empty()
            && self
                .refresh_token
                .as_deref()
                .is_some_and(|t| !t.is_empty())
    }
}

/// Post-load validation shared by every backend: reject pair-less records
/// and strip the legacy client secret.
pub(crate) fn validate_loaded(mut record: CredentialRecord) -> Option<CredentialRecord> {
    if !record.has_token_pair() {
        tracing::warn!(
            identity = %record.identity,
            "credential record missing its token pair, treating as absent"
        );
        return None;
    }
    if record.client_secret.take().is_some() {
        tracing::debug!(
            identity = %record.identity,
            "stripped legacy client secret from credential record"
        );
    }
    Some(record)
}

// ---------------------------------------------------------------------------
// CredentialStore trait
// ---------------------------------------------------------------------------

/// Backend-agnostic credential persistence.
///
/// Implementations must serialize writes per identity (the file backend
/// relies on atomic renames; the memory backend on its mutex) and apply the
/// shared read-side validation.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads the record for `identity`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when no valid record exists; corrupt or pair-less records
    /// are reported as absent, not as errors.
    async fn get(&self, identity: &str) -> Result<Option<CredentialRecord>>;

    /// Stores `record` under its identity, replacing any previous record.
    async fn put(&self, record: &CredentialRecord) -> Result<()>;

    /// Deletes the record for `identity`.  Deleting an absent record is not
    /// an error.
    async fn delete(&self, identity: &str) -> Result<()>;
}

/// Opens the credential store selected by `config`.
///
/// # Errors
///
/// Propagates directory creation failures for the file backend and
/// connection failures for the redis backend.
pub async fn open_store(config: &OAuthConfig) -> Result<Arc<dyn CredentialStore>> {
    match config.storage_backend {
        StorageBackend::File => Ok(Arc::new(FileCredentialStore::new(&config.credentials_dir)?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryCredentialStore::new())),
        StorageBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                TollgateError::ConfigInvalid("redis backend selected without a URL".to_string())
            })?;
            Ok(Arc::new(RedisCredentialStore::connect(url).await?))
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryCredentialStore
// ---------------------------------------------------------------------------

/// Process-local credential store for stateless replicas and tests.
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CredentialRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, identity: &str) -> Result<Option<CredentialRecord>> {
        let record = self.lock().get(identity).cloned();
        Ok(record.and_then(validate_loaded))
    }

    async fn put(&self, record: &CredentialRecord) -> Result<()> {
        let mut stored = record.clone();
        stored.client_secret = None;
        self.lock().insert(stored.identity.clone(), stored);
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.lock().remove(identity);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileCredentialStore
// ---------------------------------------------------------------------------

/// One JSON file per identity under a `0700` directory.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Creates the store, creating the credentials directory (mode `0700`
    /// on Unix) when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Io`] when the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt as _;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
                .map_err(TollgateError::Io)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&dir).map_err(TollgateError::Io)?;
        Ok(Self { dir })
    }

    fn file_path(&self, identity: &str) -> Result<PathBuf> {
        if identity.is_empty() {
            return Err(
                TollgateError::Storage("credential identity must not be empty".to_string()).into(),
            );
        }
        Ok(self.dir.join(format!("{}.json", file_stem(identity))))
    }
}

/// Maps an identity to a filename, replacing anything outside a conservative
/// character set so identities can never traverse out of the directory.
fn file_stem(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '+' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(unix)]
fn owned_by_current_user(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt as _;
    metadata.uid() == unsafe { libc::geteuid() }
}

async fn discard_file(path: &Path, reason: &str) {
    tracing::warn!(path = %path.display(), reason, "dropping unusable credential file");
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove credential file");
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, identity: &str) -> Result<Option<CredentialRecord>> {
        let path = self.file_path(identity)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TollgateError::Io(e).into()),
        };
        if !metadata.is_file() {
            tracing::warn!(path = %path.display(), "credential path is not a regular file");
            return Ok(None);
        }
        #[cfg(unix)]
        if !owned_by_current_user(&metadata) {
            tracing::warn!(
                path = %path.display(),
                "refusing credential file owned by another user"
            );
            return Ok(None);
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(TollgateError::Io)?;
        let record: CredentialRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                discard_file(&path, "unparseable JSON").await;
                tracing::warn!(identity, error = %e, "credential record failed to parse");
                return Ok(None);
            }
        };
        match validate_loaded(record) {
            Some(record) => Ok(Some(record)),
            None => {
                discard_file(&path, "missing token pair").await;
                Ok(None)
            }
        }
    }

    async fn put(&self, record: &CredentialRecord) -> Result<()> {
        let path = self.file_path(&record.identity)?;
        // The client secret is skipped by the serializer, so the bytes on
        // disk never contain it.
        let payload = serde_json::to_string_pretty(record).map_err(TollgateError::Serialization)?;

        // Unique temp name per write: concurrent writers each rename their
        // own complete file, so readers see either the old or the new
        // record, never a torn one.
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_stem(&record.identity), Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            // Mode is set at creation, before any secret bytes land.
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).await.map_err(TollgateError::Io)?;

        let write_result = async {
            file.write_all(payload.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TollgateError::Io(e).into());
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TollgateError::Io(e).into());
        }
        tracing::debug!(identity = %record.identity, "credential record written");
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        let path = self.file_path(identity)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(identity, "credential record deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TollgateError::Io(e).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
