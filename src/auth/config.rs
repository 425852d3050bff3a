//! OAuth client configuration and the reloadable snapshot handle
//!
//! This module provides:
//! - [`OAuthConfig`]: an immutable snapshot of client credentials, provider
//!   endpoints, registered redirect URIs, and deployment mode flags, built
//!   from environment variables and validated before use
//! - [`ConfigHandle`]: a shared handle that hands out `Arc` snapshots and
//!   supports reload as an atomic swap, so in-flight operations keep the
//!   snapshot they started with
//! - Redirect URI validation: `https` everywhere, plain `http` only for
//!   loopback hosts, fragments rejected
//!
//! Configuration is an explicit dependency: components receive a
//! [`ConfigHandle`] at construction instead of reaching for process globals.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use url::Url;

use crate::error::{Result, TollgateError};

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

/// OAuth client identifier issued by the provider.
pub const ENV_CLIENT_ID: &str = "TOLLGATE_OAUTH_CLIENT_ID";
/// OAuth client secret issued by the provider.
pub const ENV_CLIENT_SECRET: &str = "TOLLGATE_OAUTH_CLIENT_SECRET";
/// Provider authorization endpoint URL.
pub const ENV_AUTH_URL: &str = "TOLLGATE_OAUTH_AUTH_URL";
/// Provider token endpoint URL.
pub const ENV_TOKEN_URL: &str = "TOLLGATE_OAUTH_TOKEN_URL";
/// Provider userinfo endpoint URL.
pub const ENV_USERINFO_URL: &str = "TOLLGATE_OAUTH_USERINFO_URL";
/// Base URL of the upstream API suite that handles operate on.
pub const ENV_API_BASE_URL: &str = "TOLLGATE_API_BASE_URL";
/// Public base URL of this deployment; the callback URI derives from it.
pub const ENV_EXTERNAL_URL: &str = "TOLLGATE_EXTERNAL_URL";
/// Comma-separated additional redirect URIs registered with the provider.
pub const ENV_EXTRA_REDIRECT_URIS: &str = "TOLLGATE_EXTRA_REDIRECT_URIS";
/// Transport mode: `http` (default) or `stdio`.
pub const ENV_TRANSPORT: &str = "TOLLGATE_TRANSPORT";
/// Multi-tenant mode flag; requires the http transport.
pub const ENV_MULTI_TENANT: &str = "TOLLGATE_MULTI_TENANT";
/// Stateless mode flag; forces the in-memory credential backend.
pub const ENV_STATELESS: &str = "TOLLGATE_STATELESS";
/// Credential backend selector: `file` (default), `memory`, or `redis`.
pub const ENV_STORAGE_BACKEND: &str = "TOLLGATE_STORAGE_BACKEND";
/// Connection URL for the redis credential backend.
pub const ENV_REDIS_URL: &str = "TOLLGATE_REDIS_URL";
/// Directory holding per-identity credential files.
pub const ENV_CREDENTIALS_DIR: &str = "TOLLGATE_CREDENTIALS_DIR";
/// Identity assumed in single-tenant mode when callers give no hint.
pub const ENV_DEFAULT_IDENTITY: &str = "TOLLGATE_DEFAULT_IDENTITY";

/// Path of the OAuth callback endpoint, appended to the external URL to form
/// the primary redirect URI.
pub const CALLBACK_PATH: &str = "/oauth2/callback";

const DEFAULT_EXTERNAL_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_CREDENTIALS_DIR: &str = ".credentials";

// ---------------------------------------------------------------------------
// TransportMode / StorageBackend
// ---------------------------------------------------------------------------

/// How callers reach the server.
///
/// The `stdio` transport serves exactly one local caller and disables the
/// recent-authentication session fast path, which only makes sense when an
/// HTTP layer re-verifies bearers per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Streamable HTTP transport with per-session callers.
    Http,
    /// Local stdio transport with a single implicit caller.
    Stdio,
}

impl TransportMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportMode::Http),
            "stdio" => Ok(TransportMode::Stdio),
            other => Err(TollgateError::ConfigInvalid(format!(
                "unknown transport mode {other:?}, expected \"http\" or \"stdio\""
            ))
            .into()),
        }
    }
}

/// Which backend persists credential records.
///
/// Sessions and OAuth state are always process-local; this selector governs
/// credentials only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// One JSON file per identity under the credentials directory.
    File,
    /// Process-local map; credentials do not survive restarts.
    Memory,
    /// Remote key-value store shared across replicas.
    Redis,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            "redis" => Ok(StorageBackend::Redis),
            other => Err(TollgateError::ConfigInvalid(format!(
                "unknown storage backend {other:?}, expected \"file\", \"memory\", or \"redis\""
            ))
            .into()),
        }
    }
}

// ---------------------------------------------------------------------------
// OAuthConfig
// ---------------------------------------------------------------------------

/// Immutable snapshot of the OAuth client configuration.
///
/// Built once at startup (and again on reload) from environment variables,
/// then validated.  A configuration that fails validation is never handed
/// out, so holders of a snapshot can rely on it unconditionally.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret.  Never serialized; credential records strip it.
    pub client_secret: String,
    /// Provider authorization endpoint.
    pub auth_url: Url,
    /// Provider token endpoint.
    pub token_url: Url,
    /// Provider userinfo endpoint used for identity resolution.
    pub userinfo_url: Url,
    /// Base URL of the upstream API suite.
    pub api_base_url: Url,
    /// Public base URL of this deployment.
    pub external_url: Url,
    /// Registered redirect URIs; the first entry is the primary callback.
    pub redirect_uris: Vec<Url>,
    /// Transport mode in effect.
    pub transport: TransportMode,
    /// Whether identities are resolved per session rather than from a
    /// configured default.
    pub multi_tenant: bool,
    /// Whether this replica must avoid durable local credential storage.
    pub stateless: bool,
    /// Backend persisting credential records.
    pub storage_backend: StorageBackend,
    /// Connection URL for the redis backend, when selected.
    pub redis_url: Option<String>,
    /// Directory holding per-identity credential files.
    pub credentials_dir: PathBuf,
    /// Identity assumed in single-tenant mode when callers give no hint.
    pub default_identity: Option<String>,
}

impl OAuthConfig {
    /// Builds a configuration snapshot from environment variables and
    /// validates it.
    ///
    /// Stateless mode overrides the storage backend to `memory`; the
    /// override is logged so operators notice the coercion.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConfigInvalid`] when a required variable is
    /// missing, a URL fails to parse, a redirect URI violates the scheme
    /// rules, or mode flags contradict each other.
    pub fn from_env() -> Result<Self> {
        let client_id = required_env(ENV_CLIENT_ID)?;
        let client_secret = required_env(ENV_CLIENT_SECRET)?;
        let auth_url = required_url(ENV_AUTH_URL)?;
        let token_url = required_url(ENV_TOKEN_URL)?;
        let userinfo_url = required_url(ENV_USERINFO_URL)?;
        let api_base_url = required_url(ENV_API_BASE_URL)?;

        let external_env = optional_env(ENV_EXTERNAL_URL);
        let external_url = match &external_env {
            Some(raw) => parse_url(ENV_EXTERNAL_URL, raw)?,
            None => parse_url(ENV_EXTERNAL_URL, DEFAULT_EXTERNAL_URL)?,
        };

        let mut redirect_uris = vec![callback_uri(&external_url)?];
        if external_env.is_some() {
            tracing::warn!(
                uri = %redirect_uris[0],
                "registering callback redirect URI from environment"
            );
        }
        if let Some(raw) = optional_env(ENV_EXTRA_REDIRECT_URIS) {
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let uri = parse_url(ENV_EXTRA_REDIRECT_URIS, part)?;
                tracing::warn!(uri = %uri, "registering extra redirect URI from environment");
                redirect_uris.push(uri);
            }
        }

        let transport = match optional_env(ENV_TRANSPORT) {
            Some(raw) => TransportMode::parse(&raw)?,
            None => TransportMode::Http,
        };
        let multi_tenant = env_flag(ENV_MULTI_TENANT, false);
        let stateless = env_flag(ENV_STATELESS, false);

        let mut storage_backend = match optional_env(ENV_STORAGE_BACKEND) {
            Some(raw) => StorageBackend::parse(&raw)?,
            None => StorageBackend::File,
        };
        if stateless && storage_backend != StorageBackend::Memory {
            tracing::info!(
                "stateless mode forces the memory credential backend (was {:?})",
                storage_backend
            );
            storage_backend = StorageBackend::Memory;
        }

        let config = Self {
            client_id,
            client_secret,
            auth_url,
            token_url,
            userinfo_url,
            api_base_url,
            external_url,
            redirect_uris,
            transport,
            multi_tenant,
            stateless,
            storage_backend,
            redis_url: optional_env(ENV_REDIS_URL),
            credentials_dir: optional_env(ENV_CREDENTIALS_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_DIR)),
            default_identity: optional_env(ENV_DEFAULT_IDENTITY),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency and the redirect URI rules.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConfigInvalid`] on the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(TollgateError::ConfigInvalid("client id is empty".to_string()).into());
        }
        if self.client_secret.is_empty() {
            return Err(TollgateError::ConfigInvalid("client secret is empty".to_string()).into());
        }
        if self.redirect_uris.is_empty() {
            return Err(TollgateError::ConfigInvalid(
                "at least one redirect URI must be registered".to_string(),
            )
            .into());
        }
        for uri in &self.redirect_uris {
            validate_redirect_uri(uri)?;
        }
        if self.multi_tenant && self.transport != TransportMode::Http {
            return Err(TollgateError::ConfigInvalid(
                "multi-tenant mode requires the http transport".to_string(),
            )
            .into());
        }
        if self.stateless && self.storage_backend == StorageBackend::File {
            return Err(TollgateError::ConfigInvalid(
                "stateless mode cannot use the file credential backend".to_string(),
            )
            .into());
        }
        if self.storage_backend == StorageBackend::Redis && self.redis_url.is_none() {
            return Err(TollgateError::ConfigInvalid(format!(
                "{ENV_REDIS_URL} must be set when the redis backend is selected"
            ))
            .into());
        }
        Ok(())
    }

    /// Returns the primary redirect URI sent to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConfigInvalid`] when no redirect URI is
    /// registered; configurations built through [`OAuthConfig::from_env`]
    /// always have one.
    pub fn redirect_uri(&self) -> Result<&Url> {
        self.redirect_uris.first().ok_or_else(|| {
            TollgateError::ConfigInvalid("no redirect URI registered".to_string()).into()
        })
    }

    /// Returns true when `target` is safe to redirect a browser to after a
    /// completed authorization: same origin as the external URL, or an
    /// exact match against a registered redirect URI.
    pub fn is_trusted_redirect_target(&self, target: &Url) -> bool {
        let same_origin = target.scheme() == self.external_url.scheme()
            && target.host() == self.external_url.host()
            && target.port_or_known_default() == self.external_url.port_or_known_default();
        same_origin || self.redirect_uris.iter().any(|u| u == target)
    }
}

// ---------------------------------------------------------------------------
// Redirect URI validation
// ---------------------------------------------------------------------------

/// Validates a single redirect URI against the registration rules.
///
/// Accepted forms:
/// - `https` URLs
/// - `http` URLs whose host is a loopback address (`localhost`,
///   `*.localhost`, `127.0.0.0/8`, `::1`)
///
/// Fragments are rejected in all cases (RFC 6749 section 3.1.2).
///
/// # Errors
///
/// Returns [`TollgateError::ConfigInvalid`] describing the violation.
pub fn validate_redirect_uri(uri: &Url) -> Result<()> {
    match uri.scheme() {
        "https" => {}
        "http" if is_loopback(uri) => {}
        "http" => {
            return Err(TollgateError::ConfigInvalid(format!(
                "plain http redirect URIs are only allowed for loopback hosts: {uri}"
            ))
            .into());
        }
        other => {
            return Err(TollgateError::ConfigInvalid(format!(
                "unsupported redirect URI scheme {other:?}: {uri}"
            ))
            .into());
        }
    }
    if uri.fragment().is_some() {
        return Err(TollgateError::ConfigInvalid(format!(
            "redirect URIs must not carry a fragment: {uri}"
        ))
        .into());
    }
    if uri.host().is_none() {
        return Err(TollgateError::ConfigInvalid(format!(
            "redirect URIs must name a host: {uri}"
        ))
        .into());
    }
    Ok(())
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
        }
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn callback_uri(external_url: &Url) -> Result<Url> {
    external_url.join(CALLBACK_PATH).map_err(|e| {
        TollgateError::ConfigInvalid(format!(
            "cannot derive callback URI from {external_url}: {e}"
        ))
        .into()
    })
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn required_env(name: &str) -> Result<String> {
    match optional_env(name) {
        Some(value) => Ok(value),
        None => Err(TollgateError::ConfigInvalid(format!(
            "environment variable {name} must be set"
        ))
        .into()),
    }
}

fn optional_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_string();
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        }
        Err(_) => None,
    }
}

fn required_url(name: &str) -> Result<Url> {
    let raw = required_env(name)?;
    parse_url(name, &raw)
}

fn parse_url(name: &str, raw: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|e| TollgateError::ConfigInvalid(format!("{name} is not a valid URL: {e}")).into())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                tracing::warn!("ignoring unrecognized boolean value {other:?} for {name}");
                default
            }
        },
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// ConfigHandle
// ---------------------------------------------------------------------------

/// Shared handle to the current [`OAuthConfig`] snapshot.
///
/// Readers call [`ConfigHandle::get`] and receive an `Arc` they keep for the
/// duration of one operation; a concurrent reload never mutates a snapshot
/// in place, it swaps the handle to a fresh one.  A reload that fails
/// validation leaves the previous snapshot in service.
pub struct ConfigHandle {
    current: RwLock<Arc<OAuthConfig>>,
}

impl ConfigHandle {
    /// Wraps an already-validated configuration.
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Builds the initial snapshot from environment variables.
    ///
    /// # Errors
    ///
    /// Propagates [`OAuthConfig::from_env`] failures; the process should
    /// refuse to start in that case.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(OAuthConfig::from_env()?))
    }

    /// Returns the current snapshot.
    ///
    /// The returned `Arc` stays valid for as long as the caller holds it,
    /// regardless of concurrent reloads.
    pub fn get(&self) -> Arc<OAuthConfig> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Rebuilds the configuration from the environment and swaps it in.
    ///
    /// The fresh snapshot is constructed and validated before the exclusive
    /// lock is taken, so readers are blocked only for the pointer swap.
    ///
    /// # Returns
    ///
    /// The newly installed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConfigInvalid`] without swapping when the
    /// environment no longer yields a valid configuration.
    pub fn reload_from_env(&self) -> Result<Arc<OAuthConfig>> {
        let fresh = Arc::new(OAuthConfig::from_env()?);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&fresh);
        tracing::info!("configuration reloaded");
        Ok(fresh)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
