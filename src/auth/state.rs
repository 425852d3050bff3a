//! OAuth state store: anti-CSRF tokens and pending authorizations
//!
//! Every authorization redirect carries an unguessable `state` token minted
//! here.  The token indexes a [`PendingAuthorization`] holding everything the
//! callback needs to finish the flow: the PKCE verifier, the requested
//! scopes, the originating session, and where to send the browser afterward.
//!
//! Behaviors:
//! - Tokens are 16 random bytes, base64url-encoded without padding
//! - [`StateStore::consume`] is atomic single-use: the lookup and the removal
//!   happen under one lock, so concurrent callbacks with the same token
//!   yield exactly one winner
//! - Entries expire after a fixed TTL (10 minutes by default); expired,
//!   unknown, and replayed tokens all fail with
//!   [`TollgateError::InvalidState`]
//! - Expired entries are garbage-collected by trimming the arrival-order
//!   queue from the front on every operation, which is O(1) amortized since
//!   each entry is pushed and popped at most once

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use url::Url;

use crate::auth::scopes::ScopeSet;
use crate::error::{Result, TollgateError};

/// Default lifetime of an issued state token.
pub const DEFAULT_STATE_TTL_MINUTES: i64 = 10;

// ---------------------------------------------------------------------------
// Request / pending record
// ---------------------------------------------------------------------------

/// What a caller asks for when starting an authorization flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Where to redirect the browser after the callback completes.
    pub redirect_target: Option<Url>,
    /// Session to bind the resulting identity to, when the caller has one.
    pub session_id: Option<String>,
    /// Scopes the authorization URL will request.
    pub scopes: ScopeSet,
    /// PKCE code verifier to present during the token exchange.
    pub pkce_verifier: String,
}

/// A pending authorization indexed by its state token.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Where to redirect the browser after the callback completes.
    pub redirect_target: Option<Url>,
    /// Session to bind the resulting identity to, when known.
    pub session_id: Option<String>,
    /// Scopes the authorization URL requested.
    pub scopes: ScopeSet,
    /// PKCE code verifier to present during the token exchange.
    pub pkce_verifier: String,
    /// When the state token was minted.
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now >= self.created_at + ttl
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

struct StateInner {
    pending: HashMap<String, PendingAuthorization>,
    /// State tokens in arrival order; the front is always the oldest.
    arrival: VecDeque<(DateTime<Utc>, String)>,
}

/// In-memory store of pending authorizations.
///
/// All access goes through one mutex; no I/O happens under the lock, so
/// critical sections are a few map operations long.
pub struct StateStore {
    ttl: Duration,
    inner: Mutex<StateInner>,
}

impl StateStore {
    /// Creates a store with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::minutes(DEFAULT_STATE_TTL_MINUTES))
    }

    /// Creates a store with an explicit TTL.  Deterministic-lifetime variant
    /// used by tests and short-lived embedding scenarios.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(StateInner {
                pending: HashMap::new(),
                arrival: VecDeque::new(),
            }),
        }
    }

    /// Mints a fresh state token for `request` and records the pending
    /// authorization under it.
    ///
    /// # Returns
    ///
    /// The state token to embed in the authorization URL.
    pub fn issue(&self, request: AuthorizationRequest) -> String {
        let now = Utc::now();
        let token = generate_state();
        let mut inner = self.lock();
        trim_expired(&mut inner, self.ttl, now);
        inner.arrival.push_back((now, token.clone()));
        inner.pending.insert(
            token.clone(),
            PendingAuthorization {
                redirect_target: request.redirect_target,
                session_id: request.session_id,
                scopes: request.scopes,
                pkce_verifier: request.pkce_verifier,
                created_at: now,
            },
        );
        let outstanding = inner.pending.len();
        drop(inner);
        tracing::debug!(outstanding, "issued OAuth state token");
        token
    }

    /// Atomically removes and returns the pending authorization for `state`.
    ///
    /// Exactly one concurrent caller can win a given token; every other
    /// caller, and any caller presenting an expired or unknown token, gets
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidState`] when the token is unknown,
    /// already consumed, or past its TTL.
    pub fn consume(&self, state: &str) -> Result<PendingAuthorization> {
        let now = Utc::now();
        let mut inner = self.lock();
        trim_expired(&mut inner, self.ttl, now);
        let pending = inner.pending.remove(state);
        drop(inner);

        match pending {
            Some(pending) if pending.is_expired(self.ttl, now) => {
                tracing::warn!(state = %truncate(state), "rejected expired OAuth state token");
                Err(TollgateError::InvalidState("state token expired".to_string()).into())
            }
            Some(pending) => Ok(pending),
            None => {
                tracing::warn!(state = %truncate(state), "rejected unknown OAuth state token");
                Err(TollgateError::InvalidState(
                    "unknown or already consumed state token".to_string(),
                )
                .into())
            }
        }
    }

    /// Number of live pending authorizations.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns true when no authorizations are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops expired entries from the front of the arrival queue.
///
/// The queue is in arrival order, so the scan stops at the first live entry;
/// tokens already consumed leave a queue remnant that is skipped here.
fn trim_expired(inner: &mut StateInner, ttl: Duration, now: DateTime<Utc>) {
    while let Some((created_at, _)) = inner.arrival.front() {
        if now < *created_at + ttl {
            break;
        }
        if let Some((_, token)) = inner.arrival.pop_front() {
            inner.pending.remove(&token);
        }
    }
}

/// Generates an unguessable state token: 16 cryptographically random bytes,
/// base64url-encoded without padding.
pub fn generate_state() -> String {
    use rand::RngCore as _;

    let mut random_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Leading fragment of a token, for log lines that must not reproduce the
/// full secret.  At most eight bytes, always cut on a char boundary: callback
/// query strings put arbitrary UTF-8 here.
fn truncate(token: &str) -> &str {
    let mut end = token.len().min(8);
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    &token[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
