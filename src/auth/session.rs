//! Session store: session records and recent-authentication bindings
//!
//! Sessions map an opaque transport-issued identifier to a resolved identity.
//! Alongside each session lives a recent-authentication binding recording
//! when that identity last completed an OAuth flow through this process;
//! bindings back the short-lived fast path that lets a session act without a
//! per-request bearer immediately after authenticating.
//!
//! Behaviors:
//! - One store-wide mutex guards both maps; every critical section is a few
//!   map operations, never I/O
//! - Bindings satisfy the fast path only while younger than the 5 minute
//!   grace window, and only when the transport re-verifies bearers per
//!   request (HTTP)
//! - Sessions are retained for 24 hours from their last verification, then
//!   evicted; resolve checks age inline so a stale record never resolves
//!   even before a sweep runs
//! - bind and resolve piggyback an eviction sweep, throttled to once per
//!   minute, so the maps stay bounded without a background task

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, TollgateError};

/// How long a recent-authentication binding satisfies the fast path.
pub const AUTH_GRACE_WINDOW_MINUTES: i64 = 5;

/// How long sessions and bindings are retained after their last activity.
pub const SESSION_RETENTION_HOURS: i64 = 24;

/// Minimum gap between piggybacked eviction sweeps.
const SWEEP_INTERVAL_SECONDS: i64 = 60;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A transport session resolved to an identity.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Identity the session acts as.
    pub identity: String,
    /// When the session was first bound.
    pub created_at: DateTime<Utc>,
    /// When the transport last verified the session's bearer.
    pub last_verified_at: DateTime<Utc>,
}

/// Records that an identity completed an OAuth flow through this process.
#[derive(Debug, Clone)]
pub struct SessionAuthBinding {
    /// Identity that authenticated.
    pub identity: String,
    /// When the authentication completed.
    pub created_at: DateTime<Utc>,
}

struct SessionInner {
    sessions: HashMap<String, SessionRecord>,
    bindings: HashMap<String, SessionAuthBinding>,
    last_sweep: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// In-memory store of sessions and recent-authentication bindings.
///
/// Operations come in pairs: a wall-clock variant (`bind`, `resolve`, ...)
/// and a deterministic `_at` variant taking an explicit instant, which the
/// wall-clock variant delegates to.
pub struct SessionStore {
    /// Whether the transport re-verifies bearers per request; the grace
    /// fast path is disabled otherwise.
    fast_path_enabled: bool,
    grace: Duration,
    retention: Duration,
    inner: Mutex<SessionInner>,
}

impl SessionStore {
    /// Creates a store.
    ///
    /// # Arguments
    ///
    /// * `fast_path_enabled` - true when the transport re-verifies bearers
    ///   per request (HTTP); the recent-authentication fast path answers
    ///   false unconditionally otherwise.
    pub fn new(fast_path_enabled: bool) -> Self {
        Self {
            fast_path_enabled,
            grace: Duration::minutes(AUTH_GRACE_WINDOW_MINUTES),
            retention: Duration::hours(SESSION_RETENTION_HOURS),
            inner: Mutex::new(SessionInner {
                sessions: HashMap::new(),
                bindings: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    /// Mints a fresh opaque session identifier.
    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Binds `session_id` to `identity` and refreshes its
    /// recent-authentication binding.
    ///
    /// Re-binding an existing session replaces its identity and counts as a
    /// verification; the session's creation time is preserved.
    pub fn bind(&self, session_id: &str, identity: &str) {
        self.bind_at(session_id, identity, Utc::now());
    }

    /// Deterministic-time variant of [`SessionStore::bind`].
    pub fn bind_at(&self, session_id: &str, identity: &str, now: DateTime<Utc>) {
        let mut inner = self.lock();
        maybe_sweep(&mut inner, self.retention, now);
        inner
            .sessions
            .entry(session_id.to_string())
            .and_modify(|record| {
                record.identity = identity.to_string();
                record.last_verified_at = now;
            })
            .or_insert_with(|| SessionRecord {
                identity: identity.to_string(),
                created_at: now,
                last_verified_at: now,
            });
        inner.bindings.insert(
            session_id.to_string(),
            SessionAuthBinding {
                identity: identity.to_string(),
                created_at: now,
            },
        );
        drop(inner);
        tracing::debug!(identity, "session bound");
    }

    /// Resolves a session identifier to its identity.
    ///
    /// A session past its retention window never resolves, even when a sweep
    /// has not removed it yet; the stale record is dropped on the spot.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::NoSession`] for unknown or expired sessions.
    pub fn resolve(&self, session_id: &str) -> Result<String> {
        self.resolve_at(session_id, Utc::now())
    }

    /// Deterministic-time variant of [`SessionStore::resolve`].
    pub fn resolve_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<String> {
        let mut inner = self.lock();
        maybe_sweep(&mut inner, self.retention, now);
        match inner.sessions.get(session_id) {
            Some(record) if now >= record.last_verified_at + self.retention => {
                inner.sessions.remove(session_id);
                inner.bindings.remove(session_id);
                Err(TollgateError::NoSession(session_id.to_string()).into())
            }
            Some(record) => Ok(record.identity.clone()),
            None => Err(TollgateError::NoSession(session_id.to_string()).into()),
        }
    }

    /// Marks a session as re-verified by the transport, extending its
    /// retention window.
    ///
    /// # Returns
    ///
    /// True when the session existed.
    pub fn touch(&self, session_id: &str) -> bool {
        self.touch_at(session_id, Utc::now())
    }

    /// Deterministic-time variant of [`SessionStore::touch`].
    pub fn touch_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.sessions.get_mut(session_id) {
            Some(record) => {
                record.last_verified_at = now;
                true
            }
            None => false,
        }
    }

    /// Returns true when the session authenticated recently enough for the
    /// fast path: the transport re-verifies bearers per request, a binding
    /// exists, and the binding is younger than the grace window.
    pub fn recent_auth_ok(&self, session_id: &str) -> bool {
        self.recent_auth_ok_at(session_id, Utc::now())
    }

    /// Deterministic-time variant of [`SessionStore::recent_auth_ok`].
    pub fn recent_auth_ok_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        if !self.fast_path_enabled {
            return false;
        }
        let inner = self.lock();
        match inner.bindings.get(session_id) {
            Some(binding) => now < binding.created_at + self.grace,
            None => false,
        }
    }

    /// Removes a session and its binding (explicit sign-out).
    ///
    /// # Returns
    ///
    /// The removed record, when the session existed.
    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        let mut inner = self.lock();
        inner.bindings.remove(session_id);
        inner.sessions.remove(session_id)
    }

    /// Evicts every session and binding past the retention window.
    ///
    /// # Returns
    ///
    /// Counts of `(sessions, bindings)` removed.
    pub fn evict_expired(&self) -> (usize, usize) {
        self.evict_expired_at(Utc::now())
    }

    /// Deterministic-time variant of [`SessionStore::evict_expired`].
    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut inner = self.lock();
        let removed = sweep(&mut inner, self.retention, now);
        inner.last_sweep = now;
        drop(inner);
        if removed != (0, 0) {
            tracing::debug!(
                sessions = removed.0,
                bindings = removed.1,
                "evicted expired sessions"
            );
        }
        removed
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of recent-authentication bindings, including ones past the
    /// grace window but not yet past retention.
    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a sweep when the last one is old enough, keeping the amortized cost
/// of bind/resolve flat.
fn maybe_sweep(inner: &mut SessionInner, retention: Duration, now: DateTime<Utc>) {
    if now < inner.last_sweep + Duration::seconds(SWEEP_INTERVAL_SECONDS) {
        return;
    }
    sweep(inner, retention, now);
    inner.last_sweep = now;
}

fn sweep(inner: &mut SessionInner, retention: Duration, now: DateTime<Utc>) -> (usize, usize) {
    let sessions_before = inner.sessions.len();
    let bindings_before = inner.bindings.len();
    inner
        .sessions
        .retain(|_, record| now < record.last_verified_at + retention);
    inner
        .bindings
        .retain(|_, binding| now < binding.created_at + retention);
    (
        sessions_before - inner.sessions.len(),
        bindings_before - inner.bindings.len(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
