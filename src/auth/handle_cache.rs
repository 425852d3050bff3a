//! Authorization-handle cache with per-key single-flight builds
//!
//! Building a service handle costs a network round trip, so handles are
//! cached per `(identity, scope-set)` for a TTL.  The cache is generic over
//! the handle type; the broker instantiates it with the API client.
//!
//! Concurrency design:
//! - An outer `std::sync::Mutex` guards only the map of slots; it is never
//!   held across I/O or an `.await`
//! - Each slot is an `Arc<tokio::sync::Mutex<..>>` held across the build,
//!   so concurrent requests for the same key run exactly one builder and
//!   share its result, while different keys build in parallel
//! - Entries are immutable once built: expiry replaces the `Arc`, it never
//!   mutates the handle, so callers that already hold one keep using it
//!   safely
//! - Handles need no teardown; dropping the last `Arc` is the cleanup

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::auth::scopes::ScopeSet;
use crate::error::Result;

/// How long a built handle is served before being rebuilt.
pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    identity: String,
    /// Normalized scope rendering, so request order cannot split entries.
    scopes: String,
}

struct Built<H> {
    handle: Arc<H>,
    built_at: Instant,
}

struct Slot<H> {
    built: Option<Built<H>>,
}

// ---------------------------------------------------------------------------
// HandleCache
// ---------------------------------------------------------------------------

/// TTL cache of immutable service handles keyed by identity and scope set.
pub struct HandleCache<H> {
    ttl: Duration,
    slots: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<Slot<H>>>>>,
}

impl<H> HandleCache<H> {
    /// Creates a cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_HANDLE_TTL)
    }

    /// Creates a cache with an explicit TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `(identity, scopes)`, or runs `build`
    /// to produce one.
    ///
    /// When several callers race on the same key, exactly one executes the
    /// builder; the rest wait on the slot lock and share the result.  An
    /// expired entry is never returned: the caller that finds one rebuilds
    /// in place.
    ///
    /// # Errors
    ///
    /// Propagates the builder's error; the slot is left empty so the next
    /// caller retries.
    pub async fn get_or_build<F, Fut>(
        &self,
        identity: &str,
        scopes: &ScopeSet,
        build: F,
    ) -> Result<Arc<H>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        let slot = {
            let mut slots = self.lock();
            Arc::clone(
                slots
                    .entry(CacheKey {
                        identity: identity.to_string(),
                        scopes: scopes.cache_key(),
                    })
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Slot { built: None }))),
            )
        };

        let mut guard = slot.lock().await;
        if let Some(built) = &guard.built {
            if built.built_at.elapsed() < self.ttl {
                tracing::debug!(identity, "handle cache hit");
                return Ok(Arc::clone(&built.handle));
            }
            tracing::debug!(identity, "handle cache entry expired, rebuilding");
        }

        let handle = Arc::new(build().await?);
        guard.built = Some(Built {
            handle: Arc::clone(&handle),
            built_at: Instant::now(),
        });
        tracing::debug!(identity, "service handle built");
        Ok(handle)
    }

    /// Drops every cached entry for `identity`, across all scope sets.
    ///
    /// Callers that already hold a handle keep it; this only stops the
    /// cache from serving the identity again.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub fn invalidate_identity(&self, identity: &str) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|key, _| key.identity != identity);
        before - slots.len()
    }

    /// Removes expired and never-built slots from the map.
    ///
    /// Slots with a build in flight are kept; they are about to be fresh.
    ///
    /// # Returns
    ///
    /// The number of slots removed.
    pub fn purge_expired(&self) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => match &guard.built {
                Some(built) => built.built_at.elapsed() < self.ttl,
                None => false,
            },
            Err(_) => true,
        });
        before - slots.len()
    }

    /// Number of slots currently in the map, fresh or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true when the cache holds no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<tokio::sync::Mutex<Slot<H>>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H> Default for HandleCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
