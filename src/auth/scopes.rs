//! OAuth scope sets and the capability registry
//!
//! This module provides:
//! - [`ScopeSet`]: a normalized (sorted, deduplicated) set of OAuth scope
//!   strings with subset checks and a stable cache-key rendering
//! - Capability constructors ([`base`], [`files_read`], [`files_write`],
//!   [`events_read`], [`events_write`]) naming the scopes each operation
//!   category requires
//!
//! Normalization makes two sets with the same scopes compare equal and render
//! the same cache key regardless of the order callers listed them in, which
//! keeps the authorization-handle cache from fragmenting.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ScopeSet
// ---------------------------------------------------------------------------

/// A normalized set of OAuth scope strings.
///
/// Scopes are stored sorted and deduplicated, so equality, hashing, and
/// [`ScopeSet::cache_key`] are independent of construction order.  Empty
/// strings are discarded during normalization.
///
/// # Examples
///
/// ```
/// use tollgate::auth::scopes::ScopeSet;
///
/// let a = ScopeSet::new(["files.read", "openid"]);
/// let b = ScopeSet::parse("openid files.read");
/// assert_eq!(a, b);
/// assert_eq!(a.cache_key(), "files.read openid");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ScopeSet {
    scopes: Vec<String>,
}

impl ScopeSet {
    /// Creates a normalized scope set from any iterable of scope strings.
    ///
    /// # Arguments
    ///
    /// * `scopes` - Scope strings in any order, duplicates allowed.
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scopes: Vec<String> = scopes
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        scopes.sort();
        scopes.dedup();
        Self { scopes }
    }

    /// Creates an empty scope set.
    pub fn empty() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Parses a space-separated scope string, as used in OAuth `scope`
    /// parameters and token responses.
    ///
    /// # Examples
    ///
    /// ```
    /// use tollgate::auth::scopes::ScopeSet;
    ///
    /// let scopes = ScopeSet::parse("openid email  files.read");
    /// assert_eq!(scopes.len(), 3);
    /// ```
    pub fn parse(value: &str) -> Self {
        Self::new(value.split_whitespace().map(str::to_string))
    }

    /// Returns true when every scope in `required` is present in `self`.
    ///
    /// An empty `required` set is trivially satisfied.
    pub fn contains_all(&self, required: &ScopeSet) -> bool {
        required
            .scopes
            .iter()
            .all(|s| self.scopes.binary_search(s).is_ok())
    }

    /// Returns the scopes in `required` that are absent from `self`.
    pub fn missing_from(&self, required: &ScopeSet) -> ScopeSet {
        ScopeSet::new(
            required
                .scopes
                .iter()
                .filter(|s| self.scopes.binary_search(s).is_err())
                .cloned(),
        )
    }

    /// Returns the union of two scope sets.
    pub fn union(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet::new(self.scopes.iter().chain(other.scopes.iter()).cloned())
    }

    /// Renders the set as a stable, space-separated string.
    ///
    /// Two sets with the same scopes always produce the same key, making this
    /// suitable as part of a cache-map key.
    pub fn cache_key(&self) -> String {
        self.scopes.join(" ")
    }

    /// Returns the number of scopes in the set.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Returns true when the set contains no scopes.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Iterates over the scopes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

impl From<Vec<String>> for ScopeSet {
    fn from(scopes: Vec<String>) -> Self {
        Self::new(scopes)
    }
}

impl From<ScopeSet> for Vec<String> {
    fn from(set: ScopeSet) -> Self {
        set.scopes
    }
}

// ---------------------------------------------------------------------------
// Capability registry
// ---------------------------------------------------------------------------

/// Scopes required by every authorization: identity resolution needs the
/// provider to release a verified email address.
pub fn base() -> ScopeSet {
    ScopeSet::new(["openid", "email"])
}

/// Scopes for read-only file listing and metadata operations.
pub fn files_read() -> ScopeSet {
    ScopeSet::new(["files.read"])
}

/// Scopes for file creation and mutation operations.
pub fn files_write() -> ScopeSet {
    ScopeSet::new(["files.read", "files.write"])
}

/// Scopes for read-only calendar event operations.
pub fn events_read() -> ScopeSet {
    ScopeSet::new(["events.read"])
}

/// Scopes for calendar event creation and mutation operations.
pub fn events_write() -> ScopeSet {
    ScopeSet::new(["events.read", "events.write"])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
