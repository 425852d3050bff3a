//! OAuth authorization for Tollgate
//!
//! This module contains the full credential lifecycle: configuration
//! snapshots, credential stores, the browser authorization flow with PKCE,
//! anti-CSRF state tracking, transport sessions, the authorized-handle
//! cache, and the broker that ties them together.

pub mod broker;
pub mod config;
pub mod credentials;
pub mod flow;
pub mod handle_cache;
pub mod pkce;
pub mod remote;
pub mod scopes;
pub mod session;
pub mod state;

pub use broker::{AuthBroker, AuthorizedHandle, CallerContext, CompletedAuthorization};
pub use config::{ConfigHandle, OAuthConfig, StorageBackend, TransportMode, CALLBACK_PATH};
pub use credentials::{open_store, CredentialRecord, CredentialStore, MemoryCredentialStore};
pub use scopes::ScopeSet;
pub use session::SessionStore;
pub use state::StateStore;
