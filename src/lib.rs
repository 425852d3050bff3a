//! Tollgate - OAuth credential broker library
//!
//! This library brokers OAuth authorizations for upstream service APIs,
//! keeping refreshed credentials, session bindings, and authorized API
//! handles ready for callers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: Broker core, provider flow, credential/session/state stores
//! - `services`: Authenticated API client and per-service surfaces
//! - `tools`: Tool registry and handlers layered over the broker
//! - `server`: Callback HTTP server for the authorization redirect
//! - `config`: Server configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::auth::{open_store, AuthBroker, ConfigHandle};
//! use tollgate::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/tollgate.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let oauth = Arc::new(ConfigHandle::from_env()?);
//!     let snapshot = oauth.get();
//!     let store = open_store(&snapshot).await?;
//!     let broker = Arc::new(AuthBroker::new(oauth, reqwest::Client::new(), store));
//!
//!     tollgate::server::serve(config.listen_addr()?, broker).await
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod services;
pub mod tools;

// Re-export commonly used types
pub use auth::{
    AuthBroker, AuthorizedHandle, CallerContext, CompletedAuthorization, ConfigHandle, ScopeSet,
};
pub use config::Config;
pub use error::{Result, TollgateError};
pub use tools::{ToolHandler, ToolRegistry, ToolResult};
