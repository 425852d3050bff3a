//! Tools module for Tollgate
//!
//! This module contains the tool-wrapper boundary: the handler trait each
//! wrapped remote call implements, the registry that dispatches calls, and
//! the bounded retry helper for transient upstream failures.
//!
//! Wrappers never touch the credential, session, or state stores directly.
//! The registry calls [`crate::auth::AuthBroker::authorize`] once per
//! dispatch; when authorization is missing it answers with a
//! needs-authorization envelope carrying the URL to open instead of failing
//! the call outright.

pub mod list_events;
pub mod list_files;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::auth::broker::{AuthBroker, AuthorizedHandle, CallerContext};
use crate::auth::scopes::ScopeSet;
use crate::error::{Result, TollgateError};

/// Bounded attempts for transient upstream failures.
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;

/// Initial delay before the first retry; doubles per attempt.
const RETRY_BASE_DELAY_MS: u64 = 200;

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

/// Result of a tool execution, with authorization guidance support.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool execution succeeded.
    pub success: bool,
    /// Output from the tool.
    pub output: String,
    /// Error message if execution failed.
    pub error: Option<String>,
    /// URL the end user must open when authorization is required.
    pub authorization_url: Option<Url>,
    /// Additional metadata about the execution.
    pub metadata: HashMap<String, String>,
}

impl ToolResult {
    /// Create a successful tool result
    ///
    /// # Arguments
    ///
    /// * `output` - Tool output
    pub fn success(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
            authorization_url: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a failed tool result
    ///
    /// # Arguments
    ///
    /// * `error` - Error message
    pub fn error(error: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            authorization_url: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a needs-authorization result carrying the URL to open
    ///
    /// # Arguments
    ///
    /// * `url` - Authorization URL for the end user's browser
    /// * `message` - Guidance text shown alongside the URL
    pub fn needs_authorization(url: Url, message: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
            authorization_url: Some(url),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the result
    ///
    /// # Returns
    ///
    /// Returns self for chaining
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Convert to a message string for the caller
    pub fn to_message(&self) -> String {
        if self.success {
            return self.output.clone();
        }
        let detail = self
            .error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string());
        match &self.authorization_url {
            Some(url) => format!("{detail}\nAuthorize at: {url}"),
            None => format!("Error: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolHandler
// ---------------------------------------------------------------------------

/// Trait each wrapped remote call implements.
///
/// A handler performs exactly one remote call through the
/// [`AuthorizedHandle`] it is given; identity resolution, refresh, scope
/// checks, and handle caching all happen in the registry before `call` runs.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Stable tool name used for dispatch.
    fn name(&self) -> &'static str;

    /// Returns the tool definition as a JSON value
    ///
    /// The definition follows the function-calling format:
    /// ```json
    /// {
    ///   "name": "tool_name",
    ///   "description": "Tool description",
    ///   "parameters": {
    ///     "type": "object",
    ///     "properties": {
    ///       "param1": {"type": "string", "description": "..."}
    ///     }
    ///   }
    /// }
    /// ```
    fn definition(&self) -> serde_json::Value;

    /// Scopes this tool's remote call requires.
    fn required_scopes(&self) -> ScopeSet;

    /// Executes the tool's one remote call
    ///
    /// # Arguments
    ///
    /// * `handle` - Authorized handle covering [`ToolHandler::required_scopes`]
    /// * `args` - Tool arguments as a JSON value
    ///
    /// # Errors
    ///
    /// Returns error if execution fails
    async fn call(&self, handle: &AuthorizedHandle, args: serde_json::Value) -> Result<ToolResult>;
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Tool registry for managing and dispatching available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry with the built-in tools registered
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(list_files::ListFilesTool::new()));
        registry.register(Arc::new(list_events::ListEventsTool::new()));
        registry
    }

    /// Register a tool handler in the registry
    ///
    /// # Arguments
    ///
    /// * `handler` - Tool handler implementation, keyed by its name
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(handler.name().to_string(), handler);
    }

    /// Get a tool handler by name
    ///
    /// # Returns
    ///
    /// Returns the tool handler if found
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// Get all tool definitions as JSON values
    pub fn all_definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|handler| handler.definition())
            .collect()
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Authorizes the caller and executes the named tool.
    ///
    /// When authorization is missing or insufficient a flow is started and a
    /// needs-authorization envelope is returned instead of an error; the
    /// caller relays the URL to the end user and retries the tool after the
    /// browser flow completes.
    ///
    /// # Errors
    ///
    /// Propagates failures that are neither authorization guidance nor a
    /// user-actionable upstream condition.
    pub async fn dispatch(
        &self,
        broker: &AuthBroker,
        caller: &CallerContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolResult> {
        let Some(handler) = self.get(name) else {
            return Ok(ToolResult::error(format!("Unknown tool: {name}")));
        };
        let required = handler.required_scopes();
        let handle = match broker.authorize(caller, &required).await {
            Ok(handle) => handle,
            Err(err) => return authorization_guidance(broker, caller, name, &required, err),
        };
        retry_transient(name, || handler.call(&handle, args.clone())).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns an `authorize` failure into user guidance where possible.
///
/// Missing or expired credentials and missing scopes both start a fresh
/// authorization flow and answer with its URL; a disabled upstream API is
/// reported as a plain tool error.  Everything else propagates.
fn authorization_guidance(
    broker: &AuthBroker,
    caller: &CallerContext,
    name: &str,
    required: &ScopeSet,
    err: anyhow::Error,
) -> Result<ToolResult> {
    if TollgateError::needs_authorization(&err) {
        tracing::info!(tool = name, error = %err, "starting authorization flow");
        let url = broker.begin_authorization(caller, required, None)?;
        return Ok(ToolResult::needs_authorization(
            url,
            format!("Authorization required for {name}. Open the URL in a browser to grant access."),
        ));
    }
    match err.downcast_ref::<TollgateError>() {
        Some(TollgateError::Unauthorized { missing, .. }) => {
            tracing::info!(tool = name, missing = %missing, "requesting additional scopes");
            let url = broker.begin_authorization(caller, required, None)?;
            Ok(ToolResult::needs_authorization(
                url,
                format!(
                    "Additional permissions required for {name} (missing: {missing}). Open the URL in a browser to grant access."
                ),
            ))
        }
        Some(TollgateError::ApiNotEnabled(detail)) => Ok(ToolResult::error(format!(
            "The upstream API is not enabled for this project: {detail}"
        ))),
        _ => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Transient retry
// ---------------------------------------------------------------------------

/// Runs `attempt` with bounded retries on transient upstream failures.
///
/// Only provider/network errors are retried; authorization errors and every
/// other failure propagate immediately.  Delay doubles per attempt.
///
/// # Arguments
///
/// * `operation` - Name used in log lines
/// * `attempt` - Closure producing a fresh future per attempt
///
/// # Examples
///
/// ```
/// # use tollgate::tools::retry_transient;
/// # tokio_test::block_on(async {
/// let value = retry_transient("demo", || async { Ok::<_, anyhow::Error>(42) })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// # });
/// ```
pub async fn retry_transient<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if attempts < MAX_TRANSIENT_ATTEMPTS && is_transient(&err) => {
                tracing::debug!(
                    operation,
                    attempt = attempts,
                    max_attempts = MAX_TRANSIENT_ATTEMPTS,
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Whether an error is worth a bounded retry.
fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TollgateError>(),
        Some(TollgateError::Provider(_) | TollgateError::Http(_))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
