//! list_events tool for listing calendar events
//!
//! Performs one remote call against the events surface of an authorized
//! handle, bounded by an optional time window.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::auth::broker::AuthorizedHandle;
use crate::auth::scopes::{self, ScopeSet};
use crate::error::Result;
use crate::services::EventsSurface;
use crate::tools::{ToolHandler, ToolResult};

fn default_max_results() -> u32 {
    25
}

/// Parameters for the list_events tool
#[derive(Debug, Clone, Deserialize)]
struct ListEventsParams {
    /// Inclusive lower bound of the window, RFC 3339
    #[serde(default)]
    time_min: Option<String>,
    /// Exclusive upper bound of the window, RFC 3339
    #[serde(default)]
    time_max: Option<String>,
    /// Maximum number of events to return
    #[serde(default = "default_max_results")]
    max_results: u32,
}

/// Tool listing upcoming events on the identity's primary calendar.
pub struct ListEventsTool;

impl ListEventsTool {
    /// Creates a new ListEventsTool instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for ListEventsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for ListEventsTool {
    fn name(&self) -> &'static str {
        "list_events"
    }

    fn definition(&self) -> serde_json::Value {
        json!({
            "name": "list_events",
            "description": "List events on the user's primary calendar, ordered by start time, within an optional RFC 3339 window.",
            "parameters": {
                "type": "object",
                "properties": {
                    "time_min": {
                        "type": "string",
                        "description": "Inclusive lower bound of the window (RFC 3339, e.g. 2024-05-01T00:00:00Z)"
                    },
                    "time_max": {
                        "type": "string",
                        "description": "Exclusive upper bound of the window (RFC 3339)"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of events to return (default: 25)"
                    }
                }
            }
        })
    }

    fn required_scopes(&self) -> ScopeSet {
        scopes::events_read()
    }

    async fn call(&self, handle: &AuthorizedHandle, args: serde_json::Value) -> Result<ToolResult> {
        let params: ListEventsParams = serde_json::from_value(args)?;

        let events = EventsSurface::new(handle.client.clone());
        let listing = events
            .list(
                params.time_min.as_deref(),
                params.time_max.as_deref(),
                params.max_results,
            )
            .await?;

        Ok(
            ToolResult::success(serde_json::to_string_pretty(&listing)?)
                .with_metadata("identity", handle.identity.clone()),
        )
    }
}
