//! list_files tool for listing files in the user's drive
//!
//! Performs one remote call against the files surface of an authorized
//! handle, with optional search filtering.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::auth::broker::AuthorizedHandle;
use crate::auth::scopes::{self, ScopeSet};
use crate::error::Result;
use crate::services::FilesSurface;
use crate::tools::{ToolHandler, ToolResult};

fn default_page_size() -> u32 {
    25
}

/// Parameters for the list_files tool
#[derive(Debug, Clone, Deserialize)]
struct ListFilesParams {
    /// Provider-side search expression
    #[serde(default)]
    query: Option<String>,
    /// Maximum number of files to return
    #[serde(default = "default_page_size")]
    page_size: u32,
}

/// Tool listing the most recent files visible to the identity.
pub struct ListFilesTool;

impl ListFilesTool {
    /// Creates a new ListFilesTool instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for ListFilesTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn definition(&self) -> serde_json::Value {
        json!({
            "name": "list_files",
            "description": "List files in the user's drive, newest first, with an optional search expression.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Optional provider-side search expression (e.g. name contains 'report')"
                    },
                    "page_size": {
                        "type": "integer",
                        "description": "Maximum number of files to return (default: 25)"
                    }
                }
            }
        })
    }

    fn required_scopes(&self) -> ScopeSet {
        scopes::files_read()
    }

    async fn call(&self, handle: &AuthorizedHandle, args: serde_json::Value) -> Result<ToolResult> {
        let params: ListFilesParams = serde_json::from_value(args)?;

        let files = FilesSurface::new(handle.client.clone());
        let listing = files.list(params.query.as_deref(), params.page_size).await?;

        Ok(
            ToolResult::success(serde_json::to_string_pretty(&listing)?)
                .with_metadata("identity", handle.identity.clone()),
        )
    }
}
