//! Upstream API client and capability surfaces
//!
//! A [`ServiceClient`] is the handle the authorization-handle cache stores:
//! an HTTP client bound to one identity's access token and the configured
//! API base URL.  Construction probes the suite's `about` endpoint, so a
//! cached handle is known to have worked at least once.
//!
//! Upstream status mapping:
//! - 401 maps to [`TollgateError::Unauthenticated`]
//! - 403 carrying a service-disabled marker maps to
//!   [`TollgateError::ApiNotEnabled`]
//! - anything else non-2xx maps to [`TollgateError::Provider`]
//!
//! The capability surfaces ([`FilesSurface`], [`EventsSurface`]) are thin
//! adapters that shape one remote call each; tool wrappers own retries and
//! result envelopes.

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::error::{Result, TollgateError};

const ABOUT_PATH: &str = "v1/about";
const FILES_PATH: &str = "v1/files";
const EVENTS_PATH: &str = "v1/events";

// ---------------------------------------------------------------------------
// ServiceClient
// ---------------------------------------------------------------------------

/// Immutable handle for calling the upstream API suite as one identity.
#[derive(Debug)]
pub struct ServiceClient {
    http: reqwest::Client,
    api_base: Url,
    access_token: String,
    identity: String,
}

impl ServiceClient {
    /// Builds a handle and probes the `about` endpoint once.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Unauthenticated`] when the token is
    /// rejected, [`TollgateError::ApiNotEnabled`] when the suite reports
    /// itself disabled for this project, and [`TollgateError::Provider`]
    /// for other upstream failures.
    pub async fn connect(
        http: reqwest::Client,
        api_base: Url,
        access_token: String,
        identity: String,
    ) -> Result<Self> {
        let client = Self {
            http,
            api_base,
            access_token,
            identity,
        };
        client.get_json(ABOUT_PATH, &[]).await?;
        tracing::debug!(identity = %client.identity, "service handle connected");
        Ok(client)
    }

    /// Identity this handle acts as.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Performs a GET against the suite and parses the JSON response.
    ///
    /// # Arguments
    ///
    /// * `path` - Path relative to the API base, without a leading slash.
    /// * `query` - Query parameters to append.
    pub async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| TollgateError::Provider(format!("upstream request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| {
                    TollgateError::Provider(format!("upstream response unreadable: {e}")).into()
                });
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_api_error(status, &body))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TollgateError::ConfigInvalid(format!(
                    "API base URL cannot carry paths: {}",
                    self.api_base
                ))
            })?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }
}

/// Maps an upstream error status to the crate taxonomy.
fn map_api_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    match status {
        reqwest::StatusCode::UNAUTHORIZED => {
            TollgateError::Unauthenticated("upstream rejected the access token".to_string()).into()
        }
        reqwest::StatusCode::FORBIDDEN if is_disabled_marker(body) => {
            TollgateError::ApiNotEnabled(
                "the API suite is disabled for this project; enable it in the provider console"
                    .to_string(),
            )
            .into()
        }
        _ => TollgateError::Provider(format!("upstream returned status {status}: {body}")).into(),
    }
}

/// Recognizes the provider's service-disabled phrasings inside a 403 body.
fn is_disabled_marker(body: &str) -> bool {
    body.contains("accessNotConfigured")
        || body.contains("SERVICE_DISABLED")
        || body.contains("service_disabled")
}

// ---------------------------------------------------------------------------
// Capability surfaces
// ---------------------------------------------------------------------------

/// File listing and metadata operations.
pub struct FilesSurface {
    client: Arc<ServiceClient>,
}

impl FilesSurface {
    /// Wraps an authorized handle.
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }

    /// Lists files, newest first.
    ///
    /// # Arguments
    ///
    /// * `query` - Provider-side search expression, when given.
    /// * `page_size` - Maximum number of files to return.
    pub async fn list(&self, query: Option<&str>, page_size: u32) -> Result<Value> {
        let mut params = vec![
            ("pageSize", page_size.to_string()),
            ("orderBy", "modifiedTime desc".to_string()),
        ];
        if let Some(query) = query {
            params.push(("q", query.to_string()));
        }
        self.client.get_json(FILES_PATH, &params).await
    }
}

/// Calendar event operations.
pub struct EventsSurface {
    client: Arc<ServiceClient>,
}

impl EventsSurface {
    /// Wraps an authorized handle.
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }

    /// Lists events inside a time window, expanded and ordered by start.
    ///
    /// # Arguments
    ///
    /// * `time_min` / `time_max` - RFC 3339 window bounds, when given.
    /// * `max_results` - Maximum number of events to return.
    pub async fn list(
        &self,
        time_min: Option<&str>,
        time_max: Option<&str>,
        max_results: u32,
    ) -> Result<Value> {
        let mut params = vec![
            ("maxResults", max_results.to_string()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
        ];
        if let Some(time_min) = time_min {
            params.push(("timeMin", time_min.to_string()));
        }
        if let Some(time_max) = time_max {
            params.push(("timeMax", time_max.to_string()));
        }
        self.client.get_json(EVENTS_PATH, &params).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
