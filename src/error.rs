//! Error types for Tollgate
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Tollgate operations
///
/// This enum encompasses all possible errors that can occur during
/// configuration loading, OAuth flows, credential storage, session
/// resolution, and upstream API calls.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration is missing or malformed (fail fast at startup)
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// OAuth state token is unknown, expired, or already consumed
    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    /// Session identifier is unknown or past its retention window
    #[error("Unknown or expired session: {0}")]
    NoSession(String),

    /// No verifiable identity; a fresh authorization flow is required
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// Identity is known but the stored grant lacks required scopes
    #[error("Insufficient scopes for {identity}: missing {missing}")]
    Unauthorized {
        /// The resolved identity whose grant was checked
        identity: String,
        /// Space-separated scopes absent from the stored grant
        missing: String,
    },

    /// Stored credential record failed to parse or validate
    #[error("Corrupt credential record: {0}")]
    CredentialCorrupt(String),

    /// Upstream token endpoint rejected the refresh grant
    #[error("Token refresh rejected: {0}")]
    RefreshFailed(String),

    /// Upstream service reports the API is disabled for this project
    #[error("API not enabled: {0}")]
    ApiNotEnabled(String),

    /// Provider dialog errors (token exchange, userinfo, transient upstream)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Credential backend errors (remote key-value operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TollgateError {
    /// Returns true when `err` is an authentication failure that a fresh
    /// authorization flow can resolve: `Unauthenticated`, `NoSession`, or
    /// `RefreshFailed` (the dead credential has already been deleted).
    ///
    /// Tool wrappers use this to decide whether to hand the caller an
    /// authorization URL instead of propagating the error.
    pub fn needs_authorization(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthenticated(_))
                | Some(TollgateError::NoSession(_))
                | Some(TollgateError::RefreshFailed(_))
        )
    }
}

/// Result type alias for Tollgate operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_error_display() {
        let error = TollgateError::ConfigInvalid("missing client id".to_string());
        assert_eq!(error.to_string(), "Invalid configuration: missing client id");
    }

    #[test]
    fn test_invalid_state_error_display() {
        let error = TollgateError::InvalidState("already consumed".to_string());
        assert_eq!(error.to_string(), "Invalid OAuth state: already consumed");
    }

    #[test]
    fn test_no_session_error_display() {
        let error = TollgateError::NoSession("sess-1234".to_string());
        assert_eq!(error.to_string(), "Unknown or expired session: sess-1234");
    }

    #[test]
    fn test_unauthenticated_error_display() {
        let error = TollgateError::Unauthenticated("no stored credential".to_string());
        assert_eq!(error.to_string(), "Not authenticated: no stored credential");
    }

    #[test]
    fn test_unauthorized_error_display() {
        let error = TollgateError::Unauthorized {
            identity: "user@example.com".to_string(),
            missing: "files.read".to_string(),
        };
        let s = error.to_string();
        assert!(s.contains("user@example.com"));
        assert!(s.contains("files.read"));
    }

    #[test]
    fn test_credential_corrupt_error_display() {
        let error = TollgateError::CredentialCorrupt("truncated JSON".to_string());
        assert_eq!(error.to_string(), "Corrupt credential record: truncated JSON");
    }

    #[test]
    fn test_refresh_failed_error_display() {
        let error = TollgateError::RefreshFailed("invalid_grant".to_string());
        assert_eq!(error.to_string(), "Token refresh rejected: invalid_grant");
    }

    #[test]
    fn test_api_not_enabled_error_display() {
        let error = TollgateError::ApiNotEnabled("files API".to_string());
        assert_eq!(error.to_string(), "API not enabled: files API");
    }

    #[test]
    fn test_provider_error_display() {
        let error = TollgateError::Provider("token endpoint timeout".to_string());
        assert_eq!(error.to_string(), "Provider error: token endpoint timeout");
    }

    #[test]
    fn test_storage_error_display() {
        let error = TollgateError::Storage("redis connection refused".to_string());
        assert_eq!(error.to_string(), "Storage error: redis connection refused");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: TollgateError = io_error.into();
        assert!(matches!(error, TollgateError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_str = "{invalid json}";
        let json_error = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let error: TollgateError = json_error.into();
        assert!(matches!(error, TollgateError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_str = "invalid: : yaml";
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>(yaml_str).unwrap_err();
        let error: TollgateError = yaml_error.into();
        assert!(matches!(error, TollgateError::Yaml(_)));
    }

    #[test]
    fn test_needs_authorization_matches_unauthenticated() {
        let err: anyhow::Error =
            TollgateError::Unauthenticated("no stored credential".to_string()).into();
        assert!(TollgateError::needs_authorization(&err));
    }

    #[test]
    fn test_needs_authorization_matches_no_session() {
        let err: anyhow::Error = TollgateError::NoSession("sess-9".to_string()).into();
        assert!(TollgateError::needs_authorization(&err));
    }

    #[test]
    fn test_needs_authorization_matches_refresh_failed() {
        let err: anyhow::Error = TollgateError::RefreshFailed("invalid_grant".to_string()).into();
        assert!(TollgateError::needs_authorization(&err));
    }

    #[test]
    fn test_needs_authorization_rejects_other_errors() {
        let err: anyhow::Error = TollgateError::Unauthorized {
            identity: "user@example.com".to_string(),
            missing: "events.read".to_string(),
        }
        .into();
        assert!(!TollgateError::needs_authorization(&err));

        let err: anyhow::Error = TollgateError::Provider("timeout".to_string()).into();
        assert!(!TollgateError::needs_authorization(&err));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TollgateError>();
    }
}
