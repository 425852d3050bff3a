//! Provider dialogs: authorization URLs, token exchange, refresh, userinfo
//!
//! This module is the only place that talks to the OAuth provider.  Every
//! method takes an [`OAuthConfig`] snapshot, so a configuration reload
//! mid-operation cannot mix endpoints from two generations.
//!
//! Error mapping is deliberate:
//! - Transport failures and provider 5xx responses map to
//!   [`TollgateError::Provider`] (transient, safe to retry)
//! - A token-endpoint 4xx during refresh maps to
//!   [`TollgateError::RefreshFailed`] (the grant is dead; the broker deletes
//!   the credential)
//! - A userinfo 401 or an unverified/absent email maps to
//!   [`TollgateError::Unauthenticated`]

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use url::Url;

use crate::auth::config::OAuthConfig;
use crate::auth::pkce::PkceChallenge;
use crate::auth::scopes::ScopeSet;
use crate::error::{Result, TollgateError};

// ---------------------------------------------------------------------------
// TokenGrant
// ---------------------------------------------------------------------------

/// What a successful token-endpoint dialog yields.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// Fresh access token.
    pub access_token: String,
    /// Refresh token, when the provider issued one.  Refresh responses
    /// usually omit it; callers carry the previous one forward.
    pub refresh_token: Option<String>,
    /// Absolute expiry derived from the response's `expires_in`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes the provider confirmed, when it echoed a `scope` field.
    pub scopes: Option<ScopeSet>,
}

/// Wire shape of a token endpoint response (RFC 6749 section 5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            scopes: self.scope.as_deref().map(ScopeSet::parse),
        }
    }
}

/// Wire shape of a userinfo response; only the identity fields matter here.
#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
}

// ---------------------------------------------------------------------------
// ProviderFlow
// ---------------------------------------------------------------------------

/// Stateless client for the provider's OAuth endpoints.
pub struct ProviderFlow {
    http: reqwest::Client,
}

impl ProviderFlow {
    /// Creates a flow sharing the given HTTP client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Builds the authorization URL a browser is sent to.
    ///
    /// Offline access with forced consent is requested so the provider
    /// returns a refresh token; a stored record without one is unusable.
    ///
    /// # Arguments
    ///
    /// * `scopes` - Scopes to request, already merged with the base
    ///   identity scopes by the caller.
    /// * `state` - Anti-CSRF token minted by the state store.
    /// * `pkce` - Challenge pair whose verifier the state store carries.
    pub fn build_authorization_url(
        &self,
        config: &OAuthConfig,
        scopes: &ScopeSet,
        state: &str,
        pkce: &PkceChallenge,
    ) -> Result<Url> {
        let redirect_uri = config.redirect_uri()?;
        let mut url = config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("scope", &scopes.cache_key())
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", &pkce.method)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true");
        Ok(url)
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Provider`] for transport failures, non-2xx
    /// responses, and unusable response bodies.
    pub async fn exchange_code(
        &self,
        config: &OAuthConfig,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenGrant> {
        let redirect_uri = config.redirect_uri()?.to_string();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("code_verifier", pkce_verifier),
        ];

        let response = self
            .http
            .post(config.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| TollgateError::Provider(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TollgateError::Provider(format!(
                "token exchange failed with status {status}: {body}"
            ))
            .into());
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            TollgateError::Provider(format!("token exchange response unreadable: {e}"))
        })?;
        if token.access_token.is_empty() {
            return Err(
                TollgateError::Provider("token response carried no access token".to_string())
                    .into(),
            );
        }
        tracing::debug!("authorization code exchanged");
        Ok(token.into_grant())
    }

    /// Obtains a fresh access token with a refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::RefreshFailed`] when the token endpoint
    /// rejects the grant (4xx) and [`TollgateError::Provider`] for transport
    /// failures or provider-side errors (5xx), which callers treat as
    /// transient.
    pub async fn refresh(&self, config: &OAuthConfig, refresh_token: &str) -> Result<TokenGrant> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(config.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| TollgateError::Provider(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                TollgateError::RefreshFailed(format!("status {status}: {body}")).into(),
            );
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TollgateError::Provider(format!(
                "token refresh failed with status {status}: {body}"
            ))
            .into());
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            TollgateError::Provider(format!("token refresh response unreadable: {e}"))
        })?;
        if token.access_token.is_empty() {
            return Err(
                TollgateError::Provider("refresh response carried no access token".to_string())
                    .into(),
            );
        }
        tracing::debug!("access token refreshed");
        Ok(token.into_grant())
    }

    /// Resolves the identity behind an access token via the userinfo
    /// endpoint.
    ///
    /// # Returns
    ///
    /// The verified email address, trimmed and lowercased so it is stable
    /// as a store key.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Unauthenticated`] when the token is rejected
    /// or the provider releases no verified email, and
    /// [`TollgateError::Provider`] for transport or provider-side failures.
    pub async fn fetch_identity(&self, config: &OAuthConfig, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(config.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| TollgateError::Provider(format!("userinfo request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TollgateError::Unauthenticated(
                "provider rejected the access token".to_string(),
            )
            .into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TollgateError::Provider(format!(
                "userinfo failed with status {status}: {body}"
            ))
            .into());
        }

        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| TollgateError::Provider(format!("userinfo response unreadable: {e}")))?;

        let email = match info.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => email.to_ascii_lowercase(),
            _ => {
                return Err(TollgateError::Unauthenticated(
                    "provider released no email address".to_string(),
                )
                .into());
            }
        };
        if info.email_verified == Some(false) {
            return Err(TollgateError::Unauthenticated(
                "provider reports the email address as unverified".to_string(),
            )
            .into());
        }
        Ok(email)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
