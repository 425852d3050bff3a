//! The authorization broker: identity resolution, refresh, and handles
//!
//! [`AuthBroker`] owns the session store, the state store, the handle cache,
//! and the provider flow, and is the single entry point the rest of the
//! program uses:
//!
//! - [`AuthBroker::authorize`] turns "who is calling and what do they need"
//!   into an [`AuthorizedHandle`], refreshing the stored grant when needed
//! - [`AuthBroker::begin_authorization`] and
//!   [`AuthBroker::complete_authorization`] are the two halves of the
//!   browser flow, joined by the state store
//! - [`AuthBroker::sign_out`] and [`AuthBroker::revoke`] tear down sessions
//!   and stored grants respectively
//!
//! Refreshes are serialized per identity by a keyed async mutex: the winner
//! performs the upstream dialog, losers re-read the store after the gate
//! opens and find the fresh token.  No store-wide lock is ever held across
//! I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use url::Url;

use crate::auth::config::{ConfigHandle, OAuthConfig, TransportMode};
use crate::auth::credentials::{CredentialRecord, CredentialStore};
use crate::auth::flow::ProviderFlow;
use crate::auth::handle_cache::HandleCache;
use crate::auth::pkce;
use crate::auth::scopes::{self, ScopeSet};
use crate::auth::session::SessionStore;
use crate::auth::state::{AuthorizationRequest, StateStore};
use crate::error::{Result, TollgateError};
use crate::services::ServiceClient;

// ---------------------------------------------------------------------------
// Caller context and results
// ---------------------------------------------------------------------------

/// Who is asking: the transport session and/or an explicit identity.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Opaque session identifier issued by the transport, when present.
    pub session_id: Option<String>,
    /// Identity named explicitly by the caller (single-tenant mode only).
    pub identity_hint: Option<String>,
}

impl CallerContext {
    /// A caller with neither a session nor an identity.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller identified by its transport session.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            identity_hint: None,
        }
    }

    /// A caller naming an identity directly.
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            session_id: None,
            identity_hint: Some(identity.into()),
        }
    }
}

/// A resolved, scope-checked, ready-to-use authorization.
#[derive(Debug)]
pub struct AuthorizedHandle {
    /// Identity the handle acts as.
    pub identity: String,
    /// Scopes the stored grant covers (a superset of what was required).
    pub scopes: ScopeSet,
    /// Shared upstream client bound to the identity's access token.
    pub client: Arc<ServiceClient>,
}

/// Everything the callback endpoint needs after a flow completes.
#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    /// Identity that authorized.
    pub identity: String,
    /// Session the identity was bound to, when the flow carried one.
    pub session_id: Option<String>,
    /// Where to send the browser next, when the flow carried a target.
    pub redirect_target: Option<Url>,
}

// ---------------------------------------------------------------------------
// RefreshGate
// ---------------------------------------------------------------------------

/// Keyed async mutexes serializing token refreshes per identity.
struct RefreshGate {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RefreshGate {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn for_identity(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drops the gate entry when the identity's credential is deleted, so
    /// the map tracks live credentials rather than every identity ever seen.
    /// A caller still holding a clone finishes its critical section on it;
    /// the next refresh mints a fresh gate.
    fn forget(&self, identity: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(identity);
    }
}

// ---------------------------------------------------------------------------
// AuthBroker
// ---------------------------------------------------------------------------

/// Central authority for credentials, sessions, and authorized handles.
pub struct AuthBroker {
    config: Arc<ConfigHandle>,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
    sessions: SessionStore,
    states: StateStore,
    flow: ProviderFlow,
    handles: HandleCache<ServiceClient>,
    refresh_gate: RefreshGate,
}

impl AuthBroker {
    /// Wires a broker from its collaborators.
    ///
    /// The session fast path is fixed from the transport mode at
    /// construction; changing the transport requires a restart.
    pub fn new(
        config: Arc<ConfigHandle>,
        http: reqwest::Client,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let snapshot = config.get();
        let fast_path = snapshot.transport == TransportMode::Http;
        Self {
            flow: ProviderFlow::new(http.clone()),
            sessions: SessionStore::new(fast_path),
            states: StateStore::new(),
            handles: HandleCache::new(),
            refresh_gate: RefreshGate::new(),
            config,
            http,
            credentials,
        }
    }

    /// The session store, for transports that bind and verify sessions.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The state store, exposed for observability.
    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// The configuration handle this broker reads snapshots from.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    // -- authorize ----------------------------------------------------------

    /// Resolves the caller to an identity, ensures a fresh grant covering
    /// `required`, and returns a cached or newly built upstream handle.
    ///
    /// # Errors
    ///
    /// - [`TollgateError::Unauthenticated`] when no identity or no usable
    ///   credential can be established, including a refresh the provider
    ///   rejected (the dead credential is deleted first)
    /// - [`TollgateError::Unauthorized`] when the grant lacks scopes
    /// - [`TollgateError::ApiNotEnabled`] when the upstream suite is
    ///   disabled for this project
    pub async fn authorize(
        &self,
        caller: &CallerContext,
        required: &ScopeSet,
    ) -> Result<AuthorizedHandle> {
        let config = self.config.get();
        let identity = self.resolve_identity(caller, &config)?;
        let credential = self.fresh_credential(&identity, &config).await?;

        if !credential.scopes.contains_all(required) {
            let missing = credential.scopes.missing_from(required);
            tracing::warn!(
                identity = %identity,
                missing = %missing,
                "stored grant lacks required scopes"
            );
            return Err(TollgateError::Unauthorized {
                identity,
                missing: missing.cache_key(),
            }
            .into());
        }

        let http = self.http.clone();
        let api_base = config.api_base_url.clone();
        let access_token = credential.access_token.clone();
        let handle_identity = identity.clone();
        let client = self
            .handles
            .get_or_build(&identity, required, move || async move {
                ServiceClient::connect(http, api_base, access_token, handle_identity).await
            })
            .await?;

        Ok(AuthorizedHandle {
            identity,
            scopes: credential.scopes,
            client,
        })
    }

    /// Maps the caller context to an identity according to the tenancy mode.
    ///
    /// Multi-tenant: the session store is the only source of identity.
    /// Single-tenant: an explicit hint wins, then a recently authenticated
    /// session, then the configured default identity.  A session that
    /// resolves is touched, sliding its retention window.
    fn resolve_identity(&self, caller: &CallerContext, config: &OAuthConfig) -> Result<String> {
        if config.multi_tenant {
            let session_id = caller.session_id.as_deref().ok_or_else(|| {
                TollgateError::Unauthenticated(
                    "multi-tenant mode requires a session".to_string(),
                )
            })?;
            return match self.sessions.resolve(session_id) {
                Ok(identity) => {
                    self.sessions.touch(session_id);
                    Ok(identity)
                }
                Err(err)
                    if matches!(
                        err.downcast_ref::<TollgateError>(),
                        Some(TollgateError::NoSession(_))
                    ) =>
                {
                    Err(TollgateError::Unauthenticated(
                        "session is unknown or expired; authorization required".to_string(),
                    )
                    .into())
                }
                Err(err) => Err(err),
            };
        }

        if let Some(identity) = &caller.identity_hint {
            return Ok(identity.clone());
        }
        if let Some(session_id) = caller.session_id.as_deref() {
            if self.sessions.recent_auth_ok(session_id) {
                if let Ok(identity) = self.sessions.resolve(session_id) {
                    self.sessions.touch(session_id);
                    return Ok(identity);
                }
            }
        }
        if let Some(identity) = &config.default_identity {
            return Ok(identity.clone());
        }
        Err(TollgateError::Unauthenticated(
            "no identity: name one explicitly or configure a default".to_string(),
        )
        .into())
    }

    /// Loads the identity's credential and refreshes it when expired.
    ///
    /// The per-identity gate makes the expiry check and the refresh one
    /// critical section: racing callers re-read the store after acquiring
    /// the gate and usually find a fresh token already written.
    async fn fresh_credential(
        &self,
        identity: &str,
        config: &OAuthConfig,
    ) -> Result<CredentialRecord> {
        let record = self.credentials.get(identity).await?.ok_or_else(|| {
            TollgateError::Unauthenticated(format!(
                "no stored credential for {identity}; authorization required"
            ))
        })?;
        if !record.is_expired() {
            return Ok(record);
        }

        let gate = self.refresh_gate.for_identity(identity);
        let _guard = gate.lock().await;

        // Double-check under the gate: the refresh may already be done.
        let record = self.credentials.get(identity).await?.ok_or_else(|| {
            TollgateError::Unauthenticated(format!(
                "credential for {identity} disappeared during refresh"
            ))
        })?;
        if !record.is_expired() {
            return Ok(record);
        }

        let refresh_token = record.refresh_token.clone().ok_or_else(|| {
            TollgateError::CredentialCorrupt(format!(
                "record for {identity} lost its refresh token"
            ))
        })?;

        match self.flow.refresh(config, &refresh_token).await {
            Ok(grant) => {
                let updated = CredentialRecord {
                    identity: record.identity.clone(),
                    access_token: grant.access_token,
                    // Providers usually omit the refresh token on refresh;
                    // carry the old one forward.
                    refresh_token: grant.refresh_token.or(record.refresh_token),
                    expires_at: grant.expires_at,
                    scopes: grant.scopes.unwrap_or_else(|| record.scopes.clone()),
                    created_at: record.created_at,
                    client_secret: None,
                };
                self.credentials.put(&updated).await?;
                tracing::info!(identity, "access token refreshed");
                Ok(updated)
            }
            Err(err) => {
                if matches!(
                    err.downcast_ref::<TollgateError>(),
                    Some(TollgateError::RefreshFailed(_))
                ) {
                    tracing::warn!(
                        identity,
                        error = %err,
                        "refresh rejected upstream; deleting credential"
                    );
                    self.credentials.delete(identity).await?;
                    self.handles.invalidate_identity(identity);
                    self.refresh_gate.forget(identity);
                    return Err(TollgateError::Unauthenticated(format!(
                        "token refresh rejected for {identity}; authorization required"
                    ))
                    .into());
                }
                // Transient failures keep the credential for a later retry.
                Err(err)
            }
        }
    }

    // -- browser flow -------------------------------------------------------

    /// Starts an authorization flow and returns the URL to open.
    ///
    /// The requested scopes are merged with the base identity scopes, a
    /// PKCE pair is generated, and the pending authorization is parked in
    /// the state store under a fresh anti-CSRF token.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConfigInvalid`] when `redirect_target` is
    /// neither same-origin with the external URL nor a registered URI.
    pub fn begin_authorization(
        &self,
        caller: &CallerContext,
        requested: &ScopeSet,
        redirect_target: Option<Url>,
    ) -> Result<Url> {
        let config = self.config.get();
        if let Some(target) = &redirect_target {
            if !config.is_trusted_redirect_target(target) {
                return Err(TollgateError::ConfigInvalid(format!(
                    "redirect target {target} is neither same-origin with the external URL nor registered"
                ))
                .into());
            }
        }

        let challenge = pkce::generate()?;
        let requested = scopes::base().union(requested);
        let state = self.states.issue(AuthorizationRequest {
            redirect_target,
            session_id: caller.session_id.clone(),
            scopes: requested.clone(),
            pkce_verifier: challenge.verifier.clone(),
        });
        let url = self
            .flow
            .build_authorization_url(&config, &requested, &state, &challenge)?;
        tracing::info!(
            outstanding = self.states.len(),
            "authorization flow started"
        );
        Ok(url)
    }

    /// Finishes an authorization flow from the callback's `code` and
    /// `state` parameters.
    ///
    /// Consumes the state token, exchanges the code, resolves the identity
    /// behind the new token, stores the merged credential record, and binds
    /// the originating session when there was one.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidState`] for unknown, expired, or
    /// replayed state tokens; provider dialog failures map as described in
    /// [`crate::auth::flow`].
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CompletedAuthorization> {
        let pending = self.states.consume(state)?;
        let config = self.config.get();

        let grant = self
            .flow
            .exchange_code(&config, code, &pending.pkce_verifier)
            .await?;
        let identity = self.flow.fetch_identity(&config, &grant.access_token).await?;

        let previous = self.credentials.get(&identity).await?;
        let refresh_token = grant
            .refresh_token
            .or_else(|| previous.as_ref().and_then(|r| r.refresh_token.clone()));
        let mut granted_scopes = grant.scopes.unwrap_or(pending.scopes);
        if let Some(previous) = &previous {
            // Incremental authorization: earlier grants stay usable.
            granted_scopes = granted_scopes.union(&previous.scopes);
        }
        let record = CredentialRecord {
            identity: identity.clone(),
            access_token: grant.access_token,
            refresh_token,
            expires_at: grant.expires_at,
            scopes: granted_scopes,
            created_at: previous.map(|r| r.created_at).unwrap_or_else(Utc::now),
            client_secret: None,
        };
        self.credentials.put(&record).await?;
        // Handles built from the previous grant would outlive it otherwise.
        self.handles.invalidate_identity(&identity);

        if let Some(session_id) = &pending.session_id {
            self.sessions.bind(session_id, &identity);
        }
        tracing::info!(identity = %identity, "authorization completed");
        Ok(CompletedAuthorization {
            identity,
            session_id: pending.session_id,
            redirect_target: pending.redirect_target,
        })
    }

    // -- teardown -----------------------------------------------------------

    /// Destroys the caller's session and its recent-authentication binding.
    ///
    /// Stored credentials are untouched; use [`AuthBroker::revoke`] for
    /// those.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::NoSession`] when the caller has no session
    /// or it is already gone.
    pub fn sign_out(&self, caller: &CallerContext) -> Result<()> {
        let session_id = caller.session_id.as_deref().ok_or_else(|| {
            TollgateError::NoSession("sign-out requires a session".to_string())
        })?;
        match self.sessions.remove(session_id) {
            Some(record) => {
                tracing::info!(identity = %record.identity, "session signed out");
                Ok(())
            }
            None => Err(TollgateError::NoSession(session_id.to_string()).into()),
        }
    }

    /// Deletes an identity's stored credential, drops its cached handles,
    /// and forgets its refresh gate.
    pub async fn revoke(&self, identity: &str) -> Result<()> {
        self.credentials.delete(identity).await?;
        let dropped = self.handles.invalidate_identity(identity);
        self.refresh_gate.forget(identity);
        tracing::info!(identity, dropped_handles = dropped, "credential revoked");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
