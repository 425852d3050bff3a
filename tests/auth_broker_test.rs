//! Broker lifecycle integration tests using wiremock
//!
//! Exercises `src/auth/broker.rs` against a mock provider and a mock
//! upstream API on one server:
//!
//! - The full begin / callback / authorize lifecycle, including credential
//!   storage and handle caching.
//! - State tokens are single-use.
//! - Expired credentials are refreshed in place; racing callers share one
//!   refresh behind the per-identity gate; a rejected refresh deletes the
//!   credential.
//! - Incremental authorization unions newly granted scopes with earlier
//!   ones and preserves the record's creation time.
//! - Session binding through the callback in multi-tenant mode.
//! - Scope checks fail closed with `Unauthorized`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::auth::scopes;
use tollgate::auth::{
    AuthBroker, CallerContext, ConfigHandle, CredentialRecord, CredentialStore,
    MemoryCredentialStore, OAuthConfig, ScopeSet, StorageBackend, TransportMode, CALLBACK_PATH,
};
use tollgate::error::TollgateError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const IDENTITY: &str = "user@example.com";

/// Builds an [`OAuthConfig`] whose provider endpoints and API base all point
/// at the given wiremock server URL.
fn broker_config(base_url: &str) -> OAuthConfig {
    let external_url = Url::parse("http://127.0.0.1:8080").unwrap();
    OAuthConfig {
        client_id: "client-123".to_string(),
        client_secret: "secret-456".to_string(),
        auth_url: Url::parse(&format!("{base_url}/o/authorize")).unwrap(),
        token_url: Url::parse(&format!("{base_url}/token")).unwrap(),
        userinfo_url: Url::parse(&format!("{base_url}/userinfo")).unwrap(),
        api_base_url: Url::parse(base_url).unwrap(),
        redirect_uris: vec![external_url.join(CALLBACK_PATH).unwrap()],
        external_url,
        transport: TransportMode::Http,
        multi_tenant: false,
        stateless: false,
        storage_backend: StorageBackend::Memory,
        redis_url: None,
        credentials_dir: PathBuf::from(".credentials"),
        default_identity: None,
    }
}

fn broker_with(config: OAuthConfig, store: Arc<MemoryCredentialStore>) -> AuthBroker {
    AuthBroker::new(
        Arc::new(ConfigHandle::new(config)),
        reqwest::Client::new(),
        store,
    )
}

/// Extracts the `state` query parameter from an authorization URL.
fn state_param(url: &Url) -> String {
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .expect("authorization URL carries a state parameter")
}

/// Mounts a token endpoint answering the authorization-code exchange.
async fn mount_code_exchange(server: &MockServer, access_token: &str, scope: &str) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1",
            "scope": scope
        })))
        .mount(server)
        .await;
}

/// Mounts a userinfo endpoint resolving to a verified email.
async fn mount_userinfo(server: &MockServer, email: &str) {
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "email": email,
            "email_verified": true
        })))
        .mount(server)
        .await;
}

/// Mounts the upstream `about` probe the handle builder hits.
async fn mount_about(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/about"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user": { "emailAddress": IDENTITY }
        })))
        .mount(server)
        .await;
}

/// A credential record whose access token expired an hour ago.
fn expired_record(scopes: ScopeSet) -> CredentialRecord {
    CredentialRecord {
        identity: IDENTITY.to_string(),
        access_token: "access-stale".to_string(),
        refresh_token: Some("refresh-old".to_string()),
        expires_at: Some(Utc::now() - Duration::hours(1)),
        scopes,
        created_at: Utc::now() - Duration::days(30),
        client_secret: None,
    }
}

// ---------------------------------------------------------------------------
// Full lifecycle
// ---------------------------------------------------------------------------

/// Begin parks state, the callback stores a credential under the verified
/// email, and a later authorize call hands out a working handle.
#[tokio::test]
async fn test_full_flow_stores_credential_and_authorizes() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email files.read").await;
    mount_userinfo(&server, IDENTITY).await;
    mount_about(&server).await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store.clone());

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &scopes::files_read(), None)
        .unwrap();
    assert!(url.as_str().starts_with(&format!("{}/o/authorize?", server.uri())));
    let state = state_param(&url);

    let completed = broker
        .complete_authorization("auth-code-789", &state)
        .await
        .expect("callback must complete");
    assert_eq!(completed.identity, IDENTITY);
    assert_eq!(completed.session_id, None);

    let record = store
        .get(IDENTITY)
        .await
        .unwrap()
        .expect("credential must be stored");
    assert_eq!(record.access_token, "access-1");
    assert_eq!(record.refresh_token.as_deref(), Some("refresh-1"));
    assert!(record.scopes.contains_all(&scopes::files_read()));
    assert!(record.scopes.contains_all(&scopes::base()));

    let handle = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .expect("authorize must succeed with a fresh credential");
    assert_eq!(handle.identity, IDENTITY);
    assert_eq!(handle.client.identity(), IDENTITY);
}

/// Repeated authorize calls for the same identity and scopes must reuse the
/// cached handle instead of probing the upstream again.
#[tokio::test]
async fn test_authorize_reuses_cached_handle() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email files.read").await;
    mount_userinfo(&server, IDENTITY).await;

    // Exactly one upstream probe across both authorize calls.
    Mock::given(method("GET"))
        .and(path("/v1/about"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store);

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &scopes::files_read(), None)
        .unwrap();
    broker
        .complete_authorization("auth-code", &state_param(&url))
        .await
        .unwrap();

    let caller = CallerContext::for_identity(IDENTITY);
    broker.authorize(&caller, &scopes::files_read()).await.unwrap();
    broker.authorize(&caller, &scopes::files_read()).await.unwrap();

    server.verify().await;
}

/// A consumed state token must not complete a second flow, and the replay
/// must never reach the token endpoint.
#[tokio::test]
async fn test_state_token_is_single_use() {
    let server = MockServer::start().await;
    mount_userinfo(&server, IDENTITY).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-1",
            "token_type": "Bearer",
            "refresh_token": "refresh-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store);

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &ScopeSet::empty(), None)
        .unwrap();
    let state = state_param(&url);

    broker.complete_authorization("auth-code", &state).await.unwrap();
    let err = broker
        .complete_authorization("auth-code", &state)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::InvalidState(_))
        ),
        "expected InvalidState, got: {err}"
    );
    server.verify().await;
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

/// An expired credential must be refreshed in place before a handle is
/// built, carrying the old refresh token forward when the provider omits a
/// new one.
#[tokio::test]
async fn test_expired_credential_is_refreshed() {
    let server = MockServer::start().await;
    mount_about(&server).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    store
        .put(&expired_record(scopes::base().union(&scopes::files_read())))
        .await
        .unwrap();

    let broker = broker_with(broker_config(&server.uri()), store.clone());
    let handle = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .expect("authorize must refresh and succeed");
    assert_eq!(handle.identity, IDENTITY);

    let record = store.get(IDENTITY).await.unwrap().unwrap();
    assert_eq!(record.access_token, "access-2");
    // The refresh response had no refresh_token; the old one survives.
    assert_eq!(record.refresh_token.as_deref(), Some("refresh-old"));

    server.verify().await;
}

/// Racing authorize calls over one expired credential must share a single
/// refresh: the gate winner performs the dialog, the others re-read the
/// store after the gate opens and find the fresh token.
#[tokio::test]
async fn test_concurrent_authorizes_share_one_refresh() {
    let server = MockServer::start().await;
    mount_about(&server).await;

    // Exactly one refresh dialog across all racing callers.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let all = scopes::base()
        .union(&scopes::files_read())
        .union(&scopes::files_write())
        .union(&scopes::events_read());
    let store = Arc::new(MemoryCredentialStore::new());
    store.put(&expired_record(all)).await.unwrap();

    let broker = broker_with(broker_config(&server.uri()), store.clone());
    let caller = CallerContext::for_identity(IDENTITY);

    // Distinct scope sets give each call its own handle-cache key, so all
    // three walk the refresh path themselves instead of sharing a builder.
    let files_read = scopes::files_read();
    let files_write = scopes::files_write();
    let events_read = scopes::events_read();
    let (a, b, c) = tokio::join!(
        broker.authorize(&caller, &files_read),
        broker.authorize(&caller, &files_write),
        broker.authorize(&caller, &events_read),
    );
    assert_eq!(a.unwrap().identity, IDENTITY);
    assert_eq!(b.unwrap().identity, IDENTITY);
    assert_eq!(c.unwrap().identity, IDENTITY);

    let record = store.get(IDENTITY).await.unwrap().unwrap();
    assert_eq!(record.access_token, "access-2");

    server.verify().await;
}

/// When the provider rejects the refresh grant, the credential is dead:
/// authorize must fail and the stored record must be gone.
#[tokio::test]
async fn test_rejected_refresh_deletes_credential() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    store
        .put(&expired_record(scopes::base().union(&scopes::files_read())))
        .await
        .unwrap();

    let broker = broker_with(broker_config(&server.uri()), store.clone());
    let err = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthenticated(_))
        ),
        "expected Unauthenticated, got: {err}"
    );
    assert!(
        err.to_string().contains("refresh rejected"),
        "error should name the rejected refresh: {err}"
    );
    assert!(
        store.get(IDENTITY).await.unwrap().is_none(),
        "a rejected grant must delete the stored credential"
    );
}

/// A transient provider failure during refresh must keep the credential so
/// a later attempt can succeed.
#[tokio::test]
async fn test_transient_refresh_failure_keeps_credential() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    store
        .put(&expired_record(scopes::base().union(&scopes::files_read())))
        .await
        .unwrap();

    let broker = broker_with(broker_config(&server.uri()), store.clone());
    let err = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Provider(_))
        ),
        "expected Provider, got: {err}"
    );
    assert!(
        store.get(IDENTITY).await.unwrap().is_some(),
        "a transient failure must keep the credential for retry"
    );
}

// ---------------------------------------------------------------------------
// Incremental authorization
// ---------------------------------------------------------------------------

/// A second authorization for additional scopes must union the new grant
/// with the earlier one and keep the record's original creation time.
#[tokio::test]
async fn test_incremental_authorization_unions_scopes() {
    let server = MockServer::start().await;
    mount_userinfo(&server, IDENTITY).await;

    // First exchange grants only the sign-in scopes.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-1",
            "token_type": "Bearer",
            "refresh_token": "refresh-1",
            "scope": "openid email"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    // Second exchange adds the file scope.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "token_type": "Bearer",
            "refresh_token": "refresh-2",
            "scope": "openid email files.read"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store.clone());

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &ScopeSet::empty(), None)
        .unwrap();
    broker
        .complete_authorization("code-1", &state_param(&url))
        .await
        .unwrap();
    let first = store.get(IDENTITY).await.unwrap().unwrap();

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &scopes::files_read(), None)
        .unwrap();
    broker
        .complete_authorization("code-2", &state_param(&url))
        .await
        .unwrap();
    let second = store.get(IDENTITY).await.unwrap().unwrap();

    assert_eq!(second.access_token, "access-2");
    assert!(second.scopes.contains_all(&scopes::base()));
    assert!(second.scopes.contains_all(&scopes::files_read()));
    assert_eq!(
        second.created_at, first.created_at,
        "re-authorization must preserve the original creation time"
    );
}

/// A completion that fails identity resolution must store nothing.
#[tokio::test]
async fn test_unverified_email_stores_no_credential() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email").await;

    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "email": IDENTITY,
            "email_verified": false
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store.clone());

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &ScopeSet::empty(), None)
        .unwrap();
    let err = broker
        .complete_authorization("auth-code", &state_param(&url))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthenticated(_))
        ),
        "expected Unauthenticated, got: {err}"
    );
    assert!(store.get(IDENTITY).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Sessions and scope checks
// ---------------------------------------------------------------------------

/// In multi-tenant mode the callback must bind the originating session so
/// later calls resolve the identity from it, while unknown sessions stay
/// unauthenticated.
#[tokio::test]
async fn test_callback_binds_session_in_multi_tenant_mode() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email files.read").await;
    mount_userinfo(&server, IDENTITY).await;
    mount_about(&server).await;

    let mut config = broker_config(&server.uri());
    config.multi_tenant = true;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(config, store);

    let url = broker
        .begin_authorization(
            &CallerContext::for_session("sess-1"),
            &scopes::files_read(),
            None,
        )
        .unwrap();
    let completed = broker
        .complete_authorization("auth-code", &state_param(&url))
        .await
        .unwrap();
    assert_eq!(completed.session_id.as_deref(), Some("sess-1"));

    let handle = broker
        .authorize(&CallerContext::for_session("sess-1"), &scopes::files_read())
        .await
        .expect("bound session must authorize");
    assert_eq!(handle.identity, IDENTITY);

    let err = broker
        .authorize(&CallerContext::for_session("sess-404"), &scopes::files_read())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthenticated(_))
        ),
        "expected Unauthenticated, got: {err}"
    );
}

/// A grant narrower than what the operation requires must fail closed with
/// the missing scopes named.
#[tokio::test]
async fn test_insufficient_scopes_is_unauthorized() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email").await;
    mount_userinfo(&server, IDENTITY).await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store);

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &ScopeSet::empty(), None)
        .unwrap();
    broker
        .complete_authorization("auth-code", &state_param(&url))
        .await
        .unwrap();

    let err = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_write())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthorized { .. })
        ),
        "expected Unauthorized, got: {err}"
    );
    let msg = err.to_string();
    assert!(msg.contains("Insufficient scopes"));
    assert!(msg.contains("files.write"));
}

/// Revoking an identity removes the stored credential, so the next
/// authorize call demands a new authorization.
#[tokio::test]
async fn test_revoke_forces_reauthorization() {
    let server = MockServer::start().await;
    mount_code_exchange(&server, "access-1", "openid email files.read").await;
    mount_userinfo(&server, IDENTITY).await;
    mount_about(&server).await;

    let store = Arc::new(MemoryCredentialStore::new());
    let broker = broker_with(broker_config(&server.uri()), store.clone());

    let url = broker
        .begin_authorization(&CallerContext::anonymous(), &scopes::files_read(), None)
        .unwrap();
    broker
        .complete_authorization("auth-code", &state_param(&url))
        .await
        .unwrap();
    broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .unwrap();

    broker.revoke(IDENTITY).await.unwrap();
    assert!(store.get(IDENTITY).await.unwrap().is_none());

    let err = broker
        .authorize(&CallerContext::for_identity(IDENTITY), &scopes::files_read())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<TollgateError>(),
            Some(TollgateError::Unauthenticated(_))
        ),
        "expected Unauthenticated after revoke, got: {err}"
    );
}
