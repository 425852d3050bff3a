//! HTTP surface: the OAuth callback endpoint and a health probe
//!
//! The server deliberately exposes only two routes.  `GET /oauth2/callback`
//! finishes browser authorization flows through
//! [`AuthBroker::complete_authorization`]; `GET /healthz` answers liveness
//! probes.  Everything else the broker does is reached through the library
//! API, not HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::auth::broker::AuthBroker;
use crate::auth::config::CALLBACK_PATH;
use crate::error::{Result, TollgateError};

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authorization complete</title></head>\
<body><h1>Authorization complete</h1>\
<p>You are signed in. You can close this window and return to your client.</p>\
</body></html>";

#[derive(Clone)]
struct AppState {
    broker: Arc<AuthBroker>,
}

/// Query parameters the provider sends to the callback.
///
/// Everything is optional on the wire; the handler validates presence so a
/// malformed redirect gets a 400 instead of a rejected extraction.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Builds the application router.
pub fn build_router(broker: Arc<AuthBroker>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(oauth_callback))
        .route("/healthz", get(healthz))
        .with_state(AppState { broker })
}

/// Binds `addr` and serves the router until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error when the address cannot be bound or the server fails.
pub async fn serve(addr: SocketAddr, broker: Arc<AuthBroker>) -> Result<()> {
    let app = build_router(broker);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

/// GET /oauth2/callback handler.
///
/// Consumes the anti-CSRF state, exchanges the code, and either redirects
/// the browser to the flow's original target or renders a success page.
/// Invalid or replayed state gets a 400 and takes no credential action.
async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = &params.error {
        tracing::warn!(error, "provider reported an authorization error");
        return (
            StatusCode::BAD_REQUEST,
            Html("<h1>Authorization failed</h1><p>The provider reported an error. Start the flow again.</p>"),
        )
            .into_response();
    }

    let (Some(code), Some(state_value)) = (&params.code, &params.state) else {
        tracing::warn!("callback missing code or state parameter");
        return (
            StatusCode::BAD_REQUEST,
            Html("<h1>Bad request</h1><p>Missing code or state parameter.</p>"),
        )
            .into_response();
    };

    match state.broker.complete_authorization(code, state_value).await {
        Ok(completed) => match completed.redirect_target {
            Some(target) => Redirect::to(target.as_str()).into_response(),
            None => (StatusCode::OK, Html(SUCCESS_PAGE)).into_response(),
        },
        Err(err) => {
            match err.downcast_ref::<TollgateError>() {
                Some(TollgateError::InvalidState(_)) => {
                    tracing::warn!(error = %err, "callback rejected");
                    (
                        StatusCode::BAD_REQUEST,
                        Html("<h1>Invalid state</h1><p>The authorization state is invalid or expired. Start the flow again.</p>"),
                    )
                        .into_response()
                }
                Some(TollgateError::Unauthenticated(_)) => {
                    tracing::warn!(error = %err, "callback identity rejected");
                    (
                        StatusCode::BAD_REQUEST,
                        Html("<h1>Account not usable</h1><p>The provider account could not be verified.</p>"),
                    )
                        .into_response()
                }
                _ => {
                    tracing::error!(error = %err, "authorization completion failed");
                    (
                        StatusCode::BAD_GATEWAY,
                        Html("<h1>Authorization failed</h1><p>Could not complete the authorization. Try again.</p>"),
                    )
                        .into_response()
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::config::{
        ConfigHandle, OAuthConfig, StorageBackend, TransportMode,
    };
    use crate::auth::credentials::MemoryCredentialStore;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use url::Url;

    fn test_config() -> OAuthConfig {
        let external_url = Url::parse("https://broker.example.com").unwrap();
        OAuthConfig {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
            auth_url: Url::parse("https://provider.example.com/o/authorize").unwrap(),
            token_url: Url::parse("https://provider.example.com/o/token").unwrap(),
            userinfo_url: Url::parse("https://provider.example.com/o/userinfo").unwrap(),
            api_base_url: Url::parse("https://api.example.com").unwrap(),
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

    fn test_broker() -> Arc<AuthBroker> {
        Arc::new(AuthBroker::new(
            Arc::new(ConfigHandle::new(test_config())),
            reqwest::Client::new(),
            Arc::new(MemoryCredentialStore::new()),
        ))
    }

    async fn spawn_test_server(broker: Arc<AuthBroker>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(broker);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_healthz_answers_ok() {
        let addr = spawn_test_server(test_broker()).await;

        let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_callback_without_parameters_is_bad_request() {
        let addr = spawn_test_server(test_broker()).await;

        let response = reqwest::get(format!("http://{addr}{CALLBACK_PATH}"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_callback_with_provider_error_is_bad_request() {
        let broker = test_broker();
        let addr = spawn_test_server(broker.clone()).await;

        let response = reqwest::get(format!(
            "http://{addr}{CALLBACK_PATH}?error=access_denied&state=whatever"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        // No credential action was taken.
        assert_eq!(broker.states().len(), 0);
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state_is_bad_request() {
        let addr = spawn_test_server(test_broker()).await;

        let response = reqwest::get(format!(
            "http://{addr}{CALLBACK_PATH}?code=abc&state=never-issued"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body = response.text().await.unwrap();
        assert!(body.contains("Invalid state"));
    }
}
