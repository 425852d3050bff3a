//! Tool Session Example
//!
//! This example demonstrates how a host application embeds the broker to:
//! 1. Load provider settings from the environment
//! 2. Open the configured credential store
//! 3. Serve the OAuth callback endpoint in the background
//! 4. Dispatch a session-scoped tool call, walking the end user through
//!    browser authorization on first use
//! 5. Inspect the session binding the callback established
//!
//! # Running
//!
//! Set the required environment variables:
//! ```bash
//! export TOLLGATE_OAUTH_CLIENT_ID="your-client-id"
//! export TOLLGATE_OAUTH_CLIENT_SECRET="your-client-secret"
//! export TOLLGATE_DEFAULT_IDENTITY="you@example.com"
//! ```
//!
//! Then run with:
//! ```bash
//! cargo run --example tool_session
//! ```

use std::sync::Arc;
use std::time::Duration;

use tollgate::auth::{open_store, SessionStore};
use tollgate::{AuthBroker, CallerContext, Config, ConfigHandle, ToolRegistry};

/// Tool this session dispatches.
const TOOL_NAME: &str = "list_files";

/// Seconds between dispatch attempts while waiting for authorization.
const POLL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tollgate=debug".parse().unwrap()),
        )
        .init();

    println!("Starting tool session...");

    // Load provider settings from environment
    let oauth = match ConfigHandle::from_env() {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            eprintln!("Failed to load OAuth settings: {}", e);
            eprintln!("Please set the required environment variables:");
            eprintln!("  TOLLGATE_OAUTH_CLIENT_ID");
            eprintln!("  TOLLGATE_OAUTH_CLIENT_SECRET");
            eprintln!("  TOLLGATE_DEFAULT_IDENTITY (the account you will sign in with)");
            return Err(e.into());
        }
    };

    let snapshot = oauth.get();
    println!("Broker configuration:");
    println!("  Provider: {}", snapshot.auth_url);
    println!("  External URL: {}", snapshot.external_url);
    println!("  Multi-tenant: {}", snapshot.multi_tenant);
    println!("  Storage backend: {:?}", snapshot.storage_backend);

    // Open the configured credential store
    let store = open_store(&snapshot).await?;

    // Create the broker and the built-in tool registry
    let broker = Arc::new(AuthBroker::new(oauth, reqwest::Client::new(), store));
    let registry = ToolRegistry::with_builtin_tools();

    // Serve the OAuth callback in the background
    let listen = Config::default().listen_addr()?;
    let server_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(err) = tollgate::server::serve(listen, server_broker).await {
            eprintln!("Callback server failed: {}", err);
        }
    });
    println!("Callback server listening on {}", listen);

    // Transport session for this run; the callback binds it to whichever
    // identity completes the browser flow.
    let session_id = SessionStore::new_session_id();
    let caller = CallerContext::for_session(session_id.as_str());
    println!("Session id: {}", session_id);

    let args = serde_json::json!({ "page_size": 10 });

    println!("Dispatching {} every {}s until it succeeds.", TOOL_NAME, POLL_SECS);
    println!("Press Ctrl+C to stop.");

    let mut announced = false;
    loop {
        let result = registry
            .dispatch(&broker, &caller, TOOL_NAME, args.clone())
            .await?;

        if result.success {
            let identity = result
                .metadata
                .get("identity")
                .map(String::as_str)
                .unwrap_or("<unknown>");
            println!("Files visible to {}:", identity);
            println!("{}", result.output);
            if let Ok(bound) = broker.sessions().resolve(&session_id) {
                println!("Session {} is bound to {}", session_id, bound);
            }
            break;
        }

        match &result.authorization_url {
            Some(url) if !announced => {
                println!("Authorization required. Open this URL in a browser:");
                println!("  {}", url);
                announced = true;
            }
            Some(_) => {}
            None => println!("{}", result.to_message()),
        }

        tokio::time::sleep(Duration::from_secs(POLL_SECS)).await;
    }

    println!("Session complete.");
    Ok(())
}
