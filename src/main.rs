//! Tollgate - OAuth credential broker
//!
//! Main entry point for the Tollgate callback server and credential
//! management commands.

use anyhow::Result;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollgate::auth::{open_store, AuthBroker, CallerContext, ConfigHandle, ScopeSet};
use tollgate::cli::{Cli, Commands};
use tollgate::config::Config;
use tollgate::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/tollgate.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // OAuth settings come from the environment; the broker shares one
    // snapshot handle and one HTTP client across all commands.
    let oauth = Arc::new(ConfigHandle::from_env()?);
    let snapshot = oauth.get();
    let store = open_store(&snapshot).await?;
    let broker = Arc::new(AuthBroker::new(oauth, reqwest::Client::new(), store));

    // Execute command
    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!("Starting callback server");
            server::serve(config.listen_addr()?, broker).await?;
            Ok(())
        }
        Commands::Authorize { scopes } => {
            tracing::info!("Starting authorization");
            let requested = ScopeSet::new(scopes);
            let url = broker.begin_authorization(&CallerContext::anonymous(), &requested, None)?;

            println!("Open this URL in a browser to authorize:\n\n  {url}\n");
            println!("Waiting for the callback; stop with Ctrl-C once the grant lands.");

            server::serve(config.listen_addr()?, broker).await?;
            Ok(())
        }
        Commands::Revoke { identity } => {
            tracing::info!("Revoking credential for {}", identity);
            broker.revoke(&identity).await?;
            println!("Removed stored credential for {identity}");
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
