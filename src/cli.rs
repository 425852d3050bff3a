//! Command-line interface definition for Tollgate
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for serving the callback endpoint, starting an
//! authorization, and revoking stored credentials.

use clap::{Parser, Subcommand};

/// Tollgate - OAuth credential broker
///
/// Broker OAuth authorizations for upstream service APIs, keeping
/// refreshed credentials and authorized API handles ready for callers.
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tollgate.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Tollgate
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the OAuth callback server
    Serve {
        /// Override the listen host from config
        #[arg(long)]
        host: Option<String>,

        /// Override the listen port from config
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print an authorization URL and serve until the grant lands
    Authorize {
        /// Scopes to request beyond the sign-in baseline
        ///
        /// Repeat the flag for each scope, e.g.
        /// `-s files.read -s events.read`.
        #[arg(short, long)]
        scopes: Vec<String>,
    },

    /// Remove a stored credential and evict its cached handles
    Revoke {
        /// Identity whose credential should be removed
        #[arg(short, long)]
        identity: String,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/tollgate.yaml".to_string()),
            verbose: false,
            command: Commands::Serve {
                host: None,
                port: None,
            },
        }
    }
}
