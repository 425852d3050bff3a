//! Server configuration management for Tollgate
//!
//! This module handles the YAML configuration file for the callback server
//! (listen host and port), layered with environment variables and CLI
//! overrides. OAuth provider settings live in [`crate::auth::config`] and are
//! sourced from the environment so secrets stay out of files on disk.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::error::{Result, TollgateError};

// ---------------------------------------------------------------------------
// Configuration structures
// ---------------------------------------------------------------------------

/// Top-level configuration for the Tollgate binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Callback server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Listen settings for the OAuth callback server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, as an IP literal
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to bind
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a file, applying environment variable and CLI
    /// overrides
    ///
    /// Precedence, lowest to highest: file values, `TOLLGATE_SERVER_*`
    /// environment variables, CLI flags.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    /// * `cli` - Parsed command-line arguments
    ///
    /// # Returns
    ///
    /// Returns the merged configuration, or an error if the file exists but
    /// cannot be parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    /// Load configuration from a YAML file
    fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_vars(&mut self) {
        if let Ok(host) = std::env::var("TOLLGATE_SERVER_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("TOLLGATE_SERVER_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Invalid TOLLGATE_SERVER_PORT value: {}", port),
            }
        }
    }

    /// Apply command-line overrides
    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let crate::cli::Commands::Serve { host, port } = &cli.command {
            if let Some(host) = host {
                self.server.host = host.clone();
            }
            if let Some(port) = port {
                self.server.port = *port;
            }
        }

        if cli.verbose {
            tracing::debug!("Verbose logging enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Returns
    ///
    /// Returns an error naming the offending field if validation fails
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(
                TollgateError::ConfigInvalid("server.host cannot be empty".to_string()).into(),
            );
        }

        if self.server.host.parse::<IpAddr>().is_err() {
            return Err(TollgateError::ConfigInvalid(format!(
                "server.host must be an IP literal, got '{}'",
                self.server.host
            ))
            .into());
        }

        if self.server.port == 0 {
            return Err(TollgateError::ConfigInvalid("server.port cannot be 0".to_string()).into());
        }

        Ok(())
    }

    /// Socket address the callback server binds
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the host is not an IP literal
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.server.host.parse().map_err(|_| {
            TollgateError::ConfigInvalid(format!(
                "server.host must be an IP literal, got '{}'",
                self.server.host
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use serial_test::serial;

    fn serve_cli(host: Option<&str>, port: Option<u16>) -> Cli {
        Cli {
            config: None,
            verbose: false,
            command: Commands::Serve {
                host: host.map(String::from),
                port,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Defaults and parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
server:
  host: "0.0.0.0"
  port: 9090
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_config_partial_yaml_uses_defaults() {
        let yaml = r#"
server:
  port: 3000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_config_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.host, config.server.host);
        assert_eq!(parsed.server.port, config.server.port);
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = Config::default();
        config.server.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hostname() {
        let mut config = Config::default();
        config.server.host = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("IP literal"));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_ipv6() {
        let mut config = Config::default();
        config.server.host = "::1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::default();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    // -----------------------------------------------------------------------
    // Override precedence
    // -----------------------------------------------------------------------

    #[test]
    fn test_cli_overrides_apply() {
        let mut config = Config::default();
        config.apply_cli_overrides(&serve_cli(Some("0.0.0.0"), Some(4000)));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_cli_overrides_skip_none() {
        let mut config = Config::default();
        config.apply_cli_overrides(&serve_cli(None, None));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        std::env::set_var("TOLLGATE_SERVER_HOST", "10.0.0.1");
        std::env::set_var("TOLLGATE_SERVER_PORT", "7171");

        let mut config = Config::default();
        config.apply_env_vars();

        std::env::remove_var("TOLLGATE_SERVER_HOST");
        std::env::remove_var("TOLLGATE_SERVER_PORT");

        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 7171);
    }

    #[test]
    #[serial]
    fn test_env_invalid_port_ignored() {
        std::env::set_var("TOLLGATE_SERVER_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_vars();

        std::env::remove_var("TOLLGATE_SERVER_PORT");

        assert_eq!(config.server.port, 8080);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let cli = serve_cli(None, None);
        let config = Config::load("/nonexistent/tollgate.yaml", &cli).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    #[serial]
    fn test_load_merges_file_and_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.yaml");
        std::fs::write(&path, "server:\n  host: \"0.0.0.0\"\n  port: 9090\n").unwrap();

        let cli = serve_cli(None, Some(9191));
        let config = Config::load(path.to_str().unwrap(), &cli).unwrap();

        // File sets the host, CLI wins on the port.
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9191);
    }
}
