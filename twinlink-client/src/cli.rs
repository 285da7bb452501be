//! Command-line argument parsing for the twinlink demo client

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use twinlink_client::{AuthConfig, ClientConfig};
use twinlink_utils::{Result, TwinError};

/// twinlink - talk to a digital twin registry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (defaults to ~/.config/twinlink/config.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Registry endpoint (tcp://host:port or unix:///path)
    ///
    /// When given, the client is configured from flags instead of the
    /// config file.
    #[arg(long, env = "TWINLINK_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Client id presented in the handshake (random if omitted)
    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long, env = "TWINLINK_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "TWINLINK_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Seconds to wait for outstanding operations on exit
    #[arg(long)]
    pub grace: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Print lifecycle and attribute events until interrupted
    Watch {
        /// Only events of this Thing
        #[arg(long)]
        thing: Option<String>,
        /// Only attribute changes at or below this path
        #[arg(long)]
        path: Option<String>,
    },
    /// Create a Thing (the registry assigns an id if none is given)
    Create { thing_id: Option<String> },
    /// Retrieve a Thing
    Get { thing_id: String },
    /// Delete a Thing
    Delete { thing_id: String },
    /// Set one attribute of a Thing
    SetAttr {
        thing_id: String,
        path: String,
        /// JSON value; plain text is sent as a string
        value: String,
    },
    /// Register handlers, create and change a Thing, then delete it
    Demo {
        #[arg(default_value = "myThing")]
        thing_id: String,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build the client configuration from flags or the config file
    pub fn client_config(&self) -> Result<ClientConfig> {
        let Some(endpoint) = &self.endpoint else {
            return match &self.config {
                Some(path) => ClientConfig::load(path),
                None => ClientConfig::load_default(),
            };
        };

        let username = self
            .username
            .clone()
            .ok_or_else(|| TwinError::config("--username is required with --endpoint"))?;
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("twinlink-{}", uuid::Uuid::new_v4()));

        Ok(ClientConfig::new(
            endpoint.clone(),
            client_id,
            AuthConfig::Credentials {
                username,
                password: self.password.clone().unwrap_or_default(),
            },
        ))
    }
}

/// Extra line printed after an error the user can simply retry
pub fn error_hint(err: &TwinError) -> Option<&'static str> {
    if !err.is_retryable() {
        return None;
    }
    Some("The registry did not answer in time or the connection dropped; retrying may succeed")
}

/// Parse a command-line value as JSON, falling back to a plain string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
