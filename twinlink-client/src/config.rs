//! Client configuration
//!
//! A [`ClientConfig`] can be built in code or loaded from a TOML file
//! (`~/.config/twinlink/config.toml` by default):
//!
//! ```toml
//! endpoint = "tcp://registry.example.com:7400"
//! client_id = "examples_client"
//! request_timeout_ms = 5000
//!
//! [auth]
//! type = "credentials"
//! username = "solution"
//! password = "secret"
//!
//! [proxy]
//! host = "cache.example.com"
//! port = 3128
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use twinlink_protocol::Credentials;
use twinlink_utils::{paths, Result, TwinError};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;

/// Authentication material
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Username/password
    Credentials { username: String, password: String },
    /// Key-based authentication from a key store
    PublicKey {
        key_store: PathBuf,
        key_store_password: String,
        alias: String,
        alias_password: String,
    },
}

impl AuthConfig {
    /// Handshake credentials derived from this configuration
    pub fn credentials(&self) -> Credentials {
        match self {
            AuthConfig::Credentials { username, password } => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            AuthConfig::PublicKey { alias, .. } => Credentials::ClientCertificate {
                alias: alias.clone(),
            },
        }
    }
}

/// Trusted certificate store
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrustStoreConfig {
    pub location: PathBuf,
    pub password: String,
}

/// HTTP proxy used to tunnel the registry connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Reconnect policy of the framed transport
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts after a connection loss; 0 disables reconnecting
    pub max_attempts: u32,
    /// Delay between attempts
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Parsed registry endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Configuration of an [`IntegrationClient`](crate::IntegrationClient)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Registry endpoint (`tcp://host:port` or `unix:///path`)
    pub endpoint: String,
    pub client_id: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub trust_store: Option<TrustStoreConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Default deadline for correlated operations
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Grace period used by `destroy_default`
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            auth,
            trust_store: None,
            proxy: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some(ProxyConfig {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_trust_store(mut self, location: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        self.trust_store = Some(TrustStoreConfig {
            location: location.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.reconnect = ReconnectConfig {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        };
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TwinError::config(e.to_string()))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TwinError::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| TwinError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| TwinError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), endpoint = %config.endpoint, "Loaded client config");
        Ok(config)
    }

    /// Load the config file from the XDG config directory
    pub fn load_default() -> Result<Self> {
        Self::load(&paths::config_file())
    }

    /// Parse the endpoint URI into a socket address for [`FramedTransport`]
    ///
    /// Only `tcp` and `unix` schemes are understood here. Other transports
    /// interpret `endpoint` themselves.
    ///
    /// [`FramedTransport`]: crate::transport::FramedTransport
    pub fn parsed_endpoint(&self) -> Result<Endpoint> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| TwinError::config(format!("Invalid endpoint '{}': {}", self.endpoint, e)))?;

        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| TwinError::config("Missing host in endpoint"))?;
                let port = url
                    .port()
                    .ok_or_else(|| TwinError::config("Missing port in endpoint"))?;
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(TwinError::config("Missing socket path in endpoint"));
                }
                Ok(Endpoint::Unix(PathBuf::from(path)))
            }
            other => Err(TwinError::config(format!(
                "Unsupported endpoint scheme '{}' (expected tcp or unix)",
                other
            ))),
        }
    }

    /// Check the transport-independent options
    ///
    /// The endpoint only has to be a well-formed URI; its scheme is checked
    /// by the transport that opens it.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.endpoint)
            .map_err(|e| TwinError::config(format!("Invalid endpoint '{}': {}", self.endpoint, e)))?;

        if self.client_id.trim().is_empty() {
            return Err(TwinError::config("client_id must not be empty"));
        }

        match &self.auth {
            AuthConfig::Credentials { username, .. } => {
                if username.trim().is_empty() {
                    return Err(TwinError::config("auth.username must not be empty"));
                }
            }
            AuthConfig::PublicKey { key_store, alias, .. } => {
                if alias.trim().is_empty() {
                    return Err(TwinError::config("auth.alias must not be empty"));
                }
                if !key_store.exists() {
                    return Err(TwinError::config(format!(
                        "Key store not found: {}",
                        key_store.display()
                    )));
                }
            }
        }

        if let Some(trust) = &self.trust_store {
            if !trust.location.exists() {
                return Err(TwinError::config(format!(
                    "Trust store not found: {}",
                    trust.location.display()
                )));
            }
        }

        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(TwinError::config("Timeouts must be greater than zero"));
        }

        Ok(())
    }
}
