//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given with `--config`
//! - `canopy.toml` in one of the default locations
//! - Environment variables (`CANOPY_*`, nested keys joined with `__`)

use anyhow::{Context, Result};
use canopy_core::RouterConfig;
use canopy_protocol::codec::{MAX_FRAME_SIZE, MIN_CHUNK_SIZE};
use canopy_protocol::{NodeId, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Publisher ID the broker puts on the packets it sends.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Framing configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Routing configuration.
    #[serde(default)]
    pub router: RouterSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin HTTP endpoint configuration.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Chunk size every frame is padded to. Clients must use the same value.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Initial read buffer capacity per connection.
    #[serde(default = "default_read_buffer")]
    pub read_buffer_capacity: usize,

    /// How long a closing connection may spend writing queued frames.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

/// Routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Drop a node's subscriptions when it disconnects.
    #[serde(default = "default_true")]
    pub purge_on_unregister: bool,

    /// Remove channels emptied by an unsubscribe right away.
    #[serde(default)]
    pub prune_empty_channels: bool,

    /// Interval of the empty-channel sweep in milliseconds; 0 disables it.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admin port.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7400
}

fn default_node_id() -> String {
    "canopy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_read_buffer() -> usize {
    8 * 1024
}

fn default_drain_timeout() -> u64 {
    5_000
}

fn default_sweep_interval() -> u64 {
    60_000 // 1 minute
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_port() -> u16 {
    7480
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: default_node_id(),
            transport: TransportConfig::default(),
            router: RouterSection::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            read_buffer_capacity: default_read_buffer(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            purge_on_unregister: true,
            prune_empty_channels: false,
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit file, a default location, or the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                Self::from_file(shellexpand::tilde(&path.to_string_lossy()).as_ref())?
            }
            None => Self::from_default_paths()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "canopy.toml",
            "/etc/canopy/canopy.toml",
            "~/.config/canopy/canopy.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Self::from_env()
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Build configuration from defaults overridden by `CANOPY_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds a value of the wrong type.
    pub fn from_env() -> Result<Self> {
        Self::from_env_source(::config::Environment::with_prefix("CANOPY"))
    }

    fn from_env_source(source: ::config::Environment) -> Result<Self> {
        ::config::Config::builder()
            .add_source(
                source
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read environment configuration")?
            .try_deserialize()
            .context("Invalid environment configuration")
    }

    /// Check values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_FRAME_SIZE).contains(&self.transport.chunk_size) {
            anyhow::bail!(
                "transport.chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_FRAME_SIZE}, got {}",
                self.transport.chunk_size
            );
        }
        if self.node_id.is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }
        self.bind_addr().map(drop)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// The broker's own node ID.
    #[must_use]
    pub fn server_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    /// Router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            purge_on_unregister: self.router.purge_on_unregister,
            prune_empty_channels: self.router.prune_empty_channels,
        }
    }

    /// Framing settings for each connection.
    #[must_use]
    pub fn transport_config(&self) -> canopy_transport::TransportConfig {
        canopy_transport::TransportConfig {
            chunk_size: self.transport.chunk_size,
            read_buffer_capacity: self.transport.read_buffer_capacity,
            drain_timeout: Duration::from_millis(self.transport.drain_timeout_ms),
        }
    }

    /// Sweep interval, or `None` when sweeping is off.
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.router.sweep_interval_ms > 0)
            .then(|| Duration::from_millis(self.router.sweep_interval_ms))
    }
}
