//! relay-tail configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`relay.toml`, `/etc/relay/relay.toml`, `~/.config/relay/relay.toml`)
//! - Environment variables (`RELAY__CLIENT__URL`, `RELAY__METRICS__PORT`, ...)
//!
//! Environment variables take precedence over the file.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use relay_protocol::PostgresChangeFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tenvis_relay_client::ClientConfig;
use tenvis_relay_core::{validate_channel_name, ChannelConfig, ChannelError};

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// relay-tail configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TailConfig {
    /// Connection settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// User access token for private channels and row-level security.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Channels to tail.
    #[serde(default)]
    pub channels: Vec<TailChannel>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One channel to subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailChannel {
    /// Channel name, without the `realtime:` prefix.
    pub name: String,

    /// Join options.
    #[serde(default)]
    pub config: ChannelConfig,

    /// Broadcast events to log; `"*"` logs all of them.
    #[serde(default = "default_broadcast_events")]
    pub broadcast: Vec<String>,

    /// Database change subscriptions.
    #[serde(default)]
    pub postgres: Vec<PostgresChangeFilter>,

    /// Log presence joins and leaves.
    #[serde(default)]
    pub presence: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_broadcast_events() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl TailConfig {
    /// Load configuration from the first default path that exists, plus
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result is invalid.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::build(path.as_deref())
    }

    /// Load configuration from `path`, plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed, or the
    /// result is invalid.
    pub fn load_from(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path);
        if !Path::new(expanded.as_ref()).exists() {
            bail!("Config file not found: {path}");
        }
        Self::build(Some(expanded.as_ref()))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            tracing::debug!(path, "Loading config file");
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let config: TailConfig = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check the client settings and channel names.
    ///
    /// # Errors
    ///
    /// Returns an error if no channels are configured or any setting is invalid.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        if self.channels.is_empty() {
            bail!("No channels configured");
        }
        for entry in &self.channels {
            validate_channel_name(&entry.name)
                .map_err(ChannelError::InvalidName)
                .with_context(|| format!("Invalid channel name: {:?}", entry.name))?;
        }
        Ok(())
    }
}
