//! Server configuration.
//!
//! Configuration is layered from:
//! - A TOML file (`--config <path>`, or the first of the default search paths)
//! - Environment variables (`PULSE_CHAT__<SECTION>__<KEY>`)

use anyhow::{Context, Result};
use pulse_chat_core::{
    AttachmentConfig, CoreConfig, DeliveryConfig, HubConfig, ModerationConfig, NewRule,
    ServiceConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, in search order.
const CONFIG_PATHS: [&str; 3] = [
    "pulse-chat.toml",
    "/etc/pulse-chat/pulse-chat.toml",
    "~/.config/pulse-chat/pulse-chat.toml",
];

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "PULSE_CHAT";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Connection hub tuning.
    #[serde(default)]
    pub hub: HubSection,

    /// Attachment limits and blob storage.
    #[serde(default)]
    pub attachments: AttachmentsSection,

    /// Delivery record retention.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Moderation matching and seed rules.
    #[serde(default)]
    pub moderation: ModerationSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum WebSocket frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum message length in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Maximum reaction length in characters.
    #[serde(default = "default_max_emoji_length")]
    pub max_emoji_length: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Connection hub tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Frames buffered per connection before it is dropped.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Frames buffered per channel before broadcasts are dropped.
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,

    /// Maximum channels one connection may listen on.
    #[serde(default = "default_max_channels_per_connection")]
    pub max_channels_per_connection: usize,
}

/// Attachment section: pipeline limits plus where blobs are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsSection {
    #[serde(flatten)]
    pub pipeline: AttachmentConfig,

    /// Directory blobs are written to.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// URL prefix under which stored blobs are served.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

/// Moderation section: matching behaviour plus rules created at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModerationSection {
    #[serde(flatten)]
    pub engine: ModerationConfig,

    /// Rules created when the server starts.
    #[serde(default)]
    pub rules: Vec<NewRule>,
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

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_message_length() -> usize {
    ServiceConfig::default().max_message_length
}

fn default_max_emoji_length() -> usize {
    ServiceConfig::default().max_emoji_length
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_outbound_capacity() -> usize {
    HubConfig::default().outbound_capacity
}

fn default_dispatch_capacity() -> usize {
    HubConfig::default().dispatch_capacity
}

fn default_max_channels_per_connection() -> usize {
    HubConfig::default().max_channels_per_connection
}

fn default_storage_dir() -> String {
    "./data/attachments".to_string()
}

fn default_public_url() -> String {
    "/files".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hub: HubSection::default(),
            attachments: AttachmentsSection::default(),
            delivery: DeliveryConfig::default(),
            moderation: ModerationSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_message_length: default_max_message_length(),
            max_emoji_length: default_max_emoji_length(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            dispatch_capacity: default_dispatch_capacity(),
            max_channels_per_connection: default_max_channels_per_connection(),
        }
    }
}

impl Default for AttachmentsSection {
    fn default() -> Self {
        Self {
            pipeline: AttachmentConfig::default(),
            storage_dir: default_storage_dir(),
            public_url: default_public_url(),
        }
    }
}

impl AttachmentsSection {
    /// Storage directory with `~` expanded.
    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage_dir).as_ref())
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

impl Config {
    /// Load configuration from `path`, or the first default path that
    /// exists, with environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => CONFIG_PATHS
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::info!("Loading configuration from {}", file.display());
            builder = builder.add_source(
                config::File::from(file.as_path())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Configuration of the messaging core.
    #[must_use]
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            hub: HubConfig {
                outbound_capacity: self.hub.outbound_capacity,
                dispatch_capacity: self.hub.dispatch_capacity,
                max_channels_per_connection: self.hub.max_channels_per_connection,
            },
            service: ServiceConfig {
                max_message_length: self.limits.max_message_length,
                max_emoji_length: self.limits.max_emoji_length,
            },
            delivery: self.delivery.clone(),
            attachments: self.attachments.pipeline.clone(),
            moderation: self.moderation.engine.clone(),
        }
    }
}
