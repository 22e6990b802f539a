//! Configuration management for Concord nodes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use concord_common::constants::{
    DEFAULT_BIND_ADDR, DEFAULT_BROADCAST_WINDOW_MS, DEFAULT_DISCOVERY_INTERVAL_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_JOIN_TIMEOUT_MS,
    DEFAULT_MAX_DISCOVERY_ROUNDS, DEFAULT_MAX_JOIN_ATTEMPTS, DEFAULT_MAX_MISSED_HEARTBEATS,
    DEFAULT_MAX_REDIRECTS, DEFAULT_MERGE_INTERVAL_MS, DEFAULT_MERGE_TIMEOUT_MS,
};
use concord_common::{Address, ClusterError, ClusterResult};

/// Process-level configuration of a node binary
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Socket address the cluster transport binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address announced to peers (defaults to the bound address)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Membership protocol settings
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Settings consumed by the membership core; read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Lite members hold no partitioned data and never become master
    #[serde(default)]
    pub lite_member: bool,

    /// Diagnostic attributes published with the local member
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub join: JoinConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub merge: MergeConfig,
}

/// Discovery strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    Static,
    Broadcast,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_mode")]
    pub mode: DiscoveryMode,

    /// Ordered seed list for static discovery
    #[serde(default)]
    pub members: Vec<Address>,

    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Where probes are sent (a broadcast or multicast socket address)
    #[serde(default)]
    pub target: Option<SocketAddr>,

    /// How long replies are collected per round
    #[serde(default = "default_broadcast_window")]
    pub window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    /// Per-candidate round trip deadline, also the approval deadline
    #[serde(default = "default_join_timeout")]
    pub timeout_ms: u64,

    /// Pause between discovery rounds
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,

    /// Rounds without a master before a full member becomes standalone master
    #[serde(default = "default_max_discovery_rounds")]
    pub max_discovery_rounds: u32,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Join sequences attempted before giving up with `JoinFailure`
    #[serde(default = "default_max_join_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failed probes before a member is declared lost
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    /// Background split-brain detection period
    #[serde(default = "default_merge_interval")]
    pub interval_ms: u64,

    /// Deadline for re-joining the surviving cluster
    #[serde(default = "default_merge_timeout")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_bind_addr() -> String { DEFAULT_BIND_ADDR.to_string() }
fn default_discovery_mode() -> DiscoveryMode { DiscoveryMode::Static }
fn default_broadcast_window() -> u64 { DEFAULT_BROADCAST_WINDOW_MS }
fn default_join_timeout() -> u64 { DEFAULT_JOIN_TIMEOUT_MS }
fn default_discovery_interval() -> u64 { DEFAULT_DISCOVERY_INTERVAL_MS }
fn default_max_discovery_rounds() -> u32 { DEFAULT_MAX_DISCOVERY_ROUNDS }
fn default_max_redirects() -> u32 { DEFAULT_MAX_REDIRECTS }
fn default_max_join_attempts() -> u32 { DEFAULT_MAX_JOIN_ATTEMPTS }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_MS }
fn default_heartbeat_timeout() -> u64 { DEFAULT_HEARTBEAT_TIMEOUT_MS }
fn default_max_missed() -> u32 { DEFAULT_MAX_MISSED_HEARTBEATS }
fn default_merge_interval() -> u64 { DEFAULT_MERGE_INTERVAL_MS }
fn default_merge_timeout() -> u64 { DEFAULT_MERGE_TIMEOUT_MS }

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_addr: None,
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lite_member: false,
            attributes: BTreeMap::new(),
            discovery: DiscoveryConfig::default(),
            join: JoinConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: default_discovery_mode(),
            members: Vec::new(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: None,
            window_ms: default_broadcast_window(),
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_join_timeout(),
            discovery_interval_ms: default_discovery_interval(),
            max_discovery_rounds: default_max_discovery_rounds(),
            max_redirects: default_max_redirects(),
            max_attempts: default_max_join_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            max_missed: default_max_missed(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_merge_interval(),
            timeout_ms: default_merge_timeout(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file; defaults if the file doesn't exist
    pub fn load(config_path: &str) -> Result<Self> {
        if !Path::new(config_path).exists() {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
            .context("Failed to load config file")?;

        settings
            .try_deserialize()
            .context("Failed to parse config")
    }

    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_addr))
    }

    pub fn advertise_socket_addr(&self) -> Result<Option<SocketAddr>> {
        self.advertise_addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("Invalid advertise address: {addr}"))
            })
            .transpose()
    }
}

impl ClusterConfig {
    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> ClusterResult<()> {
        if self.discovery.mode == DiscoveryMode::Broadcast && !self.discovery.broadcast.enabled {
            return Err(ClusterError::Config(
                "broadcast discovery selected but broadcast is disabled".to_string(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ClusterError::Config(
                "heartbeat.max_missed must be at least 1".to_string(),
            ));
        }
        if self.join.max_attempts == 0 {
            return Err(ClusterError::Config(
                "join.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval_ms == 0 || self.merge.interval_ms == 0 {
            return Err(ClusterError::Config(
                "heartbeat and merge intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join.timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.join.discovery_interval_ms)
    }

    pub fn broadcast_window(&self) -> Duration {
        Duration::from_millis(self.discovery.broadcast.window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge.interval_ms)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.merge.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.mode, DiscoveryMode::Static);
        assert!(!config.lite_member);
    }

    #[test]
    fn test_broadcast_mode_requires_enabled_channel() {
        let mut config = ClusterConfig::default();
        config.discovery.mode = DiscoveryMode::Broadcast;
        assert!(matches!(config.validate(), Err(ClusterError::Config(_))));

        config.discovery.broadcast.enabled = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_file() {
        let toml = r#"
            bind_addr = "127.0.0.1:5801"

            [cluster]
            lite_member = true

            [cluster.discovery]
            mode = "static"
            members = ["127.0.0.1:5801", "127.0.0.1:5802"]

            [cluster.heartbeat]
            max_missed = 5
        "#;

        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let parsed: NodeConfig = settings.try_deserialize().unwrap();

        assert_eq!(parsed.bind_addr, "127.0.0.1:5801");
        assert!(parsed.cluster.lite_member);
        assert_eq!(parsed.cluster.discovery.members.len(), 2);
        assert_eq!(parsed.cluster.heartbeat.max_missed, 5);
        assert_eq!(parsed.cluster.join.max_redirects, DEFAULT_MAX_REDIRECTS);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::load("does/not/exist.toml").unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }
}
