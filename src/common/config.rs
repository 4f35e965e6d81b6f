//! Configuration for skyclaw components

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Host daemon config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,

    /// Gateway config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A scoped public API key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    /// The bearer key value
    pub key: String,

    /// Human-readable label; the submitter identity becomes `public:<label>`
    #[serde(default)]
    pub label: Option<String>,

    /// Capabilities a submission under this key may require
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<String>,

    /// Whether shell payloads are accepted under this key
    #[serde(default)]
    pub allow_shell: bool,
}

fn default_allowed_capabilities() -> Vec<String> {
    vec!["openclaw".to_string()]
}

impl ApiKeyConfig {
    /// Submitter identity for jobs created under this key
    pub fn submitter(&self) -> String {
        let label = self
            .label
            .clone()
            .unwrap_or_else(|| self.key.chars().take(8).collect());
        format!("public:{}", label)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Listen port for the HTTP API
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Shared cluster token (`x-skyclaw-token`); unset means open access
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Job lease duration in milliseconds
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Node ID (minted if absent)
    #[serde(default)]
    pub node_id: Option<String>,

    /// This node's public base URL, as peers should reach it
    #[serde(default)]
    pub public_url: Option<String>,

    /// Seed peer base URLs
    #[serde(default)]
    pub peer_urls: Vec<String>,

    /// Peer sync/discovery interval in milliseconds
    #[serde(default = "default_peer_sync_interval_ms")]
    pub peer_sync_interval_ms: u64,

    /// Minimum replica count a committed write must reach (self included)
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,

    /// Idempotency record lifetime in milliseconds
    #[serde(default = "default_idempotency_ttl_ms")]
    pub idempotency_ttl_ms: u64,

    /// Whether to learn new peers via gossip
    #[serde(default = "default_true")]
    pub peer_discovery_enabled: bool,

    /// CORS origin for the public API routes
    #[serde(default)]
    pub public_cors_origin: Option<String>,

    /// Scoped public API keys; empty disables the public surface
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

fn default_port() -> u16 {
    7070
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_lease_ms() -> u64 {
    60_000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./skyclaw.db")
}
fn default_peer_sync_interval_ms() -> u64 {
    3_000
}
fn default_min_replicas() -> u32 {
    2
}
fn default_idempotency_ttl_ms() -> u64 {
    86_400_000
}
fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
            lease_ms: default_lease_ms(),
            db_path: default_db_path(),
            node_id: None,
            public_url: None,
            peer_urls: vec![],
            peer_sync_interval_ms: default_peer_sync_interval_ms(),
            min_replicas: default_min_replicas(),
            idempotency_ttl_ms: default_idempotency_ttl_ms(),
            peer_discovery_enabled: true,
            public_cors_origin: None,
            api_keys: vec![],
        }
    }
}

/// Host daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Coordinator base URLs, tried round-robin
    pub coordinators: Vec<String>,

    /// Display name
    pub name: String,

    /// Stable host id; registered fresh when absent
    #[serde(default)]
    pub host_id: Option<String>,

    /// Capability labels this host advertises
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Max concurrent leases
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,

    /// Shared cluster token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// Claim poll interval in seconds
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,

    /// Commands a shell payload may invoke; empty rejects all shell jobs
    #[serde(default)]
    pub shell_allowlist: Vec<String>,

    /// Cap on captured stdout/stderr bytes per stream
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,

    /// openclaw binary for openclaw-run payloads
    #[serde(default = "default_openclaw_bin")]
    pub openclaw_bin: String,

    /// Host/IP other nodes use to reach service endpoints spawned here
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// First port handed out to spawned service processes
    #[serde(default = "default_service_port_base")]
    pub service_port_base: u16,
}

fn default_max_parallel() -> u32 {
    1
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_poll_secs() -> u64 {
    2
}
fn default_output_cap() -> usize {
    256 * 1024
}
fn default_openclaw_bin() -> String {
    "openclaw".to_string()
}
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}
fn default_service_port_base() -> u16 {
    9000
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Coordinator base URLs, tried round-robin
    pub coordinators: Vec<String>,

    /// Bind address
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Shared cluster token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Service list poll interval in seconds
    #[serde(default = "default_gateway_poll_secs")]
    pub poll_interval_secs: u64,

    /// Endpoint health probe interval in seconds
    #[serde(default = "default_probe_secs")]
    pub probe_interval_secs: u64,

    /// How long a failing endpoint stays ejected, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_gateway_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_gateway_poll_secs() -> u64 {
    5
}
fn default_probe_secs() -> u64 {
    10
}
fn default_cooldown_secs() -> u64 {
    30
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl CoordinatorConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.lease_ms == 0 {
            return Err(crate::Error::InvalidConfig("leaseMs must be positive".into()));
        }
        for key in &self.api_keys {
            if key.key.trim().is_empty() {
                return Err(crate::Error::InvalidConfig("api key cannot be empty".into()));
            }
        }
        Ok(())
    }
}
