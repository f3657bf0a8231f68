//! Agent runtime: endpoint-side process that authenticates, executes and
//! answers investigation commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_queue::RelayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dispatch;
pub mod environment;
pub mod stat;

/// Process exit codes, part of the supervisor contract.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const RELAY_UNREACHABLE: i32 = 2;
    pub const DESTROYED: i32 = 3;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("trust error: {0}")]
    Trust(#[from] trust_kernel::TrustError),
    #[error("relay error: {0}")]
    Relay(#[from] relay_queue::RelayError),
    #[error("module error: {0}")]
    Module(#[from] module_runtime::ModuleError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `stdout`, `file` or `syslog`; only stdout and file are wired.
    #[serde(default = "default_log_mode")]
    pub mode: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { mode: default_log_mode(), level: default_log_level(), file: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatConfig {
    /// Loopback listen address of the stat socket.
    #[serde(default = "default_stat_bind")]
    pub bind: String,
}

impl Default for StatConfig {
    fn default() -> Self {
        StatConfig { bind: default_stat_bind() }
    }
}

fn default_log_mode() -> String {
    "stdout".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Relay URL; `rediss` scheme enables TLS with the cert material.
    pub relay: String,
    /// Public API endpoint, used for public-IP discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default)]
    pub certs: CertPaths,
    /// Path to the ACL file.
    pub acl: PathBuf,
    /// Directory of armored investigator public keys.
    pub agent_keys: PathBuf,
    #[serde(default = "default_heartbeat_freq", alias = "heartbeatFreq")]
    pub heartbeat_freq_secs: u64,
    #[serde(default = "default_module_timeout", alias = "moduleTimeout")]
    pub module_timeout_secs: u64,
    #[serde(default)]
    pub extra_privacy_mode: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub must_install_service: bool,
    /// CONNECT proxies to try before a direct relay connection.
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub stat: StatConfig,
    /// Attempts before giving up on the relay (exit code 2).
    #[serde(default = "default_relay_retry_budget")]
    pub relay_retry_budget: u32,
}

fn default_heartbeat_freq() -> u64 {
    30
}

fn default_module_timeout() -> u64 {
    300
}

fn default_stat_bind() -> String {
    "127.0.0.1:51664".to_string()
}

fn default_relay_retry_budget() -> u32 {
    10
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        let mut cfg: AgentConfig = serde_json::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// A few keys can be overridden from the environment, which beats
    /// editing the config file on a fleet.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("INQUEST_RELAY") {
            self.relay = url;
        }
        if let Ok(bind) = std::env::var("INQUEST_STAT_BIND") {
            self.stat.bind = bind;
        }
        if let Ok(freq) = std::env::var("INQUEST_HEARTBEAT_FREQ") {
            if let Ok(secs) = freq.parse() {
                self.heartbeat_freq_secs = secs;
            }
        }
    }

    pub fn heartbeat_freq(&self) -> Duration {
        Duration::from_secs(self.heartbeat_freq_secs)
    }

    pub fn module_timeout(&self) -> Duration {
        Duration::from_secs(self.module_timeout_secs)
    }

    pub fn relay_config(&self) -> RelayConfig {
        let mut relay = RelayConfig::new(self.relay.clone());
        relay.ca_cert = self.certs.ca.clone();
        relay.client_cert = self.certs.cert.clone();
        relay.client_key = self.certs.key.clone();
        relay
    }
}
