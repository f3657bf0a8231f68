//! Scheduler core: ingests signed actions, fans them out as per-agent
//! commands over the relay, collects results and drives every action to a
//! terminal status. Five pipeline workers cooperate over bounded
//! channels; the on-disk spool makes each hand-off recoverable across
//! restarts.

use std::path::PathBuf;
use std::time::Duration;

use relay_queue::RelayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod housekeeping;
pub mod identity;
pub mod pipeline;

pub use pipeline::{CommandPublisher, RelayPublisher};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Db(#[from] inquest_db::DbError),
    #[error("spool error: {0}")]
    Spool(#[from] spool_repo::SpoolError),
    #[error("relay error: {0}")]
    Relay(#[from] relay_queue::RelayError),
    #[error("trust error: {0}")]
    Trust(#[from] trust_kernel::TrustError),
    #[error("model error: {0}")]
    Model(#[from] core_models::ModelError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Key id under which the scheduler's own signing identity lives in the
/// keystore, and the investigator name it registers under.
pub const SCHEDULER_KEY_ID: &str = "scheduler";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub relay: RelayConfig,
    pub db_path: String,
    pub spool_dir: PathBuf,
    pub keystore_path: PathBuf,
    /// Directory of armored investigator public keys.
    pub agent_keys: PathBuf,
    pub acl: PathBuf,
    #[serde(default = "default_spool_freq")]
    pub spool_inspect_freq_secs: u64,
    #[serde(default = "default_housekeeping_freq")]
    pub housekeeping_freq_secs: u64,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: u64,
}

fn default_spool_freq() -> u64 {
    7
}

fn default_housekeeping_freq() -> u64 {
    60
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_offline_threshold() -> u64 {
    1800
}

impl SchedulerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {e}", path.display())))?;
        let cfg: SchedulerConfig = serde_json::from_str(&raw)
            .map_err(|e| SchedulerError::Config(format!("{}: {e}", path.display())))?;
        Ok(cfg)
    }

    pub fn spool_inspect_freq(&self) -> Duration {
        Duration::from_secs(self.spool_inspect_freq_secs)
    }

    pub fn housekeeping_freq(&self) -> Duration {
        Duration::from_secs(self.housekeeping_freq_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs as i64)
    }

    pub fn offline_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_threshold_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_in() {
        let cfg: SchedulerConfig = serde_json::from_str(
            r#"{
                "relay": {"url": "redis://127.0.0.1/"},
                "dbPath": "./inquest.db",
                "spoolDir": "./spool",
                "keystorePath": "./keystore.json",
                "agentKeys": "./keys",
                "acl": "./acl.json"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.spool_inspect_freq_secs, 7);
        assert_eq!(cfg.idle_threshold_secs, 300);
        assert_eq!(cfg.offline_threshold_secs, 1800);
        assert_eq!(cfg.relay.prefix, "mig");
    }
}
