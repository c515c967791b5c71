//! Configuration for nodeherd components
//!
//! Every section has serde defaults so a bare `nodeherd-agent run` works against
//! a local store; a TOML file and `NODEHERD_*` environment variables override the
//! defaults, and CLI flags override both.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination store settings
    pub store: StoreConfig,

    /// Scheduler role settings
    pub scheduler: SchedulerConfig,

    /// Per-node agent settings
    pub agent: AgentConfig,

    /// Database administrative endpoint settings
    pub cluster: ClusterApiConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            agent: AgentConfig::default(),
            cluster: ClusterApiConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Coordination store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints, first reachable wins
    pub endpoints: Vec<String>,

    /// Base key under which announcements, states and the lock live
    pub service_path: String,
}

/// Scheduler role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Reconciliation tick interval in seconds
    pub interval_secs: u64,

    /// Extra margin granted to the master lease beyond one tick, in seconds
    pub master_lease_margin_secs: u64,

    /// TTL for persisted state records; defaults to interval + margin
    pub state_ttl_secs: Option<u64>,

    /// Scheduler lock lease in seconds
    pub lock_lease_secs: u64,

    /// Scheduler lock renewal period in seconds; must stay under the lease
    pub lock_renew_secs: u64,
}

/// Per-node agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Machine identity announced to the fleet; discovered when unset
    pub ip_address: Option<String>,

    /// Heartbeat period in seconds
    pub heartbeat_secs: u64,

    /// Announcement lease in seconds; a few seconds longer than the heartbeat
    /// so a crashed node's record expires rather than lingers
    pub announcement_ttl_secs: u64,

    /// Seconds to let in-flight cluster operations settle before the
    /// shutdown failover
    pub drain_secs: u64,

    /// Trigger a rebalance after the shutdown failover
    pub rebalance_on_exit: bool,

    /// Log cluster operations without invoking them
    pub what_if: bool,

    /// Auto-failover timeout pushed to the cluster once the scheduler role is
    /// held; disabled when unset
    pub auto_failover_timeout_secs: Option<u64>,
}

/// Database administrative endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterApiConfig {
    /// Administrative credential
    pub username: String,
    pub password: String,

    /// Fixed management port on every node
    pub port: u16,

    /// Services a newly added node should run
    pub services: String,

    /// Progress-poll period in seconds
    pub progress_poll_secs: u64,

    /// Give up waiting for a rebalance/failover after this many seconds
    pub progress_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            service_path: "/services/dbarray".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            master_lease_margin_secs: 3,
            state_ttl_secs: None,
            lock_lease_secs: 5,
            lock_renew_secs: 4,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ip_address: None,
            heartbeat_secs: 3,
            announcement_ttl_secs: 5,
            drain_secs: 5,
            rebalance_on_exit: false,
            what_if: false,
            auto_failover_timeout_secs: Some(31),
        }
    }
}

impl Default for ClusterApiConfig {
    fn default() -> Self {
        Self {
            username: "Administrator".to_string(),
            password: "password".to_string(),
            port: 8091,
            services: "kv,index,n1ql".to_string(),
            progress_poll_secs: 1,
            progress_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus `NODEHERD_*`
    /// environment variables (`NODEHERD_SCHEDULER__INTERVAL_SECS=5`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NODEHERD")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no store endpoints".into()));
        }
        if !self.store.service_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "service_path must be absolute: {}",
                self.store.service_path
            )));
        }
        if self.scheduler.lock_renew_secs >= self.scheduler.lock_lease_secs {
            return Err(Error::InvalidConfig(
                "lock_renew_secs must be shorter than lock_lease_secs".into(),
            ));
        }
        if self.agent.announcement_ttl_secs <= self.agent.heartbeat_secs {
            return Err(Error::InvalidConfig(
                "announcement_ttl_secs must exceed heartbeat_secs".into(),
            ));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn master_lease_margin(&self) -> Duration {
        Duration::from_secs(self.master_lease_margin_secs)
    }

    /// TTL applied to persisted state records
    pub fn state_ttl(&self) -> u64 {
        self.state_ttl_secs
            .unwrap_or(self.interval_secs + self.master_lease_margin_secs)
    }
}

impl AgentConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl ClusterApiConfig {
    pub fn progress_poll(&self) -> Duration {
        Duration::from_secs(self.progress_poll_secs)
    }

    pub fn progress_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler.state_ttl(), 13);
        assert!(cfg.agent.announcement_ttl_secs > cfg.agent.heartbeat_secs);
    }

    #[test]
    fn test_state_ttl_override() {
        let mut cfg = SchedulerConfig::default();
        cfg.state_ttl_secs = Some(30);
        assert_eq!(cfg.state_ttl(), 30);
    }

    #[test]
    fn test_rejects_relative_service_path() {
        let mut cfg = Config::default();
        cfg.store.service_path = "services/dbarray".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_renew_longer_than_lease() {
        let mut cfg = Config::default();
        cfg.scheduler.lock_renew_secs = 9;
        assert!(cfg.validate().is_err());
    }
}
