//! Engine configuration (TOML), in the teacher's `config.rs` style:
//! a `Config::try_from(&str)` entry point, typed sub-sections with
//! `Default`, and cron/duration parsing validated eagerly so a bad
//! config file fails at load time rather than mid-sync.

use cron::Schedule;
use serde::Deserialize;
use std::fmt::Formatter;
use std::time::Duration;

#[derive(Debug, PartialEq, Clone)]
pub enum ConfigError {
    InvalidCronExpression(String),
    InvalidDuration(String),
    InvalidToml(String),
    MissingLocalIps,
}

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidCronExpression(expr) => {
                const EXPRESSION_INFO: &str = r#"Cron expression format:
      sec  min   hour   day of month   month   day of week   year
E.g., "0   30   9,12,15     1,15       May-Aug  Mon,Wed,Fri  2018/2"
"#;
                write!(f, "Invalid cron expression: {expr}\n\n{EXPRESSION_INFO}")
            }
            ConfigError::InvalidDuration(e) => write!(f, "Invalid duration: {e}"),
            ConfigError::InvalidToml(e) => write!(f, "Invalid TOML configuration: {e}"),
            ConfigError::MissingLocalIps => {
                write!(f, "node.local_ips must list at least one address")
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub links: Vec<LinkScheduleConfig>,
}

impl Config {
    pub fn try_from(toml: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config: Config = toml::from_str(toml).map_err(|e| ConfigError::InvalidToml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.local_ips.is_empty() {
            return Err(ConfigError::MissingLocalIps);
        }
        self.timeouts.task_wait()?;
        self.timeouts.rpc()?;
        for link in &self.links {
            link.schedule()?;
        }
        Ok(())
    }
}

/// This node's identity: the IP(s) a `ReplicationLink::partners` entry is
/// matched against to decide `is_master_here` (spec §3, §4.5). Real
/// deployments source this from the network-config collaborator
/// (`network.config.get_my_ips` in the original); here it's static
/// config, since that collaborator is out of scope (spec §1).
#[derive(Debug, Deserialize, Default)]
pub struct NodeConfig {
    pub local_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DatastoreConfig {
    /// Path to the JSON-file-backed `replication.links` collection.
    #[serde(default = "default_datastore_path")]
    pub path: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        DatastoreConfig {
            path: default_datastore_path(),
        }
    }
}

fn default_datastore_path() -> String {
    "replication.json".to_string()
}

/// Timeouts per spec §5: 3600s for task waits, 20s for interactive RPC.
#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_task_wait")]
    task_wait: String,
    #[serde(default = "default_rpc")]
    rpc: String,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            task_wait: default_task_wait(),
            rpc: default_rpc(),
        }
    }
}

fn default_task_wait() -> String {
    "3600s".to_string()
}

fn default_rpc() -> String {
    "20s".to_string()
}

impl TimeoutsConfig {
    pub fn task_wait(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.task_wait).map_err(|e| ConfigError::InvalidDuration(e.to_string()))
    }

    pub fn rpc(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.rpc).map_err(|e| ConfigError::InvalidDuration(e.to_string()))
    }
}

/// When to run `replication.sync` for one configured link.
#[derive(Debug, Deserialize)]
pub struct LinkScheduleConfig {
    pub name: String,
    pub schedule: String,
}

impl LinkScheduleConfig {
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::try_from(self.schedule.as_str())
            .map_err(|_| ConfigError::InvalidCronExpression(self.schedule.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config() {
        const CONFIG: &str = r#"
[node]
local_ips = ["10.0.0.1"]

[datastore]
path = "/var/db/replication.json"

[[links]]
name = "tank-to-backup"
schedule = "0 0 5 * * Sun *"
"#;
        let config = Config::try_from(CONFIG).unwrap();
        assert_eq!(config.node.local_ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(config.links.len(), 1);
    }

    #[test]
    fn missing_local_ips_is_rejected() {
        const CONFIG: &str = r#"
[node]
local_ips = []
"#;
        let err = Config::try_from(CONFIG).unwrap_err();
        assert!(err.to_string().contains("local_ips"));
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        const CONFIG: &str = r#"
[node]
local_ips = ["10.0.0.1"]

[[links]]
name = "bad"
schedule = "not a cron expression"
"#;
        assert!(Config::try_from(CONFIG).is_err());
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        const CONFIG: &str = r#"
[node]
local_ips = ["10.0.0.1"]
"#;
        let config = Config::try_from(CONFIG).unwrap();
        assert_eq!(config.datastore.path, "replication.json");
        assert_eq!(config.timeouts.task_wait().unwrap(), Duration::from_secs(3600));
        assert_eq!(config.timeouts.rpc().unwrap(), Duration::from_secs(20));
    }
}
