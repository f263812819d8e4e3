//! Agent configuration.
//!
//! The configuration can be built directly with [`AgentConfigBuilder`] or loaded from a TOML
//! file that uses the controller configuration key names (`AccountingStorageHost`, ...).
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::common::error::{DbdError, error};

pub const DEFAULT_STORAGE_PORT: u16 = 6819;
pub const DEFAULT_CTLD_PORT: u16 = 6817;
pub const DEFAULT_MAX_DBD_MSGS: usize = 10000;
pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_EXT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const REPLAY_FILE_NAME: &str = "dbd.messages";

/// What happens when the pending queue reaches its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowAction {
    /// Drop step records first, then job start records
    #[default]
    Discard,
    /// Save the queue to the replay file and stop the agent
    Exit,
}

impl FromStr for OverflowAction {
    type Err = DbdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(OverflowAction::Discard),
            "exit" => Ok(OverflowAction::Exit),
            other => Err(DbdError::Config(format!(
                "invalid max_dbd_msg_action `{other}`"
            ))),
        }
    }
}

/// Finds `max_dbd_msg_action` in a comma separated `key=value` parameter list.
pub fn parse_overflow_action(parameters: &str) -> crate::Result<Option<OverflowAction>> {
    for item in parameters.split(',') {
        if let Some((key, value)) = item.split_once('=') {
            if key.trim().eq_ignore_ascii_case("max_dbd_msg_action") {
                return value.parse().map(Some);
            }
        }
    }
    Ok(None)
}

/// An external accounting daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtHost {
    pub host: String,
    pub port: u16,
}

impl ExtHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `host[:port],host[:port],...` list.
    pub fn parse_list(list: &str, default_port: u16) -> crate::Result<Vec<ExtHost>> {
        let mut hosts: Vec<ExtHost> = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let host = match item.rsplit_once(':') {
                Some((host, port)) => {
                    let Ok(port) = port.parse::<u16>() else {
                        return Err(DbdError::Config(format!(
                            "invalid port in external host `{item}`"
                        )));
                    };
                    ExtHost::new(host, port)
                }
                None => ExtHost::new(item, default_port),
            };
            if host.host.is_empty() {
                return Err(DbdError::Config(format!("missing host name in `{item}`")));
            }
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }
}

impl std::fmt::Display for ExtHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct AgentConfig {
    #[builder(setter(into))]
    pub cluster_name: String,
    #[builder(setter(into), default = "\"localhost\".to_string()")]
    pub storage_host: String,
    #[builder(setter(into, strip_option), default)]
    pub storage_backup_host: Option<String>,
    #[builder(default = "DEFAULT_STORAGE_PORT")]
    pub storage_port: u16,
    #[builder(default)]
    pub ext_hosts: Vec<ExtHost>,

    #[builder(setter(into))]
    pub state_save_location: PathBuf,
    /// Explicit queue limit, overrides the limit derived from the cluster size
    #[builder(setter(strip_option), default)]
    pub max_dbd_msgs: Option<usize>,
    #[builder(default)]
    pub max_jobs: usize,
    #[builder(default)]
    pub node_count: usize,
    #[builder(default)]
    pub max_dbd_msg_action: OverflowAction,

    /// Failed registration of the controller is fatal
    #[builder(default)]
    pub accounting_enforce: bool,
    #[builder(default = "DEFAULT_CTLD_PORT")]
    pub ctld_port: u16,
    #[builder(default)]
    pub uid: u32,

    #[builder(default = "DEFAULT_MSG_TIMEOUT")]
    pub msg_timeout: Duration,
    #[builder(default = "DEFAULT_RETRY_INTERVAL")]
    pub retry_interval: Duration,
    #[builder(default = "DEFAULT_EXT_CHECK_INTERVAL")]
    pub ext_check_interval: Duration,
}

/// On-disk form of [`AgentConfig`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct ConfigFile {
    cluster_name: String,
    accounting_storage_host: Option<String>,
    accounting_storage_backup_host: Option<String>,
    accounting_storage_port: Option<u16>,
    accounting_storage_ext_host: Option<String>,
    #[serde(default)]
    accounting_storage_enforce: bool,
    state_save_location: PathBuf,
    #[serde(rename = "MaxDBDMsgs")]
    max_dbd_msgs: Option<usize>,
    #[serde(default)]
    max_job_count: usize,
    #[serde(default)]
    node_count: usize,
    slurmctld_parameters: Option<String>,
    slurmctld_port: Option<u16>,
    /// Seconds
    message_timeout: Option<u64>,
    /// Seconds
    dbd_retry_interval: Option<u64>,
    /// Seconds
    ext_check_interval: Option<u64>,
}

impl AgentConfig {
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        let storage_port = file.accounting_storage_port.unwrap_or(DEFAULT_STORAGE_PORT);
        let ext_hosts = match file.accounting_storage_ext_host.as_deref() {
            Some(list) => ExtHost::parse_list(list, storage_port)?,
            None => Vec::new(),
        };
        let max_dbd_msg_action = match file.slurmctld_parameters.as_deref() {
            Some(parameters) => parse_overflow_action(parameters)?.unwrap_or_default(),
            None => OverflowAction::default(),
        };
        if file.max_dbd_msgs == Some(0) {
            return Err(DbdError::Config("MaxDBDMsgs must be positive".to_string()));
        }
        let seconds = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        Ok(AgentConfig {
            cluster_name: file.cluster_name,
            storage_host: file
                .accounting_storage_host
                .unwrap_or_else(|| "localhost".to_string()),
            storage_backup_host: file.accounting_storage_backup_host,
            storage_port,
            ext_hosts,
            state_save_location: file.state_save_location,
            max_dbd_msgs: file.max_dbd_msgs,
            max_jobs: file.max_job_count,
            node_count: file.node_count,
            max_dbd_msg_action,
            accounting_enforce: file.accounting_storage_enforce,
            ctld_port: file.slurmctld_port.unwrap_or(DEFAULT_CTLD_PORT),
            uid: 0,
            msg_timeout: seconds(file.message_timeout, DEFAULT_MSG_TIMEOUT),
            retry_interval: seconds(file.dbd_retry_interval, DEFAULT_RETRY_INTERVAL),
            ext_check_interval: seconds(file.ext_check_interval, DEFAULT_EXT_CHECK_INTERVAL),
        })
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => return error(format!("Cannot read configuration {}: {e}", path.display())),
        };
        Self::from_toml(&text)
    }

    /// Limit of the pending queue.
    pub fn max_queue(&self) -> usize {
        self.max_dbd_msgs.unwrap_or_else(|| {
            DEFAULT_MAX_DBD_MSGS.max(2 * self.max_jobs + 4 * self.node_count)
        })
    }

    pub fn replay_path(&self) -> PathBuf {
        self.state_save_location.join(REPLAY_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        AgentConfig, AgentConfigBuilder, DEFAULT_STORAGE_PORT, ExtHost, OverflowAction,
        parse_overflow_action,
    };

    #[test]
    fn max_queue_follows_cluster_size() {
        let config = AgentConfigBuilder::default()
            .cluster_name("c1")
            .state_save_location("/tmp")
            .build()
            .unwrap();
        assert_eq!(config.max_queue(), 10000);

        let config = AgentConfigBuilder::default()
            .cluster_name("c1")
            .state_save_location("/tmp")
            .max_jobs(5000)
            .node_count(1000)
            .build()
            .unwrap();
        assert_eq!(config.max_queue(), 14000);

        let config = AgentConfigBuilder::default()
            .cluster_name("c1")
            .state_save_location("/tmp")
            .max_jobs(5000)
            .max_dbd_msgs(100)
            .build()
            .unwrap();
        assert_eq!(config.max_queue(), 100);
        assert_eq!(
            config.replay_path(),
            std::path::PathBuf::from("/tmp/dbd.messages")
        );
    }

    #[test]
    fn parse_ext_hosts() {
        let hosts = ExtHost::parse_list("db1, db2:7000,db1", DEFAULT_STORAGE_PORT).unwrap();
        assert_eq!(
            hosts,
            vec![
                ExtHost::new("db1", DEFAULT_STORAGE_PORT),
                ExtHost::new("db2", 7000)
            ]
        );
        assert!(ExtHost::parse_list("db1:port", DEFAULT_STORAGE_PORT).is_err());
        assert!(ExtHost::parse_list(":7000", DEFAULT_STORAGE_PORT).is_err());
        assert!(ExtHost::parse_list("", DEFAULT_STORAGE_PORT)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn parse_action() {
        assert_eq!(
            parse_overflow_action("enable_configless,max_dbd_msg_action=exit").unwrap(),
            Some(OverflowAction::Exit)
        );
        assert_eq!(parse_overflow_action("enable_configless").unwrap(), None);
        assert!(parse_overflow_action("max_dbd_msg_action=keep").is_err());
    }

    #[test]
    fn load_from_toml() {
        let config = AgentConfig::from_toml(
            r#"
ClusterName = "tux"
AccountingStorageHost = "dbd1"
AccountingStorageBackupHost = "dbd2"
AccountingStorageExtHost = "ext1,ext2:7001"
AccountingStorageEnforce = true
StateSaveLocation = "/var/spool/ctld"
MaxJobCount = 20000
SlurmctldParameters = "max_dbd_msg_action=discard"
DbdRetryInterval = 3
"#,
        )
        .unwrap();
        assert_eq!(config.cluster_name, "tux");
        assert_eq!(config.storage_host, "dbd1");
        assert_eq!(config.storage_backup_host.as_deref(), Some("dbd2"));
        assert_eq!(config.storage_port, DEFAULT_STORAGE_PORT);
        assert_eq!(config.ext_hosts.len(), 2);
        assert_eq!(config.ext_hosts[1], ExtHost::new("ext2", 7001));
        assert!(config.accounting_enforce);
        assert_eq!(config.max_queue(), 40000);
        assert_eq!(config.max_dbd_msg_action, OverflowAction::Discard);
        assert_eq!(config.retry_interval, Duration::from_secs(3));
        assert_eq!(config.ext_check_interval, Duration::from_secs(5));
    }

    #[test]
    fn reject_unknown_keys() {
        assert!(
            AgentConfig::from_toml(
                "ClusterName = \"tux\"\nStateSaveLocation = \"/tmp\"\nFoo = 1\n"
            )
            .is_err()
        );
    }
}
