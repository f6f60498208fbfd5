//! Agent configuration, deserialized from YAML and persisted back when the
//! head node pushes new callback endpoints.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};
use url::Url;

/// On-disk configuration for the node agent.
///
/// Report URIs may embed a `{servicename}` token that is substituted with the
/// location resolved for that service through the naming client.
///
/// # Examples
///
/// ```
/// use gridagent_core::config::AgentConfig;
///
/// let yaml_config = r#"
/// ---
/// registration_uri: "{SchedulerNode}/api/cn-01/registerrequested"
/// heartbeat_uri: "{SchedulerNode}/api/cn-01/computenodereported"
/// metric_uri: ""
/// naming_service_uris:
///   - "https://head.cluster:40300/api/fabric/resolve/singleton/"
/// "#;
///
/// let _decoded: AgentConfig = serde_yaml::from_str(yaml_config).unwrap();
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Endpoint for periodic node registration.
    pub registration_uri: String,
    /// Endpoint for periodic heartbeats carrying the task-table snapshot.
    pub heartbeat_uri: String,
    /// UDP endpoint for metric packets. Empty disables the metric reporter
    /// until the head node pushes an endpoint via the Metric command.
    #[serde(default)]
    pub metric_uri: String,
    /// Source of the cluster-wide hosts file. Unset disables the hosts
    /// manager.
    #[serde(default)]
    pub hosts_file_uri: Option<String>,
    /// Seconds between hosts-file fetches. Unset uses the default; values
    /// below the enforced minimum are clamped by the hosts manager.
    #[serde(default)]
    pub hosts_fetch_interval_secs: Option<u64>,
    /// Pool of naming-service base URIs used to resolve service locations.
    #[serde(default)]
    pub naming_service_uris: Vec<Url>,
    #[serde(default = "AgentConfig::default_register_interval_secs")]
    pub register_interval_secs: u64,
    #[serde(default = "AgentConfig::default_node_info_report_interval_secs")]
    pub node_info_report_interval_secs: u64,
    #[serde(default = "AgentConfig::default_metric_report_interval_secs")]
    pub metric_report_interval_secs: u64,
    /// Initial backoff interval for naming-service lookups; doubles per
    /// failure up to the 300 s clamp.
    #[serde(default = "AgentConfig::default_naming_backoff_initial_secs")]
    pub naming_backoff_initial_secs: u64,
    /// Cluster network this node registers on.
    #[serde(default)]
    pub network_name: String,
    /// Enables extra diagnostics (undead-process listings on grace expiry).
    #[serde(default)]
    pub debug: bool,
}

impl AgentConfig {
    fn default_register_interval_secs() -> u64 {
        300
    }

    fn default_node_info_report_interval_secs() -> u64 {
        30
    }

    fn default_metric_report_interval_secs() -> u64 {
        1
    }

    fn default_naming_backoff_initial_secs() -> u64 {
        1
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval_secs)
    }

    pub fn node_info_report_interval(&self) -> Duration {
        Duration::from_secs(self.node_info_report_interval_secs)
    }

    pub fn metric_report_interval(&self) -> Duration {
        Duration::from_secs(self.metric_report_interval_secs)
    }

    pub fn naming_backoff_initial(&self) -> Duration {
        Duration::from_secs(self.naming_backoff_initial_secs)
    }
}

/// Shared handle to the agent configuration with write-through persistence.
///
/// Ping and Metric commands rewrite the heartbeat and metric endpoints at
/// runtime; the updated configuration must survive an agent restart, so those
/// setters persist before returning.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    inner: RwLock<AgentConfig>,
}

impl ConfigStore {
    /// Loads the configuration from a YAML file; updates are written back to
    /// the same path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let config = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        Ok(Self {
            path: Some(path.to_owned()),
            inner: RwLock::new(config),
        })
    }

    /// Wraps an in-memory configuration with no backing file.
    pub fn detached(config: AgentConfig) -> Self {
        Self {
            path: None,
            inner: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> AgentConfig {
        self.inner.read().unwrap().clone()
    }

    pub fn heartbeat_uri(&self) -> String {
        self.inner.read().unwrap().heartbeat_uri.clone()
    }

    pub fn metric_uri(&self) -> String {
        self.inner.read().unwrap().metric_uri.clone()
    }

    pub fn registration_uri(&self) -> String {
        self.inner.read().unwrap().registration_uri.clone()
    }

    pub fn debug(&self) -> bool {
        self.inner.read().unwrap().debug
    }

    pub fn save_heartbeat_uri(&self, uri: &str) -> Result<(), Error> {
        self.update(|config| config.heartbeat_uri = uri.to_string())
    }

    pub fn save_metric_uri(&self, uri: &str) -> Result<(), Error> {
        self.update(|config| config.metric_uri = uri.to_string())
    }

    fn update(&self, mutate: impl FnOnce(&mut AgentConfig)) -> Result<(), Error> {
        let encoded = {
            let mut config = self.inner.write().unwrap();
            mutate(&mut config);
            serde_yaml::to_string(&*config)?
        };
        if let Some(path) = &self.path {
            fs::write(path, encoded)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> AgentConfig {
        AgentConfig {
            registration_uri: "{SchedulerNode}/api/cn-01/registerrequested".into(),
            heartbeat_uri: "{SchedulerNode}/api/cn-01/computenodereported".into(),
            metric_uri: String::new(),
            hosts_file_uri: None,
            hosts_fetch_interval_secs: None,
            naming_service_uris: Vec::from([Url::parse(
                "https://head.cluster:40300/api/fabric/resolve/singleton/",
            )
            .unwrap()]),
            register_interval_secs: 300,
            node_info_report_interval_secs: 30,
            metric_report_interval_secs: 1,
            naming_backoff_initial_secs: 1,
            network_name: "Enterprise".into(),
            debug: false,
        }
    }

    #[test]
    fn roundtrip_agent_config() {
        let config = minimal_config();
        let encoded = serde_yaml::to_string(&config).unwrap();
        let decoded: AgentConfig = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn defaults_are_applied() {
        let decoded: AgentConfig = serde_yaml::from_str(
            r#"---
registration_uri: "https://head/api/register"
heartbeat_uri: "https://head/api/heartbeat"
"#,
        )
        .unwrap();
        assert_eq!(decoded.register_interval(), Duration::from_secs(300));
        assert_eq!(
            decoded.node_info_report_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(decoded.metric_report_interval(), Duration::from_secs(1));
        assert_eq!(decoded.hosts_file_uri, None);
        assert!(!decoded.debug);
    }

    #[test]
    fn store_persists_uri_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodemanager.yaml");
        fs::write(&path, serde_yaml::to_string(&minimal_config()).unwrap()).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        store
            .save_heartbeat_uri("https://head2/api/cn-01/computenodereported")
            .unwrap();
        assert_eq!(
            store.heartbeat_uri(),
            "https://head2/api/cn-01/computenodereported"
        );

        // A fresh load sees the persisted update.
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(
            reloaded.heartbeat_uri(),
            "https://head2/api/cn-01/computenodereported"
        );
    }
}
