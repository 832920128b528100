use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::topology::{ClusterAddress, ClusterTopology};

/// Environment variable holding the node configuration as JSON.
pub const CONFIG_ENV: &str = "S3_CLUSTER_CONFIG";

/// Node configuration parsed from the `S3_CLUSTER_CONFIG` env var.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    pub listen_port: u16,
    /// Extra host names that refer to this machine (besides loopback and
    /// `listen_host`).
    #[serde(default)]
    pub local_hosts: Vec<String>,
    pub clusters: HashMap<String, ClusterConfig>,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default = "default_fan_out_connect_timeout_ms")]
    pub fan_out_connect_timeout_ms: u64,
    #[serde(default = "default_s3_max_connections")]
    pub s3_max_connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub secret: String,
    pub replicas: Vec<ReplicaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Task pull channel settings. A pull that never returns fails the query
/// after these timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pull_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pull_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_pull_timeout_ms")]
    pub receive_timeout_ms: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout_ms: default_pull_timeout_ms(),
            send_timeout_ms: default_pull_timeout_ms(),
            receive_timeout_ms: default_pull_timeout_ms(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

fn default_pool_size() -> usize {
    3
}

fn default_pull_timeout_ms() -> u64 {
    1_000
}

fn default_fan_out_connect_timeout_ms() -> u64 {
    10_000
}

fn default_s3_max_connections() -> u64 {
    1024
}

/// Runtime settings derived from [`NodeConfig`], shared by every query a node
/// runs.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub pull_pool_size: usize,
    pub pull_connect_timeout: Duration,
    pub pull_send_timeout: Duration,
    pub pull_receive_timeout: Duration,
    pub fan_out_connect_timeout: Duration,
    pub s3_max_connections: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        PullConfig::default().settings(
            default_fan_out_connect_timeout_ms(),
            default_s3_max_connections(),
        )
    }
}

impl PullConfig {
    fn settings(&self, fan_out_connect_timeout_ms: u64, s3_max_connections: u64) -> ScanSettings {
        ScanSettings {
            pull_pool_size: self.pool_size,
            pull_connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            pull_send_timeout: Duration::from_millis(self.send_timeout_ms),
            pull_receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            fan_out_connect_timeout: Duration::from_millis(fan_out_connect_timeout_ms),
            s3_max_connections,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let raw = env::var(CONFIG_ENV).map_err(|_| {
            ClusterError::Config(format!("{CONFIG_ENV} environment variable is not set"))
        })?;

        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json).map_err(|e| {
            let msg = format!("Failed to parse {CONFIG_ENV} JSON: {e}");
            crate::cluster_error!("config", "{msg}");
            ClusterError::Config(msg)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.trim().is_empty() {
            return Err(ClusterError::Config("listen_host must be non-empty".to_string()));
        }
        if self.pull.pool_size == 0 {
            return Err(ClusterError::Config("pull.pool_size must be at least 1".to_string()));
        }
        for (field, value) in [
            ("pull.connect_timeout_ms", self.pull.connect_timeout_ms),
            ("pull.send_timeout_ms", self.pull.send_timeout_ms),
            ("pull.receive_timeout_ms", self.pull.receive_timeout_ms),
            ("fan_out_connect_timeout_ms", self.fan_out_connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ClusterError::Config(format!("{field} must be greater than 0")));
            }
        }

        for (name, cluster) in &self.clusters {
            if name.trim().is_empty() {
                return Err(ClusterError::Config("cluster names must be non-empty".to_string()));
            }
            if cluster.replicas.is_empty() {
                return Err(ClusterError::Config(format!(
                    "cluster '{name}' has no replicas"
                )));
            }

            let mut seen: HashSet<(String, u16)> = HashSet::new();
            for replica in &cluster.replicas {
                if replica.host.trim().is_empty() {
                    return Err(ClusterError::Config(format!(
                        "cluster '{name}': replica host must be non-empty"
                    )));
                }
                if !seen.insert((replica.host.clone(), replica.port)) {
                    return Err(ClusterError::Config(format!(
                        "cluster '{name}': replica {}:{} is a duplicate",
                        replica.host, replica.port
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn settings(&self) -> ScanSettings {
        self.pull
            .settings(self.fan_out_connect_timeout_ms, self.s3_max_connections)
    }

    fn is_local_host(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        host == "localhost"
            || host == "::1"
            || host.starts_with("127.")
            || host == self.listen_host.to_lowercase()
            || self.local_hosts.iter().any(|h| h.to_lowercase() == host)
    }

    /// Build the immutable topology snapshot handed to every query.
    pub fn topology(&self) -> ClusterTopology {
        let mut topology = ClusterTopology::new();
        for (name, cluster) in &self.clusters {
            let addresses = cluster
                .replicas
                .iter()
                .map(|r| {
                    ClusterAddress::new(
                        &r.host,
                        r.port,
                        &r.user,
                        &r.password,
                        name,
                        &cluster.secret,
                        self.is_local_host(&r.host),
                    )
                })
                .collect();
            topology.insert(name, addresses);
        }
        topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "listen_host": "10.0.0.1",
            "listen_port": 9100,
            "local_hosts": ["node-a.internal"],
            "clusters": {
                "lake": {
                    "secret": "s3cr3t",
                    "replicas": [
                        { "host": "10.0.0.1", "port": 9100 },
                        { "host": "10.0.0.2", "port": 9100, "user": "scan", "password": "pw" },
                        { "host": "node-a.internal", "port": 9101 }
                    ]
                }
            }
        }"#
    }

    #[test]
    fn parse_valid_config() {
        let cfg = NodeConfig::from_json(sample_json()).unwrap();
        assert_eq!(cfg.listen_port, 9100);
        assert_eq!(cfg.pull.pool_size, 3);
        assert_eq!(cfg.pull.connect_timeout_ms, 1_000);
        assert_eq!(cfg.s3_max_connections, 1024);

        let lake = &cfg.clusters["lake"];
        assert_eq!(lake.secret, "s3cr3t");
        assert_eq!(lake.replicas[0].user, "default");
        assert_eq!(lake.replicas[1].user, "scan");
    }

    #[test]
    fn topology_marks_local_addresses() {
        let cfg = NodeConfig::from_json(sample_json()).unwrap();
        let topology = cfg.topology();
        let lake = topology.cluster("lake").unwrap();
        let local: Vec<bool> = lake.iter().map(|a| a.is_local()).collect();
        assert_eq!(local, vec![true, false, true]);
        assert!(lake.iter().all(|a| a.cluster() == "lake" && a.cluster_secret() == "s3cr3t"));
    }

    #[test]
    fn settings_use_configured_timeouts() {
        let json = r#"{
            "listen_port": 9000,
            "clusters": {},
            "pull": { "pool_size": 5, "send_timeout_ms": 250 }
        }"#;
        let settings = NodeConfig::from_json(json).unwrap().settings();
        assert_eq!(settings.pull_pool_size, 5);
        assert_eq!(settings.pull_send_timeout, Duration::from_millis(250));
        assert_eq!(settings.pull_receive_timeout, Duration::from_secs(1));
        assert_eq!(settings.fan_out_connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn empty_cluster_rejected() {
        let json = r#"{ "listen_port": 9000, "clusters": { "c": { "replicas": [] } } }"#;
        let err = NodeConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("no replicas"), "error was: {err}");
    }

    #[test]
    fn duplicate_replica_rejected() {
        let json = r#"{
            "listen_port": 9000,
            "clusters": { "c": { "replicas": [
                { "host": "h", "port": 1 },
                { "host": "h", "port": 1 }
            ] } }
        }"#;
        let err = NodeConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "error was: {err}");
    }

    #[test]
    fn zero_pool_size_rejected() {
        let json = r#"{ "listen_port": 9000, "clusters": {}, "pull": { "pool_size": 0 } }"#;
        let err = NodeConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("pool_size"), "error was: {err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let json = r#"{ "listen_port": 9000, "clusters": {}, "pull": { "receive_timeout_ms": 0 } }"#;
        let err = NodeConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("receive_timeout_ms"), "error was: {err}");
    }

    #[test]
    fn malformed_json_returns_err() {
        let result = NodeConfig::from_json("{ not valid json }}}");
        assert!(matches!(result, Err(ClusterError::Config(_))));
    }

    #[test]
    fn from_env_reads_config() {
        env::set_var(CONFIG_ENV, r#"{ "listen_port": 9400, "clusters": {} }"#);
        let cfg = NodeConfig::from_env().unwrap();
        assert_eq!(cfg.listen_port, 9400);
        env::remove_var(CONFIG_ENV);
    }
}
