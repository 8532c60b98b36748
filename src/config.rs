//! Node configuration: a single TOML file loaded into `NodeConfig`.
//!
//! The cluster token itself is consumed opaquely here — verification is
//! performed by an injected `TokenVerifier`, never by this module.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub fn load(path: &Path) -> Result<NodeConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: NodeConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub node: NodeIdentity,

    pub storage: StorageConfig,

    pub replication: ReplicationConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl NodeConfig {
    /// Aggregates every validation failure instead of stopping at the
    /// first, so a misconfigured node reports everything wrong with it
    /// in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.node.node_id.trim().is_empty() {
            problems.push("node.node_id must not be empty".to_string());
        }
        if self.node.cluster_token.trim().is_empty() {
            problems.push("node.cluster_token must not be empty".to_string());
        }
        if self.storage.pool.trim().is_empty() {
            problems.push("storage.pool must not be empty".to_string());
        }
        if self.replication.listen_address.port() == 0 {
            problems.push("replication.listen_address must specify a nonzero port".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(problems.join("; ")))
        }
    }
}

/// This node's stable identity within the cluster.
#[derive(Debug, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub cluster_token: String,
}

/// ZFS pool/dataset layout and the jail filesystem root.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub pool: String,

    #[serde(default = "default_jails_root")]
    pub jails_root: PathBuf,
}

fn default_jails_root() -> PathBuf {
    PathBuf::from("/var/sylve/jails")
}

/// QUIC listener and certificate paths for the replication transport.
#[derive(Debug, Deserialize)]
pub struct ReplicationConfig {
    pub listen_address: SocketAddr,

    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,

    #[serde(default = "default_scheduler_tick_seconds")]
    pub scheduler_tick_seconds: u64,
}

fn default_scheduler_tick_seconds() -> u64 {
    30
}

fn default_host_command_capacity() -> f64 {
    3.0
}

fn default_host_command_refill_rate() -> f64 {
    1.0
}

/// Token-bucket limits for host-command-issuing lifecycle actions
/// (jail/VM start, stop, snapshot, rollback).
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_host_command_capacity")]
    pub host_command_capacity: f64,

    #[serde(default = "default_host_command_refill_rate")]
    pub host_command_refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            host_command_capacity: default_host_command_capacity(),
            host_command_refill_rate: default_host_command_refill_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[node]
node_id = "node-a"
cluster_token = "s3cr3t"

[storage]
pool = "zroot"

[replication]
listen_address = "0.0.0.0:4433"
cert_pem = "/etc/sylve/node.pem"
key_pem = "/etc/sylve/node.key"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: NodeConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.storage.jails_root, PathBuf::from("/var/sylve/jails"));
        assert_eq!(config.replication.scheduler_tick_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_node_id() {
        let toml = minimal_toml().replace("node-a", "");
        let config: NodeConfig = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let toml = minimal_toml().replace("0.0.0.0:4433", "0.0.0.0:0");
        let config: NodeConfig = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn aggregates_multiple_problems() {
        let toml = minimal_toml().replace("node-a", "").replace("zroot", "");
        let config: NodeConfig = toml::from_str(&toml).unwrap();
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("node_id"));
        assert!(message.contains("storage.pool"));
    }
}
