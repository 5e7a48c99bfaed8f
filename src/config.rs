use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the replication pair this node starts as. The role is
/// assigned externally; the core never decides it on its own. A follower
/// may be promoted once via `switch_to_leader`; a leader is never demoted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn parse(s: &str) -> Result<Role> {
        match s {
            "leader" | "master" => Ok(Role::Leader),
            "follower" | "slave" => Ok(Role::Follower),
            other => Err(Error::Config(format!("unknown role {:?}", other))),
        }
    }
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_async_timeout_ms() -> u64 {
    10_000
}

fn default_status_interval_ms() -> u64 {
    5000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The two-node address list. This node must be one of them; the peer
    /// is derived by elimination.
    pub nodes: Vec<String>,

    /// This node's own address (also the AppendLog listen address).
    pub listen: String,

    /// Initial role.
    pub role: Role,

    /// Directory holding the entry log and the applied checkpoint.
    pub data_dir: PathBuf,

    /// Replicator sleep after a transport failure before retrying.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long an async write waits for the replicator before its
    /// callback is fired by the timeout fallback.
    #[serde(default = "default_async_timeout_ms")]
    pub async_timeout_ms: u64,

    /// Period of the status line / applied checkpoint task.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    /// Read/write timeout on the replication RPC connection.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// When set, sync_data after every append. Off by default: durability
    /// beyond OS buffering is the caller's concern.
    #[serde(default)]
    pub fsync_on_append: bool,
}

impl NodeConfig {
    pub fn new(nodes: Vec<String>, listen: String, role: Role, data_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            nodes,
            listen,
            role,
            data_dir,
            retry_backoff_ms: default_retry_backoff_ms(),
            async_timeout_ms: default_async_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            fsync_on_append: false,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig =
            serde_json::from_str(&data).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The other node of the pair. Mis-configuration is an error, not a
    /// guess: this node's own address must appear in the list.
    pub fn peer(&self) -> Result<&str> {
        self.validate()?;
        let peer = self
            .nodes
            .iter()
            .find(|n| **n != self.listen)
            .expect("validate ensures a distinct peer");
        Ok(peer)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.len() != 2 {
            return Err(Error::BadNodeCount(self.nodes.len()));
        }
        if !self.nodes.iter().any(|n| *n == self.listen) {
            return Err(Error::NodeNotInList {
                own: self.listen.clone(),
                nodes: self.nodes.clone(),
            });
        }
        if self.nodes[0] == self.nodes[1] {
            return Err(Error::Config("node list addresses must differ".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
