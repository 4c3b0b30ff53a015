//! Node configuration, loaded from TOML or JSON.

use std::fs;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ReplError, Result};
use crate::instance::LocalInstance;
use crate::sender::RetryConfig;
use crate::topology::{Direction, InstanceRule, ReplicationConfig, ReplicationLevel};

/// Identity of this node as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Opaque id. When absent a random one is generated, and kept in
    /// `data_dir` if one is set.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Public base uri peers use to reach us.
    pub uri: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "wikimesh".to_string(),
            uri: "http://localhost:8080".to_string(),
        }
    }
}

/// Everything a replication node needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// Local identity.
    pub identity: IdentityConfig,
    /// Directory for the JSON tables. None keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Worker tasks draining the receive queue.
    pub receive_workers: usize,
    /// Capacity of the receive queue.
    pub receive_queue_capacity: usize,
    /// Timeout of one outbound HTTP request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Sign outbound messages and require signatures on inbound ones.
    pub sign_messages: bool,
    /// Redelivery backoff.
    pub retry: RetryConfig,
    /// Rule applied when no entity up to `global` has a configuration.
    pub default_rule: InstanceRule,
    /// Instances to send a registration request to at startup.
    pub peers: Vec<String>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            identity: IdentityConfig::default(),
            data_dir: None,
            receive_workers: 4,
            receive_queue_capacity: 1024,
            request_timeout_ms: 10_000,
            sign_messages: true,
            retry: RetryConfig::default(),
            default_rule: InstanceRule::new(ReplicationLevel::Full, Direction::Both),
            peers: Vec::new(),
        }
    }
}

impl ReplConfig {
    /// Load from `path`; the format follows the extension (`toml` or `json`).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ReplError::Config {
                msg: msg.to_string(),
            })
        };
        if self.identity.uri.trim().is_empty() {
            return invalid("identity.uri must not be empty");
        }
        if self.receive_workers == 0 {
            return invalid("receive_workers must be at least 1");
        }
        if self.receive_queue_capacity == 0 {
            return invalid("receive_queue_capacity must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1.0");
        }
        if self.peers.iter().any(|p| *p == self.identity.uri) {
            return invalid("peers must not contain our own uri");
        }
        Ok(())
    }

    /// Local identity. Without a configured id, the one stored in `data_dir`
    /// is reused, so peers holding our registration still recognise us.
    pub fn local_instance(&self) -> Result<LocalInstance> {
        let id = match (&self.identity.id, &self.data_dir) {
            (Some(id), _) => id.clone(),
            (None, Some(dir)) => stored_instance_id(dir)?,
            (None, None) => Uuid::new_v4().to_string(),
        };
        Ok(LocalInstance::new(id, &self.identity.name, &self.identity.uri))
    }

    /// Outbound request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fallback topology above `global`.
    pub fn fallback_topology(&self) -> ReplicationConfig {
        ReplicationConfig::all(self.default_rule)
    }
}

/// File under `data_dir` holding the generated instance id.
pub const INSTANCE_ID_FILE: &str = "instance_id";

fn stored_instance_id(dir: &Path) -> Result<String> {
    let path = dir.join(INSTANCE_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {
            return Err(ReplError::Config {
                msg: format!("{} is empty", path.display()),
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    fs::create_dir_all(dir)?;
    let id = Uuid::new_v4().to_string();
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(id.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    info!(id = %id, path = %path.display(), "generated instance id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ReplConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.receive_workers, 4);
        assert!(config.sign_messages);
        assert!(config.data_dir.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.fallback_topology().rule_for("http://any").level, ReplicationLevel::Full);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "127.0.0.1:9100"
data_dir = "/var/lib/wikimesh"
peers = ["http://b:9100"]

[identity]
id = "node-a"
name = "alpha"
uri = "http://a:9100"

[retry]
initial_backoff_ms = 50
max_attempts = 5

[default_rule]
level = "reference"
direction = "send_only"
            "#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9100)));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/wikimesh")));
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert_eq!(config.retry.max_attempts, Some(5));
        assert_eq!(config.retry.max_backoff_ms, 10_000);
        assert_eq!(
            config.default_rule,
            InstanceRule::new(ReplicationLevel::Reference, Direction::SendOnly)
        );
        let local = config.local_instance().unwrap();
        assert_eq!(local.id, "node-a");
        assert_eq!(local.uri, "http://a:9100");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "identity": {{ "name": "beta", "uri": "http://b" }},
                "receive_workers": 2,
                "sign_messages": false
            }}"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.receive_workers, 2);
        assert!(!config.sign_messages);
        assert_eq!(config.identity.name, "beta");
        assert_eq!(config.local_instance().unwrap().id.len(), 36);
    }

    #[test]
    fn test_generated_id_kept_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ReplConfig::default();
        config.data_dir = Some(dir.path().join("state"));

        let first = config.local_instance().unwrap();
        let second = config.local_instance().unwrap();
        assert_eq!(first.id.len(), 36);
        assert_eq!(first.id, second.id);
        let stored = std::fs::read_to_string(dir.path().join("state").join(INSTANCE_ID_FILE)).unwrap();
        assert_eq!(stored, first.id);

        config.identity.id = Some("pinned".to_string());
        assert_eq!(config.local_instance().unwrap().id, "pinned");
    }

    #[test]
    fn test_empty_id_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTANCE_ID_FILE), "\n").unwrap();
        let mut config = ReplConfig::default();
        config.data_dir = Some(dir.path().to_path_buf());
        assert!(matches!(config.local_instance(), Err(ReplError::Config { .. })));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ReplConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = ReplConfig::default();
        config.receive_workers = 0;
        assert!(matches!(config.validate(), Err(ReplError::Config { .. })));

        let mut config = ReplConfig::default();
        config.peers = vec![config.identity.uri.clone()];
        assert!(config.validate().is_err());

        let mut config = ReplConfig::default();
        config.identity.uri = " ".to_string();
        assert!(config.validate().is_err());
    }
}
