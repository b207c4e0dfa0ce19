//! Node configuration, loaded from a YAML file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use arbor_sync::keys::{AccountKeys, Author, EncryptionKey};

use crate::nodeconf::NodeInfo;

/// The account this node runs as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub peer_id: String,
    /// Hex-encoded ed25519 signing key.
    #[serde(default)]
    pub signing_key: String,
    /// Hex-encoded x25519 encryption key.
    #[serde(default)]
    pub encryption_key: String,
}

impl AccountConfig {
    /// Decodes the configured key material.
    pub fn account_keys(&self) -> Result<AccountKeys> {
        let signing: [u8; 32] = hex::decode(&self.signing_key)
            .context("account.signing_key is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("account.signing_key must be 32 bytes"))?;
        let encryption: [u8; 32] = hex::decode(&self.encryption_key)
            .context("account.encryption_key is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("account.encryption_key must be 32 bytes"))?;
        Ok(AccountKeys {
            signing: Author::from_bytes(&signing),
            encryption: EncryptionKey::from_bytes(encryption),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotSyncConfig {
    pub simultaneous_requests: usize,
}

impl Default for HotSyncConfig {
    fn default() -> Self {
        HotSyncConfig {
            simultaneous_requests: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Seconds an idle space stays cached.
    pub gc_ttl: u64,
    pub hot_sync: HotSyncConfig,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            gc_ttl: 60,
            hot_sync: HotSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root path of the on-disk driver; empty runs in memory.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address of the debug/metrics HTTP server.
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            listen_addr: "127.0.0.1:8271".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter; `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub nodes: Vec<NodeInfo>,
    /// How many nodes replicate each space.
    pub replication: usize,
    pub space: SpaceConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            account: AccountConfig::default(),
            nodes: Vec::new(),
            replication: 3,
            space: SpaceConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("can't parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_a_minimal_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
account:
  peer_id: node-0
nodes:
  - peer_id: node-0
    addresses: ["127.0.0.1:4430"]
  - peer_id: node-1
space:
  gc_ttl: 10
  hot_sync:
    simultaneous_requests: 5
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.account.peer_id, "node-0");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].addresses.len(), 0);
        assert_eq!(config.space.gc_ttl, 10);
        assert_eq!(config.space.hot_sync.simultaneous_requests, 5);
        // untouched sections fall back to defaults
        assert_eq!(config.replication, 3);
        assert_eq!(config.api.listen_addr, "127.0.0.1:8271");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_file("/definitely/not/here.yml").is_err());
    }

    #[test]
    fn account_keys_roundtrip() {
        let mut rng = rand::thread_rng();
        let keys = AccountKeys::generate(&mut rng);
        let config = AccountConfig {
            peer_id: "node-0".into(),
            signing_key: hex::encode(keys.signing.to_bytes()),
            encryption_key: hex::encode(keys.encryption.to_bytes()),
        };
        let decoded = config.account_keys().unwrap();
        assert_eq!(decoded.identity(), keys.identity());

        let broken = AccountConfig {
            signing_key: "zz".into(),
            ..config
        };
        assert!(broken.account_keys().is_err());
    }
}
