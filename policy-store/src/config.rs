use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use policy_common::{
    DataUser, LoggingConfig, NatsTransportConfig, Node, PeerId, PolicyContent, PolicyError, Result,
};

use crate::permissions::PermissionTable;
use crate::storage_node::{HttpStorageNode, MemoryStorageNode, StorageDirectory};
use crate::store::StoreOptions;

/// Main configuration for a policy store node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Identity and local membership
    pub node: NodeConfig,
    /// HTTP control API
    pub api: ApiConfig,
    /// Gossip transport
    pub gossip: GossipConfig,
    /// Storage nodes and commit behavior
    pub storage: StorageConfig,
    /// Datasets registered at startup
    pub datasets: Vec<DatasetConfig>,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Identity of this store and the principals it serves
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gossip identity, e.g. "P1"
    pub name: String,
    /// Data users served by this store
    pub data_users: Vec<String>,
    /// Track subjects first learned through gossip
    pub track_gossiped_subjects: bool,
    /// Policy content installed for newly registered datasets
    pub default_policy: String,
}

/// HTTP control API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

/// Gossip transport selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// "nats" or "memory" (single-process development mode)
    pub transport: String,
    pub nats: NatsTransportConfig,
    /// Capacity of the distribution queue
    pub distribution_queue: usize,
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Upper bound on one policy commit (seconds)
    pub store_timeout_seconds: u64,
    /// Storage nodes managed by this store
    pub nodes: Vec<StorageNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNodeConfig {
    pub id: String,
    /// Base URL of the node's HTTP API; in-process node when absent
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    /// Node of record
    pub node: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            api: ApiConfig::default(),
            gossip: GossipConfig::default(),
            storage: StorageConfig::default(),
            datasets: Vec::new(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::with_level("policy_store=info"),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "policy-store".to_string(),
            data_users: Vec::new(),
            track_gossiped_subjects: true,
            default_policy: "false".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            transport: "nats".to_string(),
            nats: NatsTransportConfig::default(),
            distribution_queue: 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_timeout_seconds: 30,
            nodes: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9191)),
        }
    }
}

impl StoreConfig {
    /// Load configuration from file, with `POLICY_STORE_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("POLICY_STORE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: StoreConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| PolicyError::Config(format!("failed to serialize configuration: {}", e)))?;
        std::fs::write(path, toml_string)
            .map_err(|e| PolicyError::Config(format!("failed to write {}: {}", path, e)))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.peer_id().validate()?;

        if !matches!(self.gossip.transport.as_str(), "nats" | "memory") {
            return Err(PolicyError::Config(format!(
                "unknown gossip transport '{}'",
                self.gossip.transport
            )));
        }

        if self.gossip.distribution_queue == 0 {
            return Err(PolicyError::Config("distribution queue cannot be 0".to_string()));
        }

        if self.storage.store_timeout_seconds == 0 {
            return Err(PolicyError::Config("store timeout cannot be 0".to_string()));
        }

        for dataset in &self.datasets {
            if dataset.id.trim().is_empty() {
                return Err(PolicyError::Config("dataset identifier cannot be empty".to_string()));
            }
            if !self.storage.nodes.iter().any(|node| node.id == dataset.node) {
                return Err(PolicyError::Config(format!(
                    "dataset '{}' refers to unknown storage node '{}'",
                    dataset.id, dataset.node
                )));
            }
        }

        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.node.name.clone())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            store_timeout: Duration::from_secs(self.storage.store_timeout_seconds),
            distribution_queue: self.gossip.distribution_queue,
            track_gossiped_subjects: self.node.track_gossiped_subjects,
            default_content: PolicyContent::new(self.node.default_policy.clone()),
        }
    }

    /// Build the storage node clients named in the configuration
    pub fn storage_directory(&self) -> Result<StorageDirectory> {
        let directory = StorageDirectory::new();
        let request_timeout = Duration::from_secs(self.storage.store_timeout_seconds);
        for node in &self.storage.nodes {
            match &node.url {
                Some(url) => {
                    info!(node = %node.id, url = %url, "Using HTTP storage node");
                    directory.insert(Arc::new(HttpStorageNode::new(
                        Node::new(node.id.clone()),
                        url.clone(),
                        request_timeout,
                    )?));
                }
                None => {
                    info!(node = %node.id, "Using in-process storage node");
                    directory.insert(Arc::new(MemoryStorageNode::new(node.id.clone())));
                }
            }
        }
        Ok(directory)
    }

    pub fn permission_table(&self) -> PermissionTable {
        PermissionTable::new(
            self.storage.nodes.iter().map(|node| Node::new(node.id.clone())),
            self.node.data_users.iter().map(|user| DataUser::new(user.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_options().default_content, PolicyContent::deny());
    }

    #[test]
    fn test_dataset_must_reference_known_node() {
        let mut config = StoreConfig::default();
        config.datasets.push(DatasetConfig {
            id: "d1".to_string(),
            node: "N1".to_string(),
        });
        assert!(matches!(config.validate(), Err(PolicyError::Config(_))));

        config.storage.nodes.push(StorageNodeConfig {
            id: "N1".to_string(),
            url: None,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_peer_name_rejected() {
        let mut config = StoreConfig::default();
        config.node.name = "store.one".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[node]
name = "P1"
data_users = ["alice", "bob"]

[gossip]
transport = "memory"

[storage]
store_timeout_seconds = 5

[[storage.nodes]]
id = "N1"

[[datasets]]
id = "d1"
node = "N1"
"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.peer_id(), PeerId::new("P1"));
        assert_eq!(config.node.data_users.len(), 2);
        assert_eq!(config.store_options().store_timeout, Duration::from_secs(5));
        assert_eq!(config.storage_directory().unwrap().len(), 1);
        assert_eq!(config.permission_table().local_users().len(), 2);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        let path = path.to_str().unwrap();

        let mut config = StoreConfig::default();
        config.node.name = "P7".to_string();
        config.save_to_file(path).unwrap();

        let loaded = StoreConfig::from_file(path).unwrap();
        assert_eq!(loaded.node.name, "P7");
    }
}
