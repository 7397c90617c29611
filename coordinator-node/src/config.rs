use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use policy_common::{LoggingConfig, NatsTransportConfig, PeerId, PolicyError, Result};

use crate::authority::AuthorityOptions;

/// Main configuration for a coordinator node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub node: NodeConfig,
    /// HTTP API
    pub api: ApiConfig,
    pub gossip: GossipConfig,
    /// Network query behavior
    pub query: QueryConfig,
    /// Relay of directives issued by other coordinators
    pub relay: RelayConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Gossip identity, e.g. "C1"
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// "nats" or "memory"
    pub transport: String,
    pub nats: NatsTransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Collection window of one query (milliseconds)
    pub window_ms: u64,
    /// Responses buffered per query
    pub response_buffer: usize,
    /// Finish early once this many stores answered
    pub expected_responders: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Directive ids remembered to relay each directive once
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            api: ApiConfig::default(),
            gossip: GossipConfig::default(),
            query: QueryConfig::default(),
            relay: RelayConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::with_level("coordinator_node=info"),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "coordinator".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3030)),
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            transport: "nats".to_string(),
            nats: NatsTransportConfig::default(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            window_ms: 2000,
            response_buffer: 256,
            expected_responders: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: 4096,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9091)),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from file, with `COORDINATOR_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("COORDINATOR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: CoordinatorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| PolicyError::Config(format!("failed to serialize configuration: {}", e)))?;
        std::fs::write(path, toml_string)
            .map_err(|e| PolicyError::Config(format!("failed to write {}: {}", path, e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.peer_id().validate()?;

        if !matches!(self.gossip.transport.as_str(), "nats" | "memory") {
            return Err(PolicyError::Config(format!(
                "unknown gossip transport '{}'",
                self.gossip.transport
            )));
        }

        if self.query.window_ms == 0 {
            return Err(PolicyError::Config("query window cannot be 0".to_string()));
        }

        if self.query.response_buffer == 0 {
            return Err(PolicyError::Config("query response buffer cannot be 0".to_string()));
        }

        if self.query.expected_responders == Some(0) {
            return Err(PolicyError::Config("expected responders cannot be 0".to_string()));
        }

        if self.relay.enabled && self.relay.cache_size == 0 {
            return Err(PolicyError::Config("relay cache size cannot be 0".to_string()));
        }

        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.node.name.clone())
    }

    pub fn authority_options(&self) -> AuthorityOptions {
        AuthorityOptions {
            query_window: Duration::from_millis(self.query.window_ms),
            response_buffer: self.query.response_buffer,
            expected_responders: self.query.expected_responders,
            relay_directives: self.relay.enabled,
            relay_cache_size: self.relay.cache_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.authority_options().query_window, Duration::from_secs(2));
    }

    #[test]
    fn test_validation_rejects_zero_bounds() {
        let mut config = CoordinatorConfig::default();
        config.query.window_ms = 0;
        assert!(matches!(config.validate(), Err(PolicyError::Config(_))));

        let mut config = CoordinatorConfig::default();
        config.query.expected_responders = Some(0);
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.gossip.transport = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[node]
name = "C1"

[gossip]
transport = "memory"

[query]
window_ms = 250
expected_responders = 3

[relay]
enabled = false
"#
        )
        .unwrap();

        let config = CoordinatorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        let options = config.authority_options();
        assert_eq!(config.peer_id(), PeerId::new("C1"));
        assert_eq!(options.query_window, Duration::from_millis(250));
        assert_eq!(options.expected_responders, Some(3));
        assert!(!options.relay_directives);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");
        let path = path.to_str().unwrap();

        let mut config = CoordinatorConfig::default();
        config.node.name = "C9".to_string();
        config.query.expected_responders = Some(4);
        config.save_to_file(path).unwrap();

        let loaded = CoordinatorConfig::from_file(path).unwrap();
        assert_eq!(loaded.peer_id(), PeerId::new("C9"));
        assert_eq!(loaded.query.expected_responders, Some(4));
    }
}
