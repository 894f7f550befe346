//! Gateway configuration.
//!
//! Configuration is a single JSON document describing the items the store
//! is built from and the settings of the netfix server, peer replication and
//! the quorum elector. Where the document comes from is abstracted by
//! [`ConfigSource`] so the loading logic can be shared between the file-based
//! Linux binary and in-memory test setups.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{DataType, ItemDefinition};

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration document was not found.
    NotFound(String),
    /// Failed to read the configuration document.
    ReadError(String),
    /// The document could not be parsed.
    ParseError(String),
    /// The document parsed but describes an invalid setup.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(path) => write!(f, "Configuration not found: {}", path),
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Somewhere a gateway configuration can be loaded from.
pub trait ConfigSource: Send + Sync {
    /// Load and validate the configuration.
    fn load(&self) -> Result<GatewayConfig, ConfigError>;
}

/// Loads configuration from a JSON file on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<GatewayConfig, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(self.path.display().to_string())
            } else {
                ConfigError::ReadError(format!("{}: {}", self.path.display(), e))
            }
        })?;
        GatewayConfig::from_json_str(&text)
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Top level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Item definitions the store is built from.
    #[serde(default)]
    pub items: Vec<ItemDefinition>,

    #[serde(default)]
    pub netfix: NetfixSettings,

    /// Peer replication; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationSettings>,

    /// Quorum election; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<QuorumSettings>,

    /// Staleness sweep period in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<u64>,

    /// How long shutdown waits for tasks to finish, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<u64>,
}

/// Netfix server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetfixSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum size of a single `@l` list message.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for NetfixSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3490".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

/// Peer replication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSettings {
    /// Peer netfix servers as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Keys this node owns and pushes to every peer.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Drain loop period in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    /// Period at which every owned key is re-sent, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_min: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max: Option<u64>,
}

impl ReplicationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.unwrap_or(200))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval.unwrap_or(1000))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout.unwrap_or(1000))
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min.unwrap_or(500))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max.unwrap_or(10_000))
    }
}

/// Quorum elector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// This node's id, `1..=total_nodes`.
    pub nodeid: u32,

    pub total_nodes: u32,

    /// Election period in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    /// How long `LEADER` is held true at startup, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_grace: Option<u64>,

    /// Time-to-live of generated `QVOTE` items, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_tol: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl QuorumSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.unwrap_or(300))
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace.unwrap_or(2000))
    }

    pub fn vote_tol(&self) -> u64 {
        self.vote_tol.unwrap_or(2000)
    }
}

/// Key of the vote item for a node.
pub fn vote_key(nodeid: u32) -> String {
    format!("QVOTE{nodeid}")
}

/// Key of the published leader flag.
pub const LEADER_KEY: &str = "LEADER";

impl GatewayConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval.unwrap_or(1000))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace.unwrap_or(3000))
    }

    /// Check the configuration for problems serde cannot catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.key.is_empty() || item.key.contains(['.', ';', '\n']) {
                return Err(ConfigError::InvalidData(format!(
                    "invalid item key '{}'",
                    item.key
                )));
            }
            if !seen.insert(item.key.as_str()) {
                return Err(ConfigError::InvalidData(format!(
                    "duplicate item key '{}'",
                    item.key
                )));
            }
            if let (Some(min), Some(max)) = (item.min, item.max) {
                if min > max {
                    return Err(ConfigError::InvalidData(format!(
                        "item '{}' has min {} greater than max {}",
                        item.key, min, max
                    )));
                }
            }
        }

        if let Some(quorum) = &self.quorum {
            if quorum.total_nodes == 0 {
                return Err(ConfigError::InvalidData(
                    "quorum totalNodes must be at least 1".to_string(),
                ));
            }
            if quorum.nodeid == 0 || quorum.nodeid > quorum.total_nodes {
                return Err(ConfigError::InvalidData(format!(
                    "quorum nodeid {} outside 1..={}",
                    quorum.nodeid, quorum.total_nodes
                )));
            }
        }

        if let Some(replication) = &self.replication {
            for key in &replication.outputs {
                if !seen.contains(key.as_str()) && !self.is_generated_key(key) {
                    return Err(ConfigError::InvalidData(format!(
                        "replication output '{}' is not a defined item",
                        key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Item definitions including the quorum items generated when the
    /// elector is enabled and the configuration does not define them.
    pub fn item_definitions(&self) -> Vec<ItemDefinition> {
        let mut items = self.items.clone();
        if let Some(quorum) = self.quorum.as_ref().filter(|q| q.enabled) {
            for nodeid in 1..=quorum.total_nodes {
                let key = vote_key(nodeid);
                if !items.iter().any(|i| i.key == key) {
                    items.push(
                        ItemDefinition::new(key, DataType::Int)
                            .with_description(format!("Quorum vote of node {nodeid}"))
                            .with_tol(quorum.vote_tol()),
                    );
                }
            }
            if !items.iter().any(|i| i.key == LEADER_KEY) {
                items.push(
                    ItemDefinition::new(LEADER_KEY, DataType::Bool)
                        .with_description("This node is the cluster leader"),
                );
            }
        }
        items
    }

    fn is_generated_key(&self, key: &str) -> bool {
        match self.quorum.as_ref().filter(|q| q.enabled) {
            Some(quorum) => (1..=quorum.total_nodes).any(|n| vote_key(n) == key),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// In-memory source for testing.
    struct MemorySource {
        text: String,
    }

    impl ConfigSource for MemorySource {
        fn load(&self) -> Result<GatewayConfig, ConfigError> {
            GatewayConfig::from_json_str(&self.text)
        }
    }

    const SAMPLE: &str = r#"{
        "items": [
            {"key": "ALT", "type": "float", "min": -1000, "max": 60000, "units": "ft", "tol": 2000},
            {"key": "TAILNUM", "type": "str", "initial": "N12345"}
        ],
        "netfix": {"bindAddr": "127.0.0.1:3490", "bufferSize": 512},
        "replication": {"peers": ["10.0.0.2:3490"], "outputs": ["ALT", "QVOTE1"]},
        "quorum": {"nodeid": 1, "totalNodes": 3}
    }"#;

    #[test]
    fn test_load_sample() {
        let source = MemorySource {
            text: SAMPLE.to_string(),
        };
        let config = source.load().unwrap();

        assert_eq!(config.items.len(), 2);
        assert_eq!(config.netfix.buffer_size, 512);
        let replication = config.replication.as_ref().unwrap();
        assert_eq!(replication.interval(), Duration::from_millis(200));
        assert_eq!(replication.reconnect_max(), Duration::from_secs(10));
        let quorum = config.quorum.as_ref().unwrap();
        assert!(quorum.enabled);
        assert_eq!(quorum.interval(), Duration::from_millis(300));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_json_str("{}").unwrap();
        assert_eq!(config.netfix.bind_addr, "0.0.0.0:3490");
        assert_eq!(config.netfix.buffer_size, 1024);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert!(config.replication.is_none());
    }

    #[test]
    fn test_generated_quorum_items() {
        let config = GatewayConfig::from_json_str(SAMPLE).unwrap();
        let keys: Vec<String> = config
            .item_definitions()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(
            keys,
            vec!["ALT", "TAILNUM", "QVOTE1", "QVOTE2", "QVOTE3", "LEADER"]
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let text = r#"{"items": [
            {"key": "ALT", "type": "float"},
            {"key": "ALT", "type": "int"}
        ]}"#;
        let err = GatewayConfig::from_json_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidData(_)));
    }

    #[test]
    fn test_bad_nodeid_rejected() {
        let text = r#"{"quorum": {"nodeid": 4, "totalNodes": 3}}"#;
        let err = GatewayConfig::from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_unknown_output_rejected() {
        let text = r#"{"items": [], "replication": {"outputs": ["NOPE"]}}"#;
        assert!(GatewayConfig::from_json_str(text).is_err());
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        let text = r#"{"items": [{"key": "X", "type": "complex"}]}"#;
        let err = GatewayConfig::from_json_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_missing_file() {
        let source = JsonFileSource::new("/nonexistent/fixgw.json");
        assert!(matches!(source.load(), Err(ConfigError::NotFound(_))));
    }
}
