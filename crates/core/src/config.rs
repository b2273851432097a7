//! Configuration for the validator node
//!
//! Loaded from a TOML file at startup and threaded down by value; no
//! component reads configuration from the environment or global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Chains this node validates
    pub chains: Vec<ChainConfig>,

    /// Local database settings
    #[serde(default)]
    pub db: DbConfig,

    /// Read gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Statement size caps; the parser is one shared instance, so these are
    /// node-wide rather than per chain
    #[serde(default)]
    pub query_constraints: QueryConstraints,
}

/// Per-chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Numeric EVM chain id
    pub chain_id: u64,

    /// Registry contract binding
    pub registry: RegistryConfig,

    /// First block to process when no cursor exists yet
    #[serde(default)]
    pub start_block: u64,

    #[serde(default)]
    pub event_feed: EventFeedConfig,

    #[serde(default)]
    pub event_processor: EventProcessorConfig,

    #[serde(default)]
    pub table_constraints: TableConstraints,
}

/// Chain binding for the registry contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// RPC endpoint of an EVM node
    pub eth_endpoint: String,

    /// Address of the deployed registry contract
    pub contract_address: String,
}

/// Event feed tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFeedConfig {
    /// Sleep after a failed chain RPC call, in milliseconds
    pub chain_api_backoff_ms: u64,

    /// Finality depth: blocks closer than this to the head are not processed
    pub min_block_depth: u64,

    /// How often to poll for a new chain head, in milliseconds
    pub new_block_poll_freq_ms: u64,

    /// Persist raw decoded logs for audit and replay
    pub persist_events: bool,
}

impl Default for EventFeedConfig {
    fn default() -> Self {
        Self {
            chain_api_backoff_ms: 15_000,
            min_block_depth: 5,
            new_block_poll_freq_ms: 10_000,
            persist_events: true,
        }
    }
}

impl EventFeedConfig {
    pub fn chain_api_backoff(&self) -> Duration {
        Duration::from_millis(self.chain_api_backoff_ms)
    }

    pub fn new_block_poll_freq(&self) -> Duration {
        Duration::from_millis(self.new_block_poll_freq_ms)
    }
}

/// Event processor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventProcessorConfig {
    /// Sleep before retrying a block whose execution failed, in milliseconds
    pub block_failed_execution_backoff_ms: u64,

    /// Skip transactions that already have a receipt
    pub dedup_executed_txns: bool,

    /// Compute and log a state hash every this many blocks
    pub hash_calculation_step: u64,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            block_failed_execution_backoff_ms: 10_000,
            dedup_executed_txns: false,
            hash_calculation_step: 100,
        }
    }
}

impl EventProcessorConfig {
    pub fn block_failed_execution_backoff(&self) -> Duration {
        Duration::from_millis(self.block_failed_execution_backoff_ms)
    }
}

/// Per-table constraints enforced by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConstraints {
    /// Maximum number of rows a user table may hold
    pub max_row_count: u64,
}

impl Default for TableConstraints {
    fn default() -> Self {
        Self { max_row_count: 500_000 }
    }
}

/// Statement size caps enforced by the parser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConstraints {
    /// Maximum read statement size in bytes
    pub max_read_query_size: usize,

    /// Maximum write statement size in bytes
    pub max_write_query_size: usize,
}

impl Default for QueryConstraints {
    fn default() -> Self {
        Self { max_read_query_size: 35_000, max_write_query_size: 35_000 }
    }
}

/// Local database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Path to the SQLite database file
    pub path: String,

    /// Size of the read connection pool; the write pool is always 1
    pub max_read_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { path: "database.db".to_string(), max_read_connections: 8 }
    }
}

/// Read gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Prefix used to build external URLs in table metadata
    pub external_url_prefix: String,

    /// Renderer URI for the metadata image field
    pub metadata_renderer_uri: Option<String>,

    /// Renderer URI for the metadata animation field
    pub animation_renderer_uri: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            external_url_prefix: "http://localhost:8080".to_string(),
            metadata_renderer_uri: None,
            animation_renderer_uri: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no chains configured")]
    NoChains,

    #[error("duplicate chain id {0}")]
    DuplicateChainId(u64),

    #[error("invalid eth endpoint for chain {chain_id}: '{url}'")]
    InvalidEthEndpoint { chain_id: u64, url: String },

    #[error("invalid contract address for chain {chain_id}: '{address}'")]
    InvalidContractAddress { chain_id: u64, address: String },

    #[error("hash_calculation_step must be greater than 0 (chain {0})")]
    InvalidHashStep(u64),

    #[error("max_row_count must be greater than 0 (chain {0})")]
    InvalidRowCap(u64),

    #[error("db path must not be empty")]
    EmptyDbPath,
}

impl ValidatorConfig {
    /// Load and validate a configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ValidatorConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::NoChains);
        }

        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::DuplicateChainId(chain.chain_id));
            }

            let url = &chain.registry.eth_endpoint;
            if !(url.starts_with("http://")
                || url.starts_with("https://")
                || url.starts_with("ws://")
                || url.starts_with("wss://"))
            {
                return Err(ConfigError::InvalidEthEndpoint {
                    chain_id: chain.chain_id,
                    url: url.clone(),
                });
            }

            let addr = &chain.registry.contract_address;
            let hex_part = addr.strip_prefix("0x").unwrap_or("");
            if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidContractAddress {
                    chain_id: chain.chain_id,
                    address: addr.clone(),
                });
            }

            if chain.event_processor.hash_calculation_step == 0 {
                return Err(ConfigError::InvalidHashStep(chain.chain_id));
            }
            if chain.table_constraints.max_row_count == 0 {
                return Err(ConfigError::InvalidRowCap(chain.chain_id));
            }
        }

        if self.db.path.is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }

        Ok(())
    }

    /// Look up the configuration for a chain
    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
