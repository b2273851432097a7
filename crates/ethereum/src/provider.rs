use std::sync::Arc;

use ethers::middleware::Middleware;
use ethers::providers::{Http, Provider, Ws};
use ethers::types::{Address, BlockId, Filter, Log, H256, U64};

use tabledger_core::{Error, Result};

/// Configuration for the EVM provider
#[derive(Debug, Clone)]
pub struct EvmProviderConfig {
    /// RPC URL; a `ws://`/`wss://` scheme selects the WebSocket transport
    pub rpc_url: String,
}

/// Parse a 0x-prefixed contract address
pub fn parse_address(raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .map_err(|e| Error::validation(format!("invalid contract address '{raw}': {e}")))
}

/// Minimal block header data the feed needs
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
}

/// EVM provider transports
#[derive(Debug, Clone)]
pub enum EvmProvider {
    /// HTTP provider
    Http(Arc<Provider<Http>>),

    /// WebSocket provider
    Websocket(Arc<Provider<Ws>>),
}

impl EvmProvider {
    /// Create a new EVM provider from its configuration
    pub async fn new(config: EvmProviderConfig) -> Result<Self> {
        if config.rpc_url.starts_with("ws://") || config.rpc_url.starts_with("wss://") {
            let ws_provider = Provider::<Ws>::connect(&config.rpc_url).await.map_err(|e| {
                Error::chain(format!("failed to connect via WebSocket: {e}"))
            })?;
            Ok(Self::Websocket(Arc::new(ws_provider)))
        } else {
            let http_provider = Provider::<Http>::try_from(config.rpc_url.as_str())
                .map_err(|e| Error::chain(format!("failed to create HTTP provider: {e}")))?;
            Ok(Self::Http(Arc::new(http_provider)))
        }
    }

    /// Get the current chain head number
    pub async fn block_number(&self) -> Result<u64> {
        let number: U64 = match self {
            EvmProvider::Http(provider) => provider
                .get_block_number()
                .await
                .map_err(|e| Error::chain(format!("failed to get block number: {e}")))?,
            EvmProvider::Websocket(provider) => provider
                .get_block_number()
                .await
                .map_err(|e| Error::chain(format!("failed to get block number: {e}")))?,
        };
        Ok(number.as_u64())
    }

    /// Get contract logs in an inclusive block range
    pub async fn logs(&self, from: u64, to: u64, address: Address) -> Result<Vec<Log>> {
        let filter = Filter::new().from_block(from).to_block(to).address(address);
        match self {
            EvmProvider::Http(provider) => provider
                .get_logs(&filter)
                .await
                .map_err(|e| Error::chain(format!("failed to get logs [{from}, {to}]: {e}"))),
            EvmProvider::Websocket(provider) => provider
                .get_logs(&filter)
                .await
                .map_err(|e| Error::chain(format!("failed to get logs [{from}, {to}]: {e}"))),
        }
    }

    /// Get the header of block `number`
    pub async fn header(&self, number: u64) -> Result<BlockHeader> {
        let block = match self {
            EvmProvider::Http(provider) => provider
                .get_block(BlockId::Number(number.into()))
                .await
                .map_err(|e| Error::chain(format!("failed to get block {number}: {e}")))?,
            EvmProvider::Websocket(provider) => provider
                .get_block(BlockId::Number(number.into()))
                .await
                .map_err(|e| Error::chain(format!("failed to get block {number}: {e}")))?,
        };
        let block =
            block.ok_or_else(|| Error::chain(format!("block {number} not found")))?;

        Ok(BlockHeader {
            number,
            hash: block
                .hash
                .map(|h: H256| format!("{h:#x}"))
                .unwrap_or_default(),
            timestamp: block.timestamp.as_u64(),
        })
    }
}
