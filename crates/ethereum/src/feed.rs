//! The per-chain event feed.
//!
//! Polls the chain for newly finalized blocks, fetches registry logs one
//! block at a time, decodes them into typed events and yields them to the
//! processor strictly in block order. The feed is pull-driven: a block is
//! fetched only when the processor asks for it.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Log};
use tracing::{debug, warn};

use tabledger_core::config::EventFeedConfig;
use tabledger_core::feed::{BlockFeed, RawEventSink};
use tabledger_core::types::{BlockEvents, DecodedEvent, TxnEvents};
use tabledger_core::Result;

use crate::event::EventDecoder;
use crate::provider::{BlockHeader, EvmProvider};

/// Pull-driven feed of finalized blocks for one chain
pub struct EvmEventFeed {
    provider: EvmProvider,
    decoder: EventDecoder,
    chain_id: u64,
    contract: Address,
    config: EventFeedConfig,

    /// Sink for raw decoded logs, written before delivery when enabled
    sink: Option<Arc<dyn RawEventSink>>,

    /// Next block to yield
    next_block: u64,

    /// Highest block considered final, `head - min_block_depth`; `None`
    /// until the head has been polled or while the chain is shorter than
    /// the finality depth
    safe_head: Option<u64>,
}

impl EvmEventFeed {
    /// Create a feed that starts yielding at `from_height`
    pub fn new(
        provider: EvmProvider,
        chain_id: u64,
        contract: Address,
        config: EventFeedConfig,
        from_height: u64,
        sink: Option<Arc<dyn RawEventSink>>,
    ) -> Self {
        Self {
            provider,
            decoder: EventDecoder::new(),
            chain_id,
            contract,
            config,
            sink,
            next_block: from_height,
            safe_head: None,
        }
    }

    /// Refresh the cached safe head from the chain
    async fn refresh_safe_head(&mut self) -> Result<()> {
        let head = self.provider.block_number().await?;
        self.safe_head = head.checked_sub(self.config.min_block_depth);
        Ok(())
    }

    fn next_is_final(&self) -> bool {
        self.safe_head.is_some_and(|safe| self.next_block <= safe)
    }

    /// Fetch and decode one block's registry logs
    async fn fetch_block(&self, number: u64) -> Result<BlockEvents> {
        let logs = self.provider.logs(number, number, self.contract).await?;
        let header = self.provider.header(number).await?;

        let mut decoded = Vec::new();
        for log in &logs {
            if log.removed == Some(true) {
                warn!(block = number, "skipping removed log below finality depth");
                continue;
            }
            if let Some(event) = self.decoder.decode(log)? {
                decoded.push((log_position(log), event));
            }
        }

        Ok(group_block_events(self.chain_id, &header, decoded))
    }
}

/// Position of a log within its block, for ordering and grouping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPosition {
    pub txn_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
}

fn log_position(log: &Log) -> LogPosition {
    LogPosition {
        txn_hash: log
            .transaction_hash
            .map(|h| format!("{h:#x}"))
            .unwrap_or_default(),
        tx_index: log.transaction_index.map(|i| i.as_u64()).unwrap_or_default(),
        log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
    }
}

/// Group decoded logs into per-transaction batches ordered by
/// `(tx_index, log_index)`.
pub fn group_block_events(
    chain_id: u64,
    header: &BlockHeader,
    mut decoded: Vec<(LogPosition, tabledger_core::types::TableEvent)>,
) -> BlockEvents {
    decoded.sort_by_key(|(pos, _)| (pos.tx_index, pos.log_index));

    let mut txns: Vec<TxnEvents> = Vec::new();
    for (pos, event) in decoded {
        match txns.last_mut() {
            Some(txn) if txn.txn_hash == pos.txn_hash => {
                txn.events.push(DecodedEvent { log_index: pos.log_index, event });
            }
            _ => txns.push(TxnEvents {
                txn_hash: pos.txn_hash,
                tx_index: pos.tx_index,
                events: vec![DecodedEvent { log_index: pos.log_index, event }],
            }),
        }
    }

    BlockEvents {
        chain_id,
        block_number: header.number,
        block_hash: header.hash.clone(),
        timestamp: header.timestamp,
        txns,
    }
}

#[async_trait]
impl BlockFeed for EvmEventFeed {
    async fn next_block(&mut self) -> Result<BlockEvents> {
        // Wait until the next block is final.
        while !self.next_is_final() {
            match self.refresh_safe_head().await {
                Ok(()) if self.next_is_final() => break,
                Ok(()) => {
                    tokio::time::sleep(self.config.new_block_poll_freq()).await;
                }
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "head poll failed");
                    tokio::time::sleep(self.config.chain_api_backoff()).await;
                }
            }
        }

        // Fetch the block, retrying on RPC failure; a block is never skipped.
        loop {
            match self.fetch_block(self.next_block).await {
                Ok(events) => {
                    if self.config.persist_events {
                        if let Some(sink) = &self.sink {
                            sink.persist_block_events(&events).await?;
                        }
                    }
                    debug!(
                        chain_id = self.chain_id,
                        block = events.block_number,
                        txns = events.txns.len(),
                        "yielding block"
                    );
                    self.next_block += 1;
                    return Ok(events);
                }
                Err(e) => {
                    warn!(
                        chain_id = self.chain_id,
                        block = self.next_block,
                        error = %e,
                        "block fetch failed, backing off"
                    );
                    tokio::time::sleep(self.config.chain_api_backoff()).await;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabledger_core::types::TableEvent;

    fn header() -> BlockHeader {
        BlockHeader { number: 10, hash: "0xabc".to_string(), timestamp: 1_700_000_000 }
    }

    fn run_sql(table_id: u64) -> TableEvent {
        TableEvent::RunSql {
            caller: "0x01".to_string(),
            is_owner: true,
            table_id,
            statement: "delete from t".to_string(),
        }
    }

    fn pos(txn: &str, tx_index: u64, log_index: u64) -> LogPosition {
        LogPosition { txn_hash: txn.to_string(), tx_index, log_index }
    }

    #[test]
    fn groups_and_orders_by_tx_then_log_index() {
        let decoded = vec![
            (pos("0xbbb", 2, 7), run_sql(2)),
            (pos("0xaaa", 1, 4), run_sql(1)),
            (pos("0xbbb", 2, 5), run_sql(3)),
            (pos("0xaaa", 1, 3), run_sql(4)),
        ];

        let block = group_block_events(1337, &header(), decoded);
        assert_eq!(block.block_number, 10);
        assert_eq!(block.txns.len(), 2);

        assert_eq!(block.txns[0].txn_hash, "0xaaa");
        assert_eq!(
            block.txns[0].events.iter().map(|e| e.log_index).collect::<Vec<_>>(),
            vec![3, 4]
        );

        assert_eq!(block.txns[1].txn_hash, "0xbbb");
        assert_eq!(
            block.txns[1].events.iter().map(|e| e.log_index).collect::<Vec<_>>(),
            vec![5, 7]
        );
    }

    #[test]
    fn empty_block_keeps_header_fields() {
        let block = group_block_events(1337, &header(), Vec::new());
        assert!(block.txns.is_empty());
        assert_eq!(block.block_hash, "0xabc");
        assert_eq!(block.timestamp, 1_700_000_000);
    }
}
