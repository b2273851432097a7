//! Trait seams between the chain-facing feed and the event processor.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BlockEvents;

/// A strictly ordered, pull-driven source of per-block event batches.
///
/// `next_block` yields blocks with consecutive ascending numbers; within a
/// block, transactions are ordered by transaction index and events by log
/// index. The feed never skips a block and never yields a block above the
/// configured finality depth. Blocks are produced only when asked for, so
/// there is no queue between the feed and its consumer.
#[async_trait]
pub trait BlockFeed: Send + Sync {
    /// Wait for and return the next block's events.
    ///
    /// Blocks with no relevant events are still yielded (with an empty
    /// transaction list) so the consumer can advance its cursor.
    async fn next_block(&mut self) -> Result<BlockEvents>;

    /// Release any resources held by the feed
    async fn close(&mut self) -> Result<()>;
}

/// Sink for raw decoded logs, written before delivery to the processor.
///
/// Persistence is idempotent on `(chain_id, tx_hash, log_index)`.
#[async_trait]
pub trait RawEventSink: Send + Sync {
    async fn persist_block_events(&self, events: &BlockEvents) -> Result<()>;
}
