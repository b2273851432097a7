//! The per-chain event processor.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tabledger_core::config::EventProcessorConfig;
use tabledger_core::feed::BlockFeed;
use tabledger_core::types::BlockEvents;
use tabledger_core::{Error, Result};

use tabledger_storage::{hash, registry, BlockScope, Executor, SqliteDb};

/// Lifecycle states of a processor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    /// Sleeping before retrying a failed block
    Backoff,
    Stopped,
}

/// Observer handle for a spawned processor
pub struct ProcessorHandle {
    chain_id: u64,
    cursor: watch::Receiver<Option<u64>>,
    state: watch::Receiver<ProcessorState>,
    join: JoinHandle<Result<()>>,
}

impl ProcessorHandle {
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Latest committed block observed by this processor
    pub fn cursor(&self) -> Option<u64> {
        *self.cursor.borrow()
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// A watch receiver that observers can clone and await on
    pub fn cursor_watch(&self) -> watch::Receiver<Option<u64>> {
        self.cursor.clone()
    }

    /// Wait for the task to finish after cancellation
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::logic(format!("processor task panicked: {e}")))?
    }
}

/// Long-running write loop for one chain.
///
/// The unit of work is a single block: if the process crashes mid-block the
/// outer transaction rolls back on restart and the block is re-attempted,
/// so no partial effects ever survive.
pub struct EventProcessor {
    chain_id: u64,
    feed: Box<dyn BlockFeed>,
    executor: Arc<Executor>,
    db: SqliteDb,
    config: EventProcessorConfig,
    cancel: CancellationToken,
    cursor_tx: watch::Sender<Option<u64>>,
    state_tx: watch::Sender<ProcessorState>,
}

impl EventProcessor {
    /// Spawn the run loop and return its observer handle
    pub fn spawn(
        chain_id: u64,
        feed: Box<dyn BlockFeed>,
        executor: Arc<Executor>,
        db: SqliteDb,
        config: EventProcessorConfig,
        cancel: CancellationToken,
    ) -> ProcessorHandle {
        let (cursor_tx, cursor_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ProcessorState::Idle);

        let processor = Self {
            chain_id,
            feed,
            executor,
            db,
            config,
            cancel,
            cursor_tx,
            state_tx,
        };

        ProcessorHandle {
            chain_id,
            cursor: cursor_rx,
            state: state_rx,
            join: tokio::spawn(processor.run()),
        }
    }

    /// The run loop: pull the next block, execute it, commit, publish.
    async fn run(mut self) -> Result<()> {
        let initial = registry::cursor(self.db.reader(), self.chain_id).await?;
        self.cursor_tx.send_replace(initial);
        self.state_tx.send_replace(ProcessorState::Running);
        info!(chain_id = self.chain_id, cursor = ?initial, "event processor started");

        let result = self.drive().await;

        let _ = self.feed.close().await;
        self.state_tx.send_replace(ProcessorState::Stopped);
        match &result {
            Ok(()) => info!(chain_id = self.chain_id, "event processor stopped"),
            Err(e) => error!(chain_id = self.chain_id, error = %e, "event processor failed"),
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.feed.next_block() => result,
            };

            let block = match result {
                Ok(block) => block,
                // The feed retries RPC failures itself; what surfaces here
                // is local (raw event persistence), so back off and ask for
                // the same block again.
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "feed failed, backing off");
                    if self.backoff().await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if self.process_block(&block).await? {
                return Ok(());
            }
        }
    }

    /// Sleep the failure backoff; returns `true` when cancelled.
    async fn backoff(&self) -> bool {
        self.state_tx.send_replace(ProcessorState::Backoff);
        let cancelled = tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.block_failed_execution_backoff()) => false,
        };
        self.state_tx.send_replace(ProcessorState::Running);
        cancelled
    }

    /// Execute one block, retrying on infrastructure failures. Returns
    /// `true` when cancelled during backoff.
    async fn process_block(&mut self, block: &BlockEvents) -> Result<bool> {
        loop {
            match self.execute_block(block).await {
                Ok(()) => {
                    // The in-memory cursor moves strictly after the commit;
                    // observers never see it ahead of durable state.
                    self.cursor_tx.send_replace(Some(block.block_number));

                    if block.block_number % self.config.hash_calculation_step == 0 {
                        self.record_state_hash(block.block_number).await;
                    }
                    return Ok(false);
                }
                Err(e @ Error::OutOfOrder { .. }) => {
                    // Retrying cannot help and skipping would fork state;
                    // stop and require operator intervention.
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        chain_id = self.chain_id,
                        block = block.block_number,
                        error = %e,
                        "block execution failed, backing off"
                    );
                    if self.backoff().await {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Open a scope, run every transaction, commit. Any failure closes the
    /// scope so no partial block state survives.
    async fn execute_block(&self, block: &BlockEvents) -> Result<()> {
        let mut scope = self
            .executor
            .open_block_scope(self.chain_id, block.block_number, block.timestamp)
            .await?;

        match self.apply_txns(&mut scope, block).await {
            Ok(()) => self.executor.commit(scope).await,
            Err(e) => {
                if let Err(close_err) = self.executor.close(scope).await {
                    warn!(chain_id = self.chain_id, error = %close_err, "scope close failed");
                }
                Err(e)
            }
        }
    }

    async fn apply_txns(&self, scope: &mut BlockScope, block: &BlockEvents) -> Result<()> {
        for txn in &block.txns {
            if self.config.dedup_executed_txns
                && self.executor.txn_receipt_exists(scope, &txn.txn_hash).await?
            {
                info!(
                    chain_id = self.chain_id,
                    txn = %txn.txn_hash,
                    "skipping transaction that already has a receipt"
                );
                continue;
            }
            self.executor.execute_txn_events(scope, txn).await?;
        }
        Ok(())
    }

    /// Best-effort audit hash; failure to hash never stalls the pipeline.
    async fn record_state_hash(&self, block_number: u64) {
        match hash::state_hash(self.db.reader(), self.chain_id).await {
            Ok(state_hash) => {
                info!(chain_id = self.chain_id, block = block_number, state_hash, "state hash");
            }
            Err(e) => {
                warn!(chain_id = self.chain_id, error = %e, "state hash computation failed");
            }
        }
    }
}
