//! Block source adapters.
//!
//! A [`BlockSource`] is anything that can deliver `(block, logs)` ranges for
//! a chain: a polling JSON-RPC node (with endpoint failover), an
//! archival-query service, or a validated push stream. Sources that already
//! guarantee canonical-chain finality report `provides_validated_data()`,
//! which lets the syncer skip its trailing reorg window.

pub mod archival;
pub mod backoff;
pub mod rpc;
pub mod stream;
pub mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use kyomei_common::error::{KyomeiError, Result};

/// Address filter pushed down into log fetches. Empty means unfiltered.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Lowercase 20-byte hex addresses.
    pub addresses: Vec<String>,
}

impl LogFilter {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    pub fn matches(&self, address: &str) -> bool {
        self.addresses.is_empty() || self.addresses.iter().any(|a| a == address)
    }
}

/// One log as delivered by a source, positionally ordered within its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
}

/// A block together with the logs that matched the fetch filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWithLogs {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    pub logs: Vec<SourceLog>,
}

/// A fully covered inclusive range. `blocks` lists only blocks that carried
/// matching logs; the range itself asserts there are no silent gaps.
#[derive(Debug, Clone)]
pub struct BlockPage {
    pub from: u64,
    pub to: u64,
    pub blocks: Vec<BlockWithLogs>,
}

impl BlockPage {
    /// A source handing back blocks outside the requested range, or logs out
    /// of `(tx_index, log_index)` order, has violated the protocol. Gaps
    /// detected here are fatal, not retried.
    pub fn validate(&self) -> Result<()> {
        let mut last_block = None;
        for block in &self.blocks {
            if block.number < self.from || block.number > self.to {
                return Err(KyomeiError::SourceFatal(format!(
                    "block {} outside requested range [{}, {}]",
                    block.number, self.from, self.to
                )));
            }
            if let Some(last) = last_block
                && block.number <= last
            {
                return Err(KyomeiError::SourceFatal(format!(
                    "blocks out of order: {} after {last}",
                    block.number
                )));
            }
            last_block = Some(block.number);

            let mut last_pos = None;
            for log in &block.logs {
                let pos = (log.tx_index, log.log_index);
                if let Some(last) = last_pos
                    && pos <= last
                {
                    return Err(KyomeiError::SourceFatal(format!(
                        "logs out of order in block {}",
                        block.number
                    )));
                }
                last_pos = Some(pos);
            }
        }
        Ok(())
    }
}

/// Live-tip subscription. The producer task is aborted when the handle is
/// dropped or cancelled.
pub struct BlockSubscription {
    rx: mpsc::Receiver<BlockWithLogs>,
    task: tokio::task::JoinHandle<()>,
}

impl BlockSubscription {
    pub fn new(rx: mpsc::Receiver<BlockWithLogs>, task: tokio::task::JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next delivered block, or `None` once the producer has stopped.
    pub async fn recv(&mut self) -> Option<BlockWithLogs> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Unified interface over RPC, archival-query, and validated-stream
/// providers.
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Whether delivered history is already canonical-chain final. When
    /// false the caller must re-check the trailing finality window.
    fn provides_validated_data(&self) -> bool;

    async fn latest_block_number(&self) -> Result<u64>;

    async fn finalized_block_number(&self) -> Result<u64>;

    /// Fetch `[from, to]` inclusive, filtered. Implementations must return a
    /// page passing [`BlockPage::validate`].
    async fn get_blocks(&self, from: u64, to: u64, filter: &LogFilter) -> Result<BlockPage>;

    async fn subscribe_blocks(&self) -> Result<BlockSubscription>;

    async fn healthy(&self) -> bool;

    async fn close(&self);
}

/// Rate-limit signals drive the syncer's adaptive page sizing.
pub fn is_rate_limited(err: &KyomeiError) -> bool {
    match err {
        KyomeiError::SourceTransient(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("429") || msg.contains("rate limit") || msg.contains("too many requests")
        }
        _ => false,
    }
}
