//! An in-memory block source for tests: seed blocks, advance the tip,
//! redeliver a block with a different hash to exercise reorg repair.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use kyomei_common::error::Result;

use crate::{BlockPage, BlockSource, BlockSubscription, BlockWithLogs, LogFilter, SourceLog};

#[derive(Default)]
struct MemoryChain {
    blocks: BTreeMap<u64, BlockWithLogs>,
    latest: u64,
}

/// Deterministic scripted source.
#[derive(Clone)]
pub struct MemorySource {
    chain_id: u64,
    validated: bool,
    finality_depth: u64,
    inner: Arc<Mutex<MemoryChain>>,
}

impl MemorySource {
    pub fn new(chain_id: u64, validated: bool) -> Self {
        Self {
            chain_id,
            validated,
            finality_depth: 0,
            inner: Arc::new(Mutex::new(MemoryChain::default())),
        }
    }

    pub fn with_finality(mut self, depth: u64) -> Self {
        self.finality_depth = depth;
        self
    }

    /// Insert or replace a block and advance the tip to cover it.
    pub fn seed_block(&self, block: BlockWithLogs) {
        let mut chain = self.inner.lock().unwrap();
        chain.latest = chain.latest.max(block.number);
        chain.blocks.insert(block.number, block);
    }

    pub fn set_latest(&self, latest: u64) {
        self.inner.lock().unwrap().latest = latest;
    }

    pub fn block(&self, number: u64) -> Option<BlockWithLogs> {
        self.inner.lock().unwrap().blocks.get(&number).cloned()
    }
}

/// Build a block whose hash encodes `number` and `fork` so reorgs are easy
/// to script.
pub fn make_block(number: u64, fork: u64, logs: Vec<SourceLog>) -> BlockWithLogs {
    BlockWithLogs {
        number,
        hash: format!("0x{:062x}{fork:02x}", number),
        parent_hash: format!("0x{:062x}{fork:02x}", number.saturating_sub(1)),
        timestamp: Utc.timestamp_opt(1_700_000_000 + number as i64 * 12, 0).unwrap(),
        logs,
    }
}

pub fn make_log(address: &str, topic0: &str, tx_index: u32, log_index: u32) -> SourceLog {
    SourceLog {
        address: address.to_string(),
        topics: vec![topic0.to_string()],
        data: "0x".to_string(),
        tx_hash: format!("0x{:064x}", (tx_index as u64) << 16 | log_index as u64),
        tx_index,
        log_index,
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn provides_validated_data(&self) -> bool {
        self.validated
    }

    async fn latest_block_number(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().latest)
    }

    async fn finalized_block_number(&self) -> Result<u64> {
        let latest = self.inner.lock().unwrap().latest;
        if self.validated {
            Ok(latest)
        } else {
            Ok(latest.saturating_sub(self.finality_depth))
        }
    }

    async fn get_blocks(&self, from: u64, to: u64, filter: &LogFilter) -> Result<BlockPage> {
        let chain = self.inner.lock().unwrap();
        let blocks = chain
            .blocks
            .range(from..=to)
            .filter_map(|(_, block)| {
                let logs: Vec<SourceLog> = block
                    .logs
                    .iter()
                    .filter(|l| filter.matches(&l.address))
                    .cloned()
                    .collect();
                if logs.is_empty() {
                    None
                } else {
                    Some(BlockWithLogs {
                        logs,
                        ..block.clone()
                    })
                }
            })
            .collect();

        let page = BlockPage { from, to, blocks };
        page.validate()?;
        Ok(page)
    }

    async fn subscribe_blocks(&self) -> Result<BlockSubscription> {
        let inner = Arc::clone(&self.inner);
        let start = inner.lock().unwrap().latest;
        let (tx, rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            let mut next = start + 1;
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;

                let block = {
                    let chain = inner.lock().unwrap();
                    if next > chain.latest {
                        None
                    } else {
                        Some(chain.blocks.get(&next).cloned())
                    }
                };

                match block {
                    None => continue,
                    Some(found) => {
                        if let Some(found) = found
                            && tx.send(found).await.is_err()
                        {
                            return;
                        }
                        next += 1;
                    }
                }
            }
        });

        Ok(BlockSubscription::new(rx, task))
    }

    async fn healthy(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_range_respects_filter() {
        let source = MemorySource::new(1, true);
        source.seed_block(make_block(
            100,
            0,
            vec![
                make_log("0xaa", "0x01", 0, 0),
                make_log("0xbb", "0x01", 0, 1),
            ],
        ));
        source.seed_block(make_block(101, 0, vec![make_log("0xbb", "0x01", 0, 0)]));

        let page = source
            .get_blocks(100, 101, &LogFilter::new(vec!["0xaa".into()]))
            .await
            .unwrap();
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].number, 100);
        assert_eq!(page.blocks[0].logs.len(), 1);

        assert_eq!(source.latest_block_number().await.unwrap(), 101);
    }

    #[tokio::test]
    async fn subscription_delivers_new_blocks() {
        let source = MemorySource::new(1, true);
        source.seed_block(make_block(10, 0, vec![make_log("0xaa", "0x01", 0, 0)]));

        let mut sub = source.subscribe_blocks().await.unwrap();
        source.seed_block(make_block(11, 0, vec![make_log("0xaa", "0x01", 0, 0)]));
        source.seed_block(make_block(12, 0, vec![make_log("0xaa", "0x01", 0, 0)]));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.number, 11);
        assert_eq!(second.number, 12);
    }

    #[tokio::test]
    async fn finality_depth_applies_to_unvalidated() {
        let source = MemorySource::new(1, false).with_finality(10);
        source.set_latest(205);
        assert_eq!(source.finalized_block_number().await.unwrap(), 195);
    }
}
