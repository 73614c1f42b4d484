use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use kyomei_common::error::{KyomeiError, Result};

use crate::{BlockPage, BlockSource, BlockSubscription, BlockWithLogs, LogFilter, SourceLog};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling JSON-RPC source. An ordered endpoint list gives the proxied
/// variant: requests go to the active endpoint and rotate on failure.
///
/// Raw RPC does not validate history, so `finalized_block_number` is
/// `latest - finality_depth` and the syncer re-checks the trailing window.
pub struct RpcSource {
    chain_id: u64,
    providers: Vec<RootProvider>,
    active: AtomicUsize,
    finality_depth: u64,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl RpcSource {
    pub fn new(
        chain_id: u64,
        urls: &[String],
        poll_interval_ms: u64,
        finality_depth: u64,
    ) -> Result<Self> {
        if urls.is_empty() {
            return Err(KyomeiError::Config(
                "rpc source needs at least one endpoint".into(),
            ));
        }

        let mut providers = Vec::with_capacity(urls.len());
        for url in urls {
            let parsed = url
                .parse()
                .map_err(|e| KyomeiError::Config(format!("bad rpc url {url}: {e}")))?;
            providers.push(RootProvider::new_http(parsed));
        }

        Ok(Self {
            chain_id,
            providers,
            active: AtomicUsize::new(0),
            finality_depth,
            poll_interval: Duration::from_millis(poll_interval_ms),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `op` against each endpoint starting with the active one, rotating
    /// on failure. The last failure surfaces as a transient error.
    async fn with_failover<T, F>(&self, op: F) -> Result<T>
    where
        F: AsyncFn(&RootProvider) -> Result<T>,
    {
        let start = self.active.load(Ordering::Relaxed);
        let mut last_err = None;

        for offset in 0..self.providers.len() {
            let idx = (start + offset) % self.providers.len();
            match op(&self.providers[idx]).await {
                Ok(value) => {
                    self.active.store(idx, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    tracing::debug!(
                        chain_id = self.chain_id,
                        endpoint = idx,
                        error = %err,
                        "RPC endpoint failed, rotating"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| KyomeiError::SourceTransient("no endpoints".into())))
    }
}

fn transient(err: impl std::fmt::Display) -> KyomeiError {
    KyomeiError::SourceTransient(err.to_string())
}

fn block_timestamp(unix: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix as i64, 0).single().unwrap_or_else(Utc::now)
}

fn to_source_log(log: &alloy::rpc::types::Log) -> Option<SourceLog> {
    let tx_hash = log.transaction_hash?;
    let tx_index = log.transaction_index?;
    let log_index = log.log_index?;
    if log.topics().is_empty() {
        // Anonymous events carry no topic0 and cannot be matched to an ABI.
        return None;
    }

    Some(SourceLog {
        address: format!("{:#x}", log.address()),
        topics: log.topics().iter().map(|t| format!("{t:#x}")).collect(),
        data: format!("0x{}", alloy::hex::encode(log.inner.data.data.as_ref())),
        tx_hash: format!("{tx_hash:#x}"),
        tx_index: tx_index as u32,
        log_index: log_index as u32,
    })
}

/// Fetch one page from one provider: logs for the range, then headers for
/// the blocks that carried logs.
async fn fetch_page(
    provider: &RootProvider,
    from: u64,
    to: u64,
    filter: &LogFilter,
) -> Result<BlockPage> {
    let mut log_filter = Filter::new().from_block(from).to_block(to);
    if !filter.addresses.is_empty() {
        let addresses: Vec<Address> = filter
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        log_filter = log_filter.address(addresses);
    }

    let logs = provider.get_logs(&log_filter).await.map_err(transient)?;

    let mut by_block: BTreeMap<u64, Vec<SourceLog>> = BTreeMap::new();
    for log in &logs {
        let number = log
            .block_number
            .ok_or_else(|| KyomeiError::SourceFatal("log without block number".into()))?;
        if number < from || number > to {
            return Err(KyomeiError::SourceFatal(format!(
                "log for block {number} outside requested range [{from}, {to}]"
            )));
        }
        if let Some(source_log) = to_source_log(log) {
            by_block.entry(number).or_default().push(source_log);
        }
    }

    let mut blocks = Vec::with_capacity(by_block.len());
    for (number, mut block_logs) in by_block {
        let block = provider
            .get_block_by_number(number.into())
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                KyomeiError::SourceFatal(format!("block {number} missing from source"))
            })?;

        block_logs.sort_by_key(|l| (l.tx_index, l.log_index));
        blocks.push(BlockWithLogs {
            number,
            hash: format!("{:#x}", block.header.hash),
            parent_hash: format!("{:#x}", block.header.parent_hash),
            timestamp: block_timestamp(block.header.timestamp),
            logs: block_logs,
        });
    }

    let page = BlockPage { from, to, blocks };
    page.validate()?;
    Ok(page)
}

/// Fetch one fully formed live block (unfiltered; the live worker applies
/// the current address snapshot itself so factory expansion is never
/// racing the fetch).
async fn fetch_block(provider: &RootProvider, number: u64) -> Result<Option<BlockWithLogs>> {
    let Some(block) = provider
        .get_block_by_number(number.into())
        .await
        .map_err(transient)?
    else {
        return Ok(None);
    };

    let logs = provider
        .get_logs(&Filter::new().from_block(number).to_block(number))
        .await
        .map_err(transient)?;

    let mut block_logs: Vec<SourceLog> = logs.iter().filter_map(to_source_log).collect();
    block_logs.sort_by_key(|l| (l.tx_index, l.log_index));

    Ok(Some(BlockWithLogs {
        number,
        hash: format!("{:#x}", block.header.hash),
        parent_hash: format!("{:#x}", block.header.parent_hash),
        timestamp: block_timestamp(block.header.timestamp),
        logs: block_logs,
    }))
}

#[async_trait]
impl BlockSource for RpcSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn provides_validated_data(&self) -> bool {
        false
    }

    async fn latest_block_number(&self) -> Result<u64> {
        self.with_failover(async |p| p.get_block_number().await.map_err(transient))
            .await
    }

    async fn finalized_block_number(&self) -> Result<u64> {
        let latest = self.latest_block_number().await?;
        Ok(latest.saturating_sub(self.finality_depth))
    }

    async fn get_blocks(&self, from: u64, to: u64, filter: &LogFilter) -> Result<BlockPage> {
        if from > to {
            return Ok(BlockPage {
                from,
                to,
                blocks: Vec::new(),
            });
        }
        let filter = filter.clone();
        self.with_failover(async move |p| {
            tokio::time::timeout(FETCH_TIMEOUT, fetch_page(p, from, to, &filter))
                .await
                .map_err(|_| {
                    KyomeiError::SourceTransient(format!("range [{from}, {to}] fetch timed out"))
                })?
        })
        .await
    }

    async fn subscribe_blocks(&self) -> Result<BlockSubscription> {
        let provider = self.providers[self.active.load(Ordering::Relaxed)].clone();
        let poll_interval = self.poll_interval;
        let chain_id = self.chain_id;
        let (tx, rx) = mpsc::channel(64);

        let start = self.latest_block_number().await?;
        let task = tokio::spawn(async move {
            let mut next = start + 1;
            loop {
                tokio::time::sleep(poll_interval).await;

                let latest = match provider.get_block_number().await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(chain_id, error = %e, "Tip poll failed");
                        continue;
                    }
                };

                while next <= latest {
                    match fetch_block(&provider, next).await {
                        Ok(Some(block)) => {
                            if tx.send(block).await.is_err() {
                                return;
                            }
                            next += 1;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(chain_id, block = next, error = %e, "Live fetch failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(BlockSubscription::new(rx, task))
    }

    async fn healthy(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.latest_block_number().await.is_ok()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
