use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::{BusMessage, Channel, FactoryChild, RawEvent, SyncWorker};
use kyomei_source::backoff::{Backoff, MAX_CONSECUTIVE_TRANSIENT, retry};
use kyomei_source::{BlockWithLogs, LogFilter, is_rate_limited};

use crate::SyncContext;
use crate::filter::FilterSnapshot;

const MIN_PAGE_SIZE: u64 = 100;
const GROW_AFTER_SUCCESSES: u32 = 5;

/// Adaptive page sizing: halve on rate-limit signals, double back after a
/// run of clean pages, never past the configured ceiling.
#[derive(Debug)]
pub(crate) struct PageSizer {
    size: u64,
    ceiling: u64,
    successes: u32,
}

impl PageSizer {
    pub fn new(ceiling: u64) -> Self {
        Self {
            size: ceiling,
            ceiling,
            successes: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn shrink(&mut self) {
        self.size = (self.size / 2).max(MIN_PAGE_SIZE);
        self.successes = 0;
    }

    pub fn grow(&mut self) {
        self.successes += 1;
        if self.successes >= GROW_AFTER_SUCCESSES && self.size < self.ceiling {
            self.size = (self.size * 2).min(self.ceiling);
            self.successes = 0;
        }
    }
}

/// Everything one page commit writes: raw rows plus any children their
/// creation events revealed.
pub(crate) struct IngestBatch {
    pub events: Vec<RawEvent>,
    pub children: Vec<FactoryChild>,
}

fn to_raw(chain_id: u64, block: &BlockWithLogs, log: &kyomei_source::SourceLog) -> RawEvent {
    let mut topics = log.topics.iter();
    RawEvent {
        chain_id,
        block_number: block.number,
        tx_index: log.tx_index,
        log_index: log.log_index,
        block_hash: block.hash.clone(),
        block_timestamp: block.timestamp,
        tx_hash: log.tx_hash.clone(),
        address: log.address.clone(),
        topic0: topics.next().cloned().unwrap_or_default(),
        topic1: topics.next().cloned(),
        topic2: topics.next().cloned(),
        topic3: topics.next().cloned(),
        data: log.data.clone(),
    }
}

/// Turn fetched blocks into rows, re-filtering against the snapshot (the
/// source-level filter is advisory) and decoding factory-creation events.
pub(crate) fn collect_batch(
    ctx: &SyncContext,
    blocks: &[BlockWithLogs],
    snapshot: &FilterSnapshot,
) -> IngestBatch {
    let mut events = Vec::new();
    let mut children = Vec::new();

    for block in blocks {
        for log in &block.logs {
            if !snapshot.contains(&log.address) && !snapshot.is_empty() {
                continue;
            }
            let raw = to_raw(ctx.chain_id, block, log);

            for watch in ctx.registry.factories() {
                if !watch.matches(&raw) {
                    continue;
                }
                match watch.extract_child(&raw) {
                    Ok(child_address) => children.push(FactoryChild {
                        chain_id: ctx.chain_id,
                        child_address,
                        factory_address: watch.parent_address.clone(),
                        contract_name: watch.child_contract.clone(),
                        discovered_block: raw.block_number,
                        discovered_tx: raw.tx_hash.clone(),
                        child_abi: Some(watch.child_contract.clone()),
                    }),
                    Err(e) => {
                        tracing::warn!(
                            chain_id = ctx.chain_id,
                            block = raw.block_number,
                            factory = %watch.parent_contract,
                            error = %e,
                            "Could not decode factory creation event"
                        );
                    }
                }
            }

            events.push(raw);
        }
    }

    IngestBatch { events, children }
}

/// A page can both reveal a child and contain that child's first logs. The
/// initial fetch was filtered without the child's address, so fetch the
/// tail of the page again for just the fresh children, watched from their
/// creation block onward.
pub(crate) async fn expand_discoveries(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    mut batch: IngestBatch,
    snapshot: &FilterSnapshot,
    from: u64,
    to: u64,
) -> Result<IngestBatch> {
    let fresh: Vec<&FactoryChild> = batch
        .children
        .iter()
        .filter(|c| !snapshot.contains(&c.child_address))
        .collect();
    if fresh.is_empty() {
        return Ok(batch);
    }

    let creation: BTreeMap<String, u64> = fresh
        .iter()
        .map(|c| (c.child_address.clone(), c.discovered_block))
        .collect();
    let earliest = *creation.values().min().expect("non-empty");
    let addresses: Vec<String> = creation.keys().cloned().collect();

    let filter = LogFilter::new(addresses);
    let refetch_from = earliest.max(from);
    let extra = retry("factory expansion fetch", cancel, || {
        ctx.source.get_blocks(refetch_from, to, &filter)
    })
    .await?;

    // Merge, deduplicating against rows the first pass already collected.
    let mut merged: BTreeMap<(u64, u32, u32), RawEvent> = batch
        .events
        .drain(..)
        .map(|e| ((e.block_number, e.tx_index, e.log_index), e))
        .collect();
    for block in &extra.blocks {
        for log in &block.logs {
            let watched_from = creation.get(&log.address).copied().unwrap_or(u64::MAX);
            if block.number < watched_from {
                continue;
            }
            let raw = to_raw(ctx.chain_id, block, log);
            merged.insert((raw.block_number, raw.tx_index, raw.log_index), raw);
        }
    }

    batch.events = merged.into_values().collect();
    Ok(batch)
}

/// Commit one page: raw rows, factory children, and the worker checkpoint
/// move in a single transaction, so a crash at any point restarts cleanly.
/// Returns the children that were actually new.
pub(crate) async fn commit_batch(
    ctx: &SyncContext,
    worker_id: i32,
    batch: &IngestBatch,
    advance_to: u64,
) -> Result<(u64, Vec<FactoryChild>)> {
    let mut tx = ctx.pool.begin().await?;

    let inserted = ctx.raw_events.insert_batch(&mut tx, &batch.events).await?;

    let mut new_children = Vec::new();
    for child in &batch.children {
        if ctx.factory_children.insert(&mut tx, child).await? {
            new_children.push(child.clone());
        }
    }

    ctx.workers
        .advance(&mut tx, ctx.chain_id, worker_id, advance_to)
        .await?;

    tx.commit().await?;
    Ok((inserted, new_children))
}

/// Publish discoveries after their transaction committed, and expand the
/// in-memory filter so subsequent fetches see the children.
pub(crate) async fn announce_children(ctx: &SyncContext, new_children: &[FactoryChild]) {
    for child in new_children {
        ctx.filter.add_child(child);
        tracing::info!(
            chain_id = ctx.chain_id,
            child = %child.child_address,
            contract = %child.contract_name,
            block = child.discovered_block,
            "Discovered factory child"
        );
        ctx.bus
            .publish(&BusMessage::new(
                Channel::FactoryChildDiscovered,
                ctx.chain_id,
                child.discovered_block,
            ))
            .await;
    }
}

/// Drive one historical lease from its checkpoint to its range end.
pub(crate) async fn run_historical(
    ctx: Arc<SyncContext>,
    lease: SyncWorker,
    cancel: CancellationToken,
) -> Result<()> {
    let range_end = lease
        .range_end
        .ok_or_else(|| KyomeiError::Internal("historical worker without range end".into()))?;

    let mut pager = PageSizer::new(ctx.page_size);
    let mut backoff = Backoff::new();
    let mut consecutive_transient = 0u32;

    // A fresh lease sits at its range start with nothing committed; re-covering
    // the checkpoint block after a restart is harmless (inserts are idempotent).
    let mut next = if lease.current_block == lease.range_start {
        lease.range_start
    } else {
        lease.current_block + 1
    };

    tracing::info!(
        chain_id = ctx.chain_id,
        worker_id = lease.worker_id,
        from = next,
        to = range_end,
        "Historical sync worker started"
    );

    while next <= range_end {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }

        let to = (next + pager.size() - 1).min(range_end);
        let snapshot = ctx.filter.snapshot();

        let page = match ctx
            .source
            .get_blocks(next, to, &LogFilter::new(snapshot.addresses()))
            .await
        {
            Ok(page) => page,
            Err(err) if is_rate_limited(&err) => {
                pager.shrink();
                tracing::debug!(
                    chain_id = ctx.chain_id,
                    worker_id = lease.worker_id,
                    page_size = pager.size(),
                    "Rate limited, shrinking page"
                );
                continue;
            }
            Err(err) if err.is_transient() => {
                consecutive_transient += 1;
                if consecutive_transient >= MAX_CONSECUTIVE_TRANSIENT {
                    return Err(KyomeiError::SourceFatal(format!(
                        "{consecutive_transient} consecutive transient failures, last: {err}"
                    )));
                }
                let delay = backoff.next_delay();
                tracing::warn!(
                    chain_id = ctx.chain_id,
                    worker_id = lease.worker_id,
                    attempt = consecutive_transient,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Page fetch failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        consecutive_transient = 0;
        backoff.reset();

        let batch = collect_batch(&ctx, &page.blocks, &snapshot);
        let batch = expand_discoveries(&ctx, &cancel, batch, &snapshot, next, to).await?;
        let (inserted, new_children) = commit_batch(&ctx, lease.worker_id, &batch, to).await?;
        announce_children(&ctx, &new_children).await;

        ctx.bus
            .publish(&BusMessage::new(
                Channel::BlockRangeSynced,
                ctx.chain_id,
                to,
            ))
            .await;

        tracing::debug!(
            chain_id = ctx.chain_id,
            worker_id = lease.worker_id,
            from = next,
            to,
            events = inserted,
            "Committed page"
        );

        pager.grow();
        next = to + 1;
    }

    ctx.workers.complete(ctx.chain_id, lease.worker_id).await?;
    tracing::info!(
        chain_id = ctx.chain_id,
        worker_id = lease.worker_id,
        "Historical sync worker completed"
    );
    Ok(())
}

/// Catch-up ingest used by the live follower when the subscription skips
/// ahead of its checkpoint: fixed-size pages, each committed and announced.
pub(crate) async fn sync_range(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    worker_id: i32,
    from: u64,
    to: u64,
) -> Result<()> {
    let mut next = from;
    while next <= to {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }
        let page_to = (next + ctx.page_size - 1).min(to);
        let snapshot = ctx.filter.snapshot();
        let filter = LogFilter::new(snapshot.addresses());

        let page = retry("catch-up fetch", cancel, || {
            ctx.source.get_blocks(next, page_to, &filter)
        })
        .await?;

        let batch = collect_batch(ctx, &page.blocks, &snapshot);
        let batch = expand_discoveries(ctx, cancel, batch, &snapshot, next, page_to).await?;
        let (_, new_children) = commit_batch(ctx, worker_id, &batch, page_to).await?;
        announce_children(ctx, &new_children).await;

        ctx.bus
            .publish(&BusMessage::new(
                Channel::BlockRangeSynced,
                ctx.chain_id,
                page_to,
            ))
            .await;

        next = page_to + 1;
    }
    Ok(())
}
