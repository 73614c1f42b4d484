use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::{BusMessage, Channel, LIVE_WORKER_ID};
use kyomei_source::LogFilter;
use kyomei_source::backoff::retry;

use crate::SyncContext;
use crate::worker::{announce_children, collect_batch, commit_batch, expand_discoveries, sync_range};

const HISTORICAL_GATE_POLL: Duration = Duration::from_millis(500);

/// Follow the chain tip once the historical backfill has drained.
///
/// Each delivered block is filtered, committed, and announced. Sources
/// without validated data get a trailing-window re-check on every tip
/// advance; a block whose hash changed is repaired in one transaction.
pub(crate) async fn run_live(ctx: Arc<SyncContext>, cancel: CancellationToken) -> Result<()> {
    // Wait for the workers covering the interval up to the planning-time tip.
    loop {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }
        if ctx.workers.historical_done(ctx.chain_id).await? {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(HISTORICAL_GATE_POLL) => {}
            _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
        }
    }

    let mut current = ctx
        .workers
        .list(ctx.chain_id)
        .await?
        .into_iter()
        .find(|w| w.worker_id == LIVE_WORKER_ID)
        .map(|w| w.current_block)
        .ok_or_else(|| KyomeiError::Internal("live worker row missing".into()))?;

    tracing::info!(
        chain_id = ctx.chain_id,
        from = current,
        "Live sync worker following the tip"
    );

    loop {
        let mut subscription = retry("block subscription", &cancel, || {
            ctx.source.subscribe_blocks()
        })
        .await?;

        // Blocks between the lease checkpoint and the subscription start
        // would otherwise never be delivered. Deliveries overlapping this
        // catch-up are deduplicated by the checkpoint comparison below.
        let latest = retry("latest tip", &cancel, || ctx.source.latest_block_number()).await?;
        if latest > current {
            sync_range(&ctx, &cancel, LIVE_WORKER_ID, current + 1, latest).await?;
            current = latest;
            ctx.bus
                .publish(&BusMessage::new(
                    Channel::LiveBlockSynced,
                    ctx.chain_id,
                    current,
                ))
                .await;
        }

        loop {
            let block = tokio::select! {
                _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
                block = subscription.recv() => block,
            };

            let Some(block) = block else {
                tracing::warn!(chain_id = ctx.chain_id, "Block subscription ended, reopening");
                break;
            };

            if block.number <= current {
                continue;
            }
            if block.number > current + 1 {
                sync_range(&ctx, &cancel, LIVE_WORKER_ID, current + 1, block.number - 1).await?;
            }

            let snapshot = ctx.filter.snapshot();
            let batch = collect_batch(&ctx, std::slice::from_ref(&block), &snapshot);
            let batch =
                expand_discoveries(&ctx, &cancel, batch, &snapshot, block.number, block.number)
                    .await?;
            let (_, new_children) =
                commit_batch(&ctx, LIVE_WORKER_ID, &batch, block.number).await?;
            announce_children(&ctx, &new_children).await;

            current = block.number;
            ctx.bus
                .publish(&BusMessage::new(
                    Channel::LiveBlockSynced,
                    ctx.chain_id,
                    current,
                ))
                .await;

            if !ctx.source.provides_validated_data() {
                recheck_finality_window(&ctx, &cancel, current).await?;
            }
        }
    }
}

/// Re-fetch the most recent `finality` blocks and repair any block whose
/// rows re-appear under a different hash: stale rows are deleted and the
/// canonical rows written in the same transaction.
async fn recheck_finality_window(
    ctx: &SyncContext,
    cancel: &CancellationToken,
    tip: u64,
) -> Result<()> {
    let window_from = tip.saturating_sub(ctx.finality_depth);
    let snapshot = ctx.filter.snapshot();
    let filter = LogFilter::new(snapshot.addresses());

    let page = retry("finality window fetch", cancel, || {
        ctx.source.get_blocks(window_from, tip, &filter)
    })
    .await?;

    let stored = ctx
        .raw_events
        .block_hashes(ctx.chain_id, window_from, tip)
        .await?;

    for block in &page.blocks {
        let Some(stored_hash) = stored.get(&block.number) else {
            continue;
        };
        if stored_hash == &block.hash {
            continue;
        }

        tracing::warn!(
            chain_id = ctx.chain_id,
            block = block.number,
            stale = %stored_hash,
            canonical = %block.hash,
            "Reorg detected, repairing block"
        );

        let batch = collect_batch(ctx, std::slice::from_ref(block), &snapshot);
        let mut tx = ctx.pool.begin().await?;
        ctx.raw_events
            .delete_stale_block(&mut tx, ctx.chain_id, block.number, &block.hash)
            .await?;
        ctx.raw_events.insert_batch(&mut tx, &batch.events).await?;
        for child in &batch.children {
            ctx.factory_children.insert(&mut tx, child).await?;
        }
        tx.commit().await?;

        ctx.bus
            .publish(&BusMessage::new(
                Channel::LiveBlockSynced,
                ctx.chain_id,
                block.number,
            ))
            .await;
    }

    Ok(())
}
