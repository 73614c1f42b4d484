//! The Syncer: turns an unbounded chain into a gap-free stream of raw-event
//! rows, with the persisted worker table as the single source of truth for
//! restartability.
//!
//! Start-up plans block ranges over existing leases, fans historical chunks
//! out across workers, and follows the tip with a live worker once the
//! backfill drains. Factory-creation events expand the watched address set
//! on the fly.

pub mod filter;
pub mod planner;

mod live;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kyomei_abi::AbiRegistry;
use kyomei_common::config::SchemaNames;
use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::{Channel, SyncStatus};
use kyomei_source::BlockSource;
use kyomei_source::backoff::{Backoff, retry};
use kyomei_store::{FactoryChildStore, NotificationBus, RawEventStore, SyncWorkerStore};

use filter::FilterSet;

#[derive(Debug, Clone)]
pub struct SyncerOptions {
    pub chain_name: String,
    pub chain_id: u64,
    pub page_size: u64,
    /// Historical worker count; derived from the uncovered span when unset.
    pub workers: Option<usize>,
    pub finality_depth: u64,
}

/// Shared state for all of one chain's sync tasks.
pub(crate) struct SyncContext {
    pub chain_id: u64,
    pub source: Arc<dyn BlockSource>,
    pub pool: PgPool,
    pub raw_events: RawEventStore,
    pub workers: SyncWorkerStore,
    pub factory_children: FactoryChildStore,
    pub bus: NotificationBus,
    pub registry: Arc<AbiRegistry>,
    pub filter: FilterSet,
    pub page_size: u64,
    pub finality_depth: u64,
}

pub struct Syncer {
    ctx: Arc<SyncContext>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    fatal: Arc<AtomicBool>,
}

impl Syncer {
    /// Plan ranges against the persisted worker table and launch the
    /// workers. The returned handle owns the spawned tasks.
    pub async fn start(
        options: SyncerOptions,
        source: Arc<dyn BlockSource>,
        pool: PgPool,
        schemas: &SchemaNames,
        registry: Arc<AbiRegistry>,
        bus: NotificationBus,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let chain_id = options.chain_id;
        let filter = FilterSet::new(registry.static_addresses());

        let ctx = Arc::new(SyncContext {
            chain_id,
            source,
            pool: pool.clone(),
            raw_events: RawEventStore::new(pool.clone(), &schemas.sync),
            workers: SyncWorkerStore::new(pool.clone(), &schemas.sync),
            factory_children: FactoryChildStore::new(pool.clone(), &schemas.sync),
            bus,
            registry,
            filter,
            page_size: options.page_size,
            finality_depth: options.finality_depth,
        });

        // Children discovered in previous runs re-enter the filter set.
        let known_children = ctx.factory_children.children(chain_id).await?;
        if !known_children.is_empty() {
            tracing::info!(
                chain_id,
                children = known_children.len(),
                "Restored factory children"
            );
            ctx.filter.replace_children(known_children);
        }

        let start_block = ctx.registry.earliest_start_block().unwrap_or(0);
        let finalized = retry("finalized tip", &cancel, || {
            ctx.source.finalized_block_number()
        })
        .await?;

        let existing = ctx.workers.list(chain_id).await?;
        let plan = planner::plan(&existing, start_block, finalized, options.workers);

        tracing::info!(
            chain = %options.chain_name,
            chain_id,
            start_block,
            finalized,
            resumable = plan.resumable.len(),
            new_workers = plan.new_ranges.len(),
            "Planned sync ranges"
        );

        let mut worker_id = ctx.workers.next_worker_id(chain_id).await?;
        for &(range_start, range_end) in &plan.new_ranges {
            ctx.workers
                .insert_historical(chain_id, worker_id, range_start, range_end)
                .await?;
            worker_id += 1;
        }
        ctx.workers.upsert_live(chain_id, plan.live_start).await?;

        let fatal = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        for lease in ctx.workers.list(chain_id).await? {
            if lease.status == SyncStatus::Historical {
                tasks.push(spawn_historical(
                    Arc::clone(&ctx),
                    Arc::clone(&fatal),
                    lease.worker_id,
                    cancel.child_token(),
                ));
            }
        }
        tasks.push(spawn_live(
            Arc::clone(&ctx),
            Arc::clone(&fatal),
            cancel.child_token(),
        ));
        tasks.push(spawn_filter_refresh(Arc::clone(&ctx), cancel.child_token()));

        Ok(Self {
            ctx,
            cancel,
            tasks,
            fatal,
        })
    }

    /// Whether a worker escalated a fatal source error. The runner treats
    /// this as grounds for a clean stop with a source-error exit code.
    pub fn has_fatal_error(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Signal all workers, wait for in-flight page commits, and close the
    /// block source.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.ctx.source.close().await;
        tracing::info!(chain_id = self.ctx.chain_id, "Syncer stopped");
    }
}

/// Supervise one historical lease: restart on errors and panics with
/// backoff, leave siblings alone, stop on completion or cancellation.
/// Fatal source errors raise the flag and end the task.
fn spawn_historical(
    ctx: Arc<SyncContext>,
    fatal: Arc<AtomicBool>,
    worker_id: i32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut restart_backoff = Backoff::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let lease = match ctx.workers.list(ctx.chain_id).await {
                Ok(workers) => workers.into_iter().find(|w| w.worker_id == worker_id),
                Err(e) => {
                    tracing::error!(chain_id = ctx.chain_id, worker_id, error = %e, "Cannot read worker lease");
                    None
                }
            };
            let Some(lease) = lease else {
                tokio::select! {
                    _ = tokio::time::sleep(restart_backoff.next_delay()) => continue,
                    _ = cancel.cancelled() => return,
                }
            };
            if lease.status != SyncStatus::Historical {
                return;
            }

            // Run in its own task so a panic is contained to this worker.
            let attempt = tokio::spawn(worker::run_historical(
                Arc::clone(&ctx),
                lease,
                cancel.child_token(),
            ));

            match attempt.await {
                Ok(Ok(())) | Ok(Err(KyomeiError::Cancelled)) => return,
                Ok(Err(err @ KyomeiError::SourceFatal(_))) => {
                    tracing::error!(chain_id = ctx.chain_id, worker_id, error = %err, "Sync worker failed fatally");
                    fatal.store(true, Ordering::Relaxed);
                    return;
                }
                Ok(Err(err)) => {
                    tracing::error!(chain_id = ctx.chain_id, worker_id, error = %err, "Sync worker failed, restarting");
                }
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => {
                    tracing::error!(chain_id = ctx.chain_id, worker_id, error = %join_err, "Sync worker panicked, restarting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_backoff.next_delay()) => {}
                _ = cancel.cancelled() => return,
            }
        }
    })
}

fn spawn_live(
    ctx: Arc<SyncContext>,
    fatal: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut restart_backoff = Backoff::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let attempt = tokio::spawn(live::run_live(Arc::clone(&ctx), cancel.child_token()));
            match attempt.await {
                Ok(Ok(())) | Ok(Err(KyomeiError::Cancelled)) => return,
                Ok(Err(err @ KyomeiError::SourceFatal(_))) => {
                    tracing::error!(chain_id = ctx.chain_id, error = %err, "Live worker failed fatally");
                    fatal.store(true, Ordering::Relaxed);
                    return;
                }
                Ok(Err(err)) => {
                    tracing::error!(chain_id = ctx.chain_id, error = %err, "Live worker failed, restarting");
                }
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => {
                    tracing::error!(chain_id = ctx.chain_id, error = %join_err, "Live worker panicked, restarting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_backoff.next_delay()) => {}
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// Keep the in-memory filter in step with discoveries made by peer
/// processes: every discovery notification re-reads the registry table and
/// swaps the snapshot.
fn spawn_filter_refresh(ctx: Arc<SyncContext>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut subscription = match ctx.bus.subscribe(&[Channel::FactoryChildDiscovered]).await
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(chain_id = ctx.chain_id, error = %e, "Bus subscribe failed");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
            };

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = subscription.recv() => message,
                };
                match message {
                    Ok(message) if message.chain_id == ctx.chain_id => {
                        match ctx.factory_children.children(ctx.chain_id).await {
                            Ok(children) => ctx.filter.replace_children(children),
                            Err(e) => {
                                tracing::warn!(chain_id = ctx.chain_id, error = %e, "Child refresh failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(chain_id = ctx.chain_id, error = %e, "Bus receive failed, resubscribing");
                        break;
                    }
                }
            }
        }
    })
}
