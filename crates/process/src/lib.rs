//! The Processor: replays raw events in strict per-chain order through
//! registered handlers.
//!
//! It chases the Syncer's watermark over the notification bus (with a
//! fallback poll), decodes each row against the ABI registry, dispatches to
//! sequential and parallel handlers, and commits every block's effects —
//! handler writes, per-handler checkpoints, and the process-worker row — in
//! one database transaction.

pub mod context;
pub mod db_ctx;
pub mod registry;
pub mod rpc_ctx;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kyomei_abi::AbiRegistry;
use kyomei_common::config::SchemaNames;
use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::{Channel, ProcessStatus, RawEvent};
use kyomei_source::backoff::{Backoff, retry};
use kyomei_store::{
    BusSubscription, CheckpointStore, FactoryChildStore, NotificationBus, ProcessWorkerStore,
    RawEventStore,
};

use context::{DecodedLogEvent, EventContext};
use db_ctx::{DbContext, SharedTx, TableRegistry};
use registry::{DispatchMode, HandlerRegistry};
use rpc_ctx::{CachedRpc, EvmRpc};

/// Consecutive handler failures on one block before the chain pauses for
/// operator intervention.
const MAX_HANDLER_FAILURES: u32 = 10;
/// Fallback watermark poll when a bus delivery is missed.
const FALLBACK_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub chain_name: String,
    pub chain_id: u64,
    /// Blocks per read page while catching up.
    pub read_page_size: u64,
}

impl ProcessorOptions {
    pub fn new(chain_name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            chain_name: chain_name.into(),
            chain_id,
            read_page_size: 1_000,
        }
    }
}

struct ProcessContext {
    chain_id: u64,
    pool: PgPool,
    raw_events: RawEventStore,
    workers: ProcessWorkerStore,
    checkpoints: CheckpointStore,
    factory_children: FactoryChildStore,
    bus: NotificationBus,
    registry: Arc<AbiRegistry>,
    handlers: Arc<HandlerRegistry>,
    tables: Arc<TableRegistry>,
    rpc: CachedRpc,
    read_page_size: u64,
}

pub struct Processor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    paused: Arc<AtomicBool>,
    chain_id: u64,
}

impl Processor {
    /// Reflect the app schema and launch the processing loop.
    pub async fn start(
        options: ProcessorOptions,
        pool: PgPool,
        schemas: &SchemaNames,
        registry: Arc<AbiRegistry>,
        handlers: Arc<HandlerRegistry>,
        rpc_client: Arc<dyn EvmRpc>,
        bus: NotificationBus,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let tables = Arc::new(TableRegistry::reflect(&pool, &schemas.app).await?);
        let cache = kyomei_store::RpcCacheStore::new(pool.clone(), &schemas.sync);

        let ctx = Arc::new(ProcessContext {
            chain_id: options.chain_id,
            pool: pool.clone(),
            raw_events: RawEventStore::new(pool.clone(), &schemas.sync),
            workers: ProcessWorkerStore::new(pool.clone(), &schemas.app),
            checkpoints: CheckpointStore::new(pool.clone(), &schemas.app),
            factory_children: FactoryChildStore::new(pool.clone(), &schemas.sync),
            bus,
            registry,
            handlers,
            tables,
            rpc: CachedRpc::new(options.chain_id, rpc_client, cache),
            read_page_size: options.read_page_size,
        });

        let paused = Arc::new(AtomicBool::new(false));
        let chain_id = options.chain_id;
        let task = spawn_supervised(
            Arc::clone(&ctx),
            Arc::clone(&paused),
            options,
            cancel.child_token(),
        );

        Ok(Self {
            cancel,
            task,
            paused,
            chain_id,
        })
    }

    /// Whether this chain stopped on repeated handler failures or an
    /// integrity violation and needs operator intervention.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        tracing::info!(chain_id = self.chain_id, "Processor stopped");
    }
}

fn spawn_supervised(
    ctx: Arc<ProcessContext>,
    paused: Arc<AtomicBool>,
    options: ProcessorOptions,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut restart_backoff = Backoff::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match run(Arc::clone(&ctx), cancel.child_token()).await {
                Ok(()) | Err(KyomeiError::Cancelled) => return,
                Err(err @ (KyomeiError::ChainPaused { .. } | KyomeiError::StoreIntegrity(_))) => {
                    tracing::error!(
                        chain = %options.chain_name,
                        chain_id = ctx.chain_id,
                        error = %err,
                        "Processing halted; operator intervention required"
                    );
                    paused.store(true, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    tracing::error!(
                        chain = %options.chain_name,
                        chain_id = ctx.chain_id,
                        error = %err,
                        "Processor failed, restarting"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(restart_backoff.next_delay()) => {}
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// Child lookup map: lowercase address → (contract name, discovery block).
type Children = HashMap<String, (String, u64)>;

async fn load_children(ctx: &ProcessContext) -> Result<Children> {
    Ok(ctx
        .factory_children
        .children(ctx.chain_id)
        .await?
        .into_iter()
        .map(|c| (c.child_address, (c.contract_name, c.discovered_block)))
        .collect())
}

async fn run(ctx: Arc<ProcessContext>, cancel: CancellationToken) -> Result<()> {
    let start_block = ctx.registry.earliest_start_block().unwrap_or(0);
    let worker = ctx.workers.ensure(ctx.chain_id, start_block).await?;
    let mut current = worker.current_block;

    let mut children = load_children(&ctx).await?;
    let mut subscription = subscribe(&ctx, &cancel).await?;

    // The syncer may already be ahead of us; start from the store.
    let mut watermark = ctx
        .raw_events
        .max_block(ctx.chain_id)
        .await?
        .unwrap_or(current)
        .max(current);

    tracing::info!(
        chain_id = ctx.chain_id,
        from = current,
        watermark,
        handlers = ctx.handlers.len(),
        "Processor started"
    );

    loop {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }

        if watermark <= current {
            // Idle: block on the bus, with a fallback poll for missed
            // deliveries.
            tokio::select! {
                _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
                message = subscription.recv() => match message {
                    Ok(message) if message.chain_id == ctx.chain_id => match message.channel {
                        Channel::FactoryChildDiscovered => {
                            children = load_children(&ctx).await?;
                        }
                        Channel::BlockRangeSynced | Channel::LiveBlockSynced => {
                            watermark = watermark.max(message.block_number);
                        }
                    },
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(chain_id = ctx.chain_id, error = %e, "Bus receive failed, resubscribing");
                        subscription = subscribe(&ctx, &cancel).await?;
                    }
                },
                _ = tokio::time::sleep(FALLBACK_POLL) => {
                    if let Some(max_block) = ctx.raw_events.max_block(ctx.chain_id).await? {
                        watermark = watermark.max(max_block);
                    }
                }
            }
            continue;
        }

        // Page through (current, watermark].
        let page_to = (current + ctx.read_page_size).min(watermark);
        let events = ctx.raw_events.range(ctx.chain_id, current, page_to).await?;

        // Factory discoveries are causally visible from their block onward;
        // refresh the map at the page boundary so mid-page children resolve.
        children = load_children(&ctx).await?;

        let mut blocks: BTreeMap<u64, Vec<RawEvent>> = BTreeMap::new();
        for event in events {
            blocks.entry(event.block_number).or_default().push(event);
        }

        for (block_number, block_events) in blocks {
            process_block_with_retry(
                &ctx,
                &cancel,
                &children,
                block_number,
                &block_events,
                watermark,
            )
            .await?;
            current = block_number;
        }

        if page_to > current {
            // Advance over the trailing log-free blocks of the page.
            let mut tx = ctx.pool.begin().await?;
            let status = status_at(page_to, watermark);
            ctx.workers
                .advance(&mut tx, ctx.chain_id, page_to, 0, status)
                .await?;
            tx.commit().await?;
        }
        current = page_to;
    }
}

async fn subscribe(ctx: &ProcessContext, cancel: &CancellationToken) -> Result<BusSubscription> {
    let channels = Channel::all();
    retry("bus subscribe", cancel, || ctx.bus.subscribe(&channels)).await
}

fn status_at(block: u64, watermark: u64) -> ProcessStatus {
    if block >= watermark {
        ProcessStatus::Live
    } else {
        ProcessStatus::Processing
    }
}

/// Retry a block until it commits. Handler failures roll the transaction
/// back and retry with backoff up to the pause threshold; integrity
/// violations halt immediately; transient store errors retry indefinitely.
async fn process_block_with_retry(
    ctx: &ProcessContext,
    cancel: &CancellationToken,
    children: &Children,
    block_number: u64,
    events: &[RawEvent],
    watermark: u64,
) -> Result<()> {
    let mut backoff = Backoff::with(Duration::from_millis(100), Duration::from_secs(5));
    let mut handler_failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }

        match process_block(ctx, children, block_number, events, watermark).await {
            Ok(()) => return Ok(()),
            Err(err @ KyomeiError::Handler { .. }) => {
                handler_failures += 1;
                tracing::error!(
                    chain_id = ctx.chain_id,
                    block = block_number,
                    attempt = handler_failures,
                    error = %err,
                    "Handler failed, block rolled back"
                );
                if handler_failures >= MAX_HANDLER_FAILURES {
                    return Err(KyomeiError::ChainPaused {
                        chain_id: ctx.chain_id,
                        failures: handler_failures,
                    });
                }
            }
            Err(KyomeiError::Database(db_err)) => {
                let err = KyomeiError::Database(db_err);
                if err.is_transient() {
                    tracing::warn!(
                        chain_id = ctx.chain_id,
                        block = block_number,
                        error = %err,
                        "Transient store error, retrying block"
                    );
                } else {
                    // Unique conflicts on raw events never surface here;
                    // anything else is an integrity violation.
                    return Err(KyomeiError::StoreIntegrity(format!(
                        "block {block_number}: {err}"
                    )));
                }
            }
            Err(err) => return Err(err),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
        }
    }
}

/// Execute one block: decode, dispatch, and commit all effects atomically.
async fn process_block(
    ctx: &ProcessContext,
    children: &Children,
    block_number: u64,
    events: &[RawEvent],
    watermark: u64,
) -> Result<()> {
    let tx = ctx.pool.begin().await?;
    let shared: SharedTx = Arc::new(Mutex::new(tx));
    let db = DbContext::new(Arc::clone(&shared), Arc::clone(&ctx.tables));

    let mut parallel: Vec<(String, BoxFuture<'static, Result<()>>)> = Vec::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut dispatched = 0u64;

    for raw in events {
        let Some(contract_name) = resolve_contract(ctx, children, raw) else {
            // Synced opportunistically for an address nothing is registered
            // under (e.g. a pre-discovery child log).
            continue;
        };

        let decoded = match ctx.registry.decode(&contract_name, raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    chain_id = ctx.chain_id,
                    block = raw.block_number,
                    log_index = raw.log_index,
                    contract = %contract_name,
                    error = %e,
                    "Skipping undecodable event"
                );
                continue;
            }
        };

        let registrations = ctx.handlers.handlers(&decoded.handler_key());
        if registrations.is_empty() {
            continue;
        }

        let event = DecodedLogEvent::new(raw, &decoded);
        dispatched += 1;

        for registration in registrations {
            let event_ctx = EventContext {
                event: event.clone(),
                db: db.clone(),
                rpc: ctx.rpc.pinned(raw.block_number),
            };
            touched.insert(registration.name.clone());

            match registration.mode {
                DispatchMode::Sequential => {
                    (registration.handler)(event_ctx).await.map_err(|e| {
                        KyomeiError::Handler {
                            handler: registration.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                }
                DispatchMode::Parallel => {
                    let future = (registration.handler)(event_ctx);
                    parallel.push((registration.name.clone(), future));
                }
            }
        }
    }

    // Parallel handlers interleave with each other but all complete before
    // the block commits.
    let results = futures::future::join_all(
        parallel
            .into_iter()
            .map(|(name, future)| async move { (name, future.await) }),
    )
    .await;
    for (name, result) in results {
        result.map_err(|e| KyomeiError::Handler {
            handler: name,
            message: e.to_string(),
        })?;
    }

    {
        let mut guard = shared.lock().await;
        for handler_name in &touched {
            ctx.checkpoints
                .set(&mut guard, ctx.chain_id, handler_name, block_number)
                .await?;
        }
        ctx.workers
            .advance(
                &mut guard,
                ctx.chain_id,
                block_number,
                dispatched,
                status_at(block_number, watermark),
            )
            .await?;
    }

    let tx = Arc::try_unwrap(shared)
        .map_err(|_| KyomeiError::Internal("block transaction still shared at commit".into()))?
        .into_inner();
    tx.commit().await?;

    tracing::debug!(
        chain_id = ctx.chain_id,
        block = block_number,
        events = dispatched,
        "Processed block"
    );
    Ok(())
}

/// Map a row's address to its registered contract: static contracts first,
/// then factory children watched from their creation block onward.
fn resolve_contract(ctx: &ProcessContext, children: &Children, raw: &RawEvent) -> Option<String> {
    if let Some(contract) = ctx.registry.contract_by_address(&raw.address) {
        if let Some(start) = contract.start_block
            && raw.block_number < start
        {
            return None;
        }
        if let Some(end) = contract.end_block
            && raw.block_number > end
        {
            return None;
        }
        return Some(contract.name.clone());
    }

    if let Some((name, discovered_block)) = children.get(&raw.address)
        && raw.block_number >= *discovered_block
    {
        return Some(name.clone());
    }

    None
}
