//! Cron scheduler: time-cron and block-interval-cron jobs sharing the
//! handler execution contract of the processor.
//!
//! Each fire leases the job row (`FOR UPDATE SKIP LOCKED`), records a
//! `cron_executions` row, runs the handler inside a transaction with the
//! same DB/RPC context handlers get, and advances the checkpoint only on
//! success. Contending runners skip rather than wait.

pub mod block_trigger;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kyomei_common::config::{CronConfig, CronSchema, ScheduleConfig, SchemaNames};
use kyomei_common::error::{KyomeiError, Result};
use kyomei_common::types::{CronStatus, LIVE_WORKER_ID};
use kyomei_process::db_ctx::{DbContext, SharedTx, TableRegistry};
use kyomei_process::rpc_ctx::{CachedRpc, EvmRpc};
use kyomei_store::{CronStore, RpcCacheStore, SyncWorkerStore};

/// How often block-interval crons check the chain's synced tip.
const BLOCK_POLL: Duration = Duration::from_secs(5);

/// What a cron handler receives per fire.
#[derive(Clone)]
pub struct CronContext {
    pub job: String,
    pub db: DbContext,
    /// Present for block crons, pinned to the trigger block.
    pub rpc: Option<CachedRpc>,
    /// The block that fired a block cron; `None` for time crons.
    pub trigger_block: Option<u64>,
}

pub type CronHandler = Arc<dyn Fn(CronContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One job as assembled by the runner: config plus the resolved chain and
/// transport for the RPC context.
#[derive(Clone)]
pub struct CronJob {
    pub config: CronConfig,
    pub chain_id: Option<u64>,
    pub rpc: Option<Arc<dyn EvmRpc>>,
    pub handler: CronHandler,
}

struct CronRuntime {
    pool: PgPool,
    store: CronStore,
    sync_workers: SyncWorkerStore,
    cache: RpcCacheStore,
    app_tables: Arc<TableRegistry>,
    cron_tables: Arc<TableRegistry>,
}

pub struct CronScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

enum RunOutcome {
    Completed,
    Failed,
    /// Another runner holds the lease.
    Skipped,
}

impl CronScheduler {
    /// Validate schedules, register job rows, and launch one task per job.
    pub async fn start(
        jobs: Vec<CronJob>,
        pool: PgPool,
        schemas: &SchemaNames,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let runtime = Arc::new(CronRuntime {
            pool: pool.clone(),
            store: CronStore::new(pool.clone(), &schemas.crons),
            sync_workers: SyncWorkerStore::new(pool.clone(), &schemas.sync),
            cache: RpcCacheStore::new(pool.clone(), &schemas.sync),
            app_tables: Arc::new(TableRegistry::reflect(&pool, &schemas.app).await?),
            cron_tables: Arc::new(TableRegistry::reflect(&pool, &schemas.crons).await?),
        });

        let mut tasks = Vec::new();
        for job in jobs {
            let name = job.config.name.clone();
            runtime
                .store
                .ensure_job(&name, &schedule_json(&job.config.schedule))
                .await?;

            match &job.config.schedule {
                ScheduleConfig::Time { expr, timezone } => {
                    let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                        KyomeiError::Config(format!("crons.{name}: bad cron expression: {e}"))
                    })?;
                    let tz: chrono_tz::Tz = match timezone {
                        Some(tz) => tz.parse().map_err(|_| {
                            KyomeiError::Config(format!("crons.{name}: unknown timezone {tz}"))
                        })?,
                        None => chrono_tz::UTC,
                    };
                    tasks.push(spawn_time_cron(
                        Arc::clone(&runtime),
                        job,
                        schedule,
                        tz,
                        cancel.child_token(),
                    ));
                }
                ScheduleConfig::Block {
                    interval, offset, ..
                } => {
                    let interval = *interval;
                    let offset = *offset;
                    let chain_id = job.chain_id.ok_or_else(|| {
                        KyomeiError::Config(format!("crons.{name}: block cron without a chain"))
                    })?;
                    tasks.push(spawn_block_cron(
                        Arc::clone(&runtime),
                        job,
                        chain_id,
                        interval,
                        offset,
                        cancel.child_token(),
                    ));
                }
            }
        }

        Ok(Self { cancel, tasks })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Cron scheduler stopped");
    }
}

fn schedule_json(schedule: &ScheduleConfig) -> serde_json::Value {
    match schedule {
        ScheduleConfig::Time { expr, timezone } => serde_json::json!({
            "kind": "time",
            "expr": expr,
            "timezone": timezone,
        }),
        ScheduleConfig::Block {
            chain,
            interval,
            offset,
        } => serde_json::json!({
            "kind": "block",
            "chain": chain,
            "interval": interval,
            "offset": offset,
        }),
    }
}

fn spawn_time_cron(
    runtime: Arc<CronRuntime>,
    job: CronJob,
    schedule: cron::Schedule,
    tz: chrono_tz::Tz,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = job.config.name.clone();
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let now = chrono::Utc::now().with_timezone(&tz);
            let Some(next) = schedule.after(&now).next() else {
                tracing::warn!(job = %name, "Cron schedule has no future fires");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }

            match run_once(&runtime, &job, None).await {
                Ok(RunOutcome::Skipped) => {
                    tracing::debug!(job = %name, "Fire skipped, lease held elsewhere");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(job = %name, error = %e, "Cron fire errored");
                }
            }
        }
    })
}

fn spawn_block_cron(
    runtime: Arc<CronRuntime>,
    job: CronJob,
    chain_id: u64,
    interval: u64,
    offset: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = job.config.name.clone();

        let mut last_triggered = match runtime.store.checkpoint(&name, chain_id).await {
            Ok(Some(checkpoint)) => checkpoint.last_block_number,
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(job = %name, error = %e, "Cannot read cron checkpoint");
                0
            }
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(BLOCK_POLL) => {}
                _ = cancel.cancelled() => return,
            }

            let current = match synced_tip(&runtime, chain_id).await {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job = %name, error = %e, "Cannot read synced tip");
                    continue;
                }
            };

            for block in block_trigger::fires(last_triggered, current, interval, offset) {
                if cancel.is_cancelled() {
                    return;
                }
                match run_once(&runtime, &job, Some((chain_id, block))).await {
                    Ok(RunOutcome::Completed) => {
                        if let Err(e) = runtime.store.set_checkpoint(&name, chain_id, block).await {
                            tracing::error!(job = %name, error = %e, "Checkpoint write failed");
                        }
                        last_triggered = block;
                    }
                    Ok(RunOutcome::Failed) => {
                        // The failure is persisted; move on so the schedule
                        // keeps its cadence. The checkpoint stays behind, so
                        // a restart retries this block.
                        last_triggered = block;
                    }
                    Ok(RunOutcome::Skipped) => {
                        // A peer runner is firing this job; re-read its
                        // progress on the next poll.
                        if let Ok(Some(checkpoint)) =
                            runtime.store.checkpoint(&name, chain_id).await
                        {
                            last_triggered = last_triggered.max(checkpoint.last_block_number);
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(job = %name, block, error = %e, "Cron fire errored");
                        break;
                    }
                }
            }
        }
    })
}

/// The greatest block the syncer has durably committed for the chain.
async fn synced_tip(runtime: &CronRuntime, chain_id: u64) -> Result<Option<u64>> {
    let workers = runtime.sync_workers.list(chain_id).await?;
    Ok(workers
        .iter()
        .find(|w| w.worker_id == LIVE_WORKER_ID)
        .map(|w| w.current_block)
        .or_else(|| workers.iter().map(|w| w.current_block).max()))
}

/// One leased execution: lock the job row, record the run, invoke the
/// handler inside a transaction, persist the outcome.
async fn run_once(
    runtime: &CronRuntime,
    job: &CronJob,
    trigger: Option<(u64, u64)>,
) -> Result<RunOutcome> {
    let name = &job.config.name;

    let mut tx = runtime.pool.begin().await?;
    if !runtime.store.lease(&mut tx, name).await? {
        tx.rollback().await?;
        return Ok(RunOutcome::Skipped);
    }

    let execution_id = runtime.store.start_execution(name).await?;
    let started = Instant::now();

    let tables = match job.config.schema {
        CronSchema::Chain => Arc::clone(&runtime.app_tables),
        CronSchema::Dedicated => Arc::clone(&runtime.cron_tables),
    };
    let shared: SharedTx = Arc::new(Mutex::new(tx));
    let db = DbContext::new(Arc::clone(&shared), tables);

    let rpc = match (&job.rpc, trigger) {
        (Some(client), Some((chain_id, block))) => Some(
            CachedRpc::new(chain_id, Arc::clone(client), runtime.cache.clone()).pinned(block),
        ),
        _ => None,
    };

    let context = CronContext {
        job: name.clone(),
        db,
        rpc,
        trigger_block: trigger.map(|(_, block)| block),
    };

    let result = (job.handler)(context).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let tx = Arc::try_unwrap(shared)
        .map_err(|_| KyomeiError::Internal("cron transaction still shared".into()))?
        .into_inner();

    match result {
        Ok(()) => {
            tx.commit().await?;
            runtime
                .store
                .finish_execution(execution_id, CronStatus::Success, duration_ms, None)
                .await?;
            tracing::info!(job = %name, duration_ms, "Cron run succeeded");
            Ok(RunOutcome::Completed)
        }
        Err(err) => {
            tx.rollback().await?;
            runtime
                .store
                .finish_execution(
                    execution_id,
                    CronStatus::Failed,
                    duration_ms,
                    Some(&err.to_string()),
                )
                .await?;
            tracing::error!(job = %name, duration_ms, error = %err, "Cron run failed");
            Ok(RunOutcome::Failed)
        }
    }
}
