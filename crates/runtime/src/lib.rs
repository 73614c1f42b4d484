//! Service runner: wires sources, syncers, processors, crons, and the
//! operational API per configured chain, and supervises start/stop order.
//!
//! `Kyomei` is the embedding surface for user indexers:
//!
//! ```rust,no_run
//! use kyomei_runtime::Kyomei;
//! use serde_json::json;
//!
//! # async fn example() -> kyomei_common::Result<()> {
//! let mut indexer = Kyomei::from_config_file("kyomei.config.json")?;
//! indexer.on("Token:Transfer", |ctx| async move {
//!     ctx.db
//!         .insert("transfers")
//!         .values(json!({
//!             "id": format!("{}-{}", ctx.event.transaction.hash, ctx.event.log.index),
//!             "amount": ctx.event.arg("value").cloned(),
//!         }))
//!         .execute()
//!         .await?;
//!     Ok(())
//! })?;
//! indexer.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kyomei_abi::AbiRegistry;
use kyomei_common::config::{KyomeiConfig, ScheduleConfig, SourceConfig};
use kyomei_common::db;
use kyomei_common::error::{KyomeiError, Result};
use kyomei_cron::{CronContext, CronHandler, CronJob, CronScheduler};
use kyomei_process::context::EventContext;
use kyomei_process::registry::HandlerRegistry;
use kyomei_process::rpc_ctx::{AlloyRpc, EvmRpc};
use kyomei_process::{Processor, ProcessorOptions};
use kyomei_source::archival::ArchivalSource;
use kyomei_source::rpc::RpcSource;
use kyomei_source::stream::StreamSource;
use kyomei_source::BlockSource;
use kyomei_store::{NotificationBus, schema};
use kyomei_sync::{Syncer, SyncerOptions};

/// Consecutive failed liveness pings before storage loss triggers a clean
/// stop.
const MAX_FAILED_PINGS: u32 = 5;
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// The assembled indexer service.
pub struct Kyomei {
    config: KyomeiConfig,
    registries: HashMap<String, Arc<AbiRegistry>>,
    handlers: HashMap<String, HandlerRegistry>,
    cron_handlers: HashMap<String, CronHandler>,
}

impl Kyomei {
    pub fn from_config_file(path: &str) -> Result<Self> {
        Self::new(KyomeiConfig::load(path)?)
    }

    /// Build the per-chain ABI registries up front so handler registration
    /// can validate immediately.
    pub fn new(config: KyomeiConfig) -> Result<Self> {
        let mut registries = HashMap::new();
        let mut handlers = HashMap::new();
        for chain_name in config.chains.keys() {
            registries.insert(
                chain_name.clone(),
                Arc::new(AbiRegistry::build(&config, chain_name)?),
            );
            handlers.insert(chain_name.clone(), HandlerRegistry::new());
        }

        Ok(Self {
            config,
            registries,
            handlers,
            cron_handlers: HashMap::new(),
        })
    }

    pub fn config(&self) -> &KyomeiConfig {
        &self.config
    }

    /// Register a sequential handler for `"Contract:Event"`.
    pub fn on<F, Fut>(&mut self, key: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(key, false, handler)
    }

    /// Register a parallel-safe handler for `"Contract:Event"`.
    pub fn on_parallel<F, Fut>(&mut self, key: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(key, true, handler)
    }

    fn register<F, Fut>(&mut self, key: &str, parallel: bool, handler: F) -> Result<&mut Self>
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let contract_name = key
            .split_once(':')
            .map(|(c, _)| c)
            .ok_or_else(|| KyomeiError::InvalidHandlerKey(key.to_string()))?;
        let chain_name = self
            .config
            .contracts
            .get(contract_name)
            .map(|c| c.chain.clone())
            .ok_or_else(|| KyomeiError::UnknownContract(contract_name.to_string()))?;

        let registry = &self.registries[&chain_name];
        let boxed: kyomei_process::registry::Handler =
            Arc::new(move |ctx| Box::pin(handler(ctx)));

        let chain_handlers = self
            .handlers
            .get_mut(&chain_name)
            .expect("registry and handler maps share keys");
        if parallel {
            chain_handlers.on_parallel(registry, key, boxed)?;
        } else {
            chain_handlers.on(registry, key, boxed)?;
        }
        Ok(self)
    }

    /// Register the handler for a configured cron job.
    pub fn cron<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(CronContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.config.crons.iter().any(|c| c.name == name) {
            return Err(KyomeiError::Config(format!(
                "cron '{name}' is not in the configuration"
            )));
        }
        self.cron_handlers
            .insert(name.to_string(), Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(self)
    }

    /// Run until a shutdown signal, a fatal source error, or storage loss.
    ///
    /// Start order: sources → syncers → processors → crons → API. Stop
    /// order is the reverse, each stage draining before the next.
    pub async fn run(self) -> Result<()> {
        let schemas = self.config.database.schemas.clone();
        let pool = db::create_pool(
            &self.config.database.connection_string,
            self.config.database.max_connections,
        )
        .await?;

        schema::bootstrap(&pool, &schemas).await?;
        let bus = NotificationBus::new(pool.clone());
        let root_cancel = CancellationToken::new();

        // Sources first: every downstream stage borrows them.
        let mut sources: HashMap<String, Arc<dyn BlockSource>> = HashMap::new();
        let mut rpc_clients: HashMap<String, Arc<dyn EvmRpc>> = HashMap::new();
        let mut chain_names: Vec<&String> = self.config.chains.keys().collect();
        chain_names.sort();

        for chain_name in &chain_names {
            let chain = &self.config.chains[*chain_name];
            let (source, rpc_url): (Arc<dyn BlockSource>, &str) = match &chain.source {
                SourceConfig::Rpc { urls, .. } => (
                    Arc::new(RpcSource::new(
                        chain.chain_id,
                        urls,
                        chain.polling_interval_ms(),
                        chain.finality_depth(),
                    )?),
                    &urls[0],
                ),
                SourceConfig::Archival { url, auth } => (
                    Arc::new(ArchivalSource::new(
                        chain.chain_id,
                        url,
                        auth.as_ref().and_then(|a| a.bearer_token.as_deref()),
                        chain.polling_interval_ms(),
                    )?),
                    url.as_str(),
                ),
                SourceConfig::Stream { url, auth } => (
                    Arc::new(StreamSource::new(
                        chain.chain_id,
                        url,
                        auth.as_ref().and_then(|a| a.bearer_token.as_deref()),
                    )?),
                    url.as_str(),
                ),
            };
            sources.insert((*chain_name).clone(), source);
            rpc_clients.insert((*chain_name).clone(), Arc::new(AlloyRpc::new(rpc_url)?));
        }

        // Syncers.
        let mut syncers = Vec::new();
        for chain_name in &chain_names {
            let chain = &self.config.chains[*chain_name];
            let syncer = Syncer::start(
                SyncerOptions {
                    chain_name: (*chain_name).clone(),
                    chain_id: chain.chain_id,
                    page_size: self.config.sync.page_size,
                    workers: self.config.sync.workers,
                    finality_depth: chain.finality_depth(),
                },
                Arc::clone(&sources[*chain_name]),
                pool.clone(),
                &schemas,
                Arc::clone(&self.registries[*chain_name]),
                bus.clone(),
                root_cancel.child_token(),
            )
            .await?;
            syncers.push(syncer);
        }

        // Processors.
        let mut processors = Vec::new();
        for chain_name in &chain_names {
            let chain = &self.config.chains[*chain_name];
            let processor = Processor::start(
                ProcessorOptions::new((*chain_name).clone(), chain.chain_id),
                pool.clone(),
                &schemas,
                Arc::clone(&self.registries[*chain_name]),
                Arc::new(self.handlers[*chain_name].clone()),
                Arc::clone(&rpc_clients[*chain_name]),
                bus.clone(),
                root_cancel.child_token(),
            )
            .await?;
            processors.push(processor);
        }

        // Crons.
        let mut jobs = Vec::new();
        for cron_config in &self.config.crons {
            let handler = self.cron_handlers.get(&cron_config.name).ok_or_else(|| {
                KyomeiError::Config(format!(
                    "cron '{}' is configured but has no registered handler",
                    cron_config.name
                ))
            })?;
            let chain_name = match &cron_config.schedule {
                ScheduleConfig::Block { chain, .. } => Some(chain.clone()),
                ScheduleConfig::Time { .. } => None,
            };
            jobs.push(CronJob {
                config: cron_config.clone(),
                chain_id: chain_name
                    .as_ref()
                    .map(|name| self.config.chains[name].chain_id),
                rpc: chain_name.as_ref().map(|name| Arc::clone(&rpc_clients[name])),
                handler: Arc::clone(handler),
            });
        }
        let crons = CronScheduler::start(jobs, pool.clone(), &schemas, root_cancel.child_token())
            .await?;

        // Operational API last.
        let api_cancel = root_cancel.child_token();
        let api_state = kyomei_api::state::AppState::new(pool.clone(), schemas.clone());
        let api_port = self.config.api.port;
        let api_task = tokio::spawn(async move {
            if let Err(e) = kyomei_api::serve(api_state, api_port, api_cancel).await {
                tracing::error!(error = %e, "API server exited");
            }
        });

        tracing::info!(chains = chain_names.len(), "Kyomei running");

        // Supervise until something ends the run.
        let outcome = monitor(&pool, &syncers, &processors).await;

        // Stop order is the reverse of start: API → crons → processors →
        // syncers, each stage draining before the next.
        tracing::info!("Shutting down");
        root_cancel.cancel();
        let _ = api_task.await;
        crons.stop().await;
        for processor in processors {
            processor.stop().await;
        }
        for syncer in syncers {
            syncer.stop().await;
        }

        outcome
    }
}

/// Watch for shutdown conditions: Ctrl-C (clean), a fatal source error
/// (exit code 3 at the binary seam), or storage loss (exit code 2). A
/// paused chain logs and keeps the rest of the service running.
async fn monitor(
    pool: &sqlx::PgPool,
    syncers: &[Syncer],
    processors: &[Processor],
) -> Result<()> {
    let mut failed_pings = 0u32;
    let mut reported_paused: Vec<u64> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
                return Ok(());
            }
            _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
        }

        if syncers.iter().any(|s| s.has_fatal_error()) {
            return Err(KyomeiError::SourceFatal(
                "a sync worker exhausted its retry budget".into(),
            ));
        }

        for processor in processors {
            if processor.is_paused() && !reported_paused.contains(&processor.chain_id()) {
                reported_paused.push(processor.chain_id());
                tracing::error!(
                    chain_id = processor.chain_id(),
                    "Chain paused; sibling chains continue"
                );
            }
        }

        match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => failed_pings = 0,
            Err(e) => {
                failed_pings += 1;
                tracing::warn!(failed_pings, error = %e, "Storage liveness ping failed");
                if failed_pings >= MAX_FAILED_PINGS {
                    return Err(KyomeiError::Database(e));
                }
            }
        }
    }
}

/// Exit code contract for the binary seam.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(KyomeiError::Config(_) | KyomeiError::InvalidHandlerKey(_)) => 1,
        Err(KyomeiError::Database(_)) => 2,
        Err(KyomeiError::SourceFatal(_)) => 3,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(KyomeiError::Config("bad".into()))), 1);
        assert_eq!(
            exit_code(&Err(KyomeiError::SourceFatal("gap".into()))),
            3
        );
        assert_eq!(
            exit_code(&Err(KyomeiError::Decode("unexpected".into()))),
            1
        );
    }
}
