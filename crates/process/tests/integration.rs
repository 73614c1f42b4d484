//! End-to-end Processor scenarios: ordered dispatch, block atomicity,
//! cached-RPC replay determinism, and parallel/sequential handler modes.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p kyomei-process --test integration -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use kyomei_abi::AbiRegistry;
use kyomei_common::config::{KyomeiConfig, SchemaNames};
use kyomei_common::error::Result;
use kyomei_common::types::{ProcessStatus, RawEvent};
use kyomei_process::registry::{Handler, HandlerRegistry};
use kyomei_process::rpc_ctx::EvmRpc;
use kyomei_process::{Processor, ProcessorOptions};
use kyomei_store::{NotificationBus, ProcessWorkerStore, RawEventStore, schema};

const TOKEN: &str = "0x1111111111111111111111111111111111111111";

fn config_json(chain_id: u64) -> String {
    format!(
        r#"{{
        "database": {{ "connectionString": "postgres://localhost/kyomei" }},
        "chains": {{
            "testnet": {{
                "chainId": {chain_id},
                "source": {{ "kind": "rpc", "urls": ["http://localhost:8545"] }}
            }}
        }},
        "contracts": {{
            "Token": {{
                "chain": "testnet",
                "address": "{TOKEN}",
                "abi": [
                    {{ "type": "event", "name": "Transfer", "anonymous": false, "inputs": [
                        {{ "indexed": true, "name": "from", "type": "address" }},
                        {{ "indexed": true, "name": "to", "type": "address" }},
                        {{ "indexed": false, "name": "value", "type": "uint256" }}
                    ] }},
                    {{ "type": "event", "name": "Approval", "anonymous": false, "inputs": [
                        {{ "indexed": true, "name": "owner", "type": "address" }},
                        {{ "indexed": true, "name": "spender", "type": "address" }},
                        {{ "indexed": false, "name": "value", "type": "uint256" }}
                    ] }}
                ],
                "startBlock": 100
            }}
        }}
    }}"#
    )
}

struct MockRpc {
    calls: AtomicU32,
}

#[async_trait]
impl EvmRpc for MockRpc {
    async fn call(&self, _method: &str, _params: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!("0x0000000000000000000000000000000000000000000000000000000000000012"))
    }
}

async fn setup(pool: &PgPool, chain_id: u64) -> (SchemaNames, Arc<AbiRegistry>) {
    let names = SchemaNames::default();
    schema::bootstrap(pool, &names).await.unwrap();

    for table in ["raw_events", "rpc_cache"] {
        sqlx::query(&format!(
            "DELETE FROM {}.{table} WHERE chain_id = {chain_id}",
            names.sync
        ))
        .execute(pool)
        .await
        .unwrap();
    }
    for table in ["process_workers", "process_checkpoints"] {
        sqlx::query(&format!(
            "DELETE FROM {}.{table} WHERE chain_id = {chain_id}",
            names.app
        ))
        .execute(pool)
        .await
        .unwrap();
    }

    // The handler-facing application table for these tests.
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.audit_entries (
            id TEXT PRIMARY KEY,
            chain_id BIGINT NOT NULL,
            block_number BIGINT NOT NULL,
            handler TEXT NOT NULL,
            amount NUMERIC,
            note TEXT
        )",
        names.app
    ))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "DELETE FROM {}.audit_entries WHERE chain_id = {chain_id}",
        names.app
    ))
    .execute(pool)
    .await
    .unwrap();

    let config = KyomeiConfig::from_json(&config_json(chain_id)).unwrap();
    let registry = Arc::new(AbiRegistry::build(&config, "testnet").unwrap());
    (names, registry)
}

fn pad_address(addr: &str) -> String {
    format!("0x{:0>64}", addr.trim_start_matches("0x"))
}

fn raw_event(
    registry: &AbiRegistry,
    event: &str,
    chain_id: u64,
    block_number: u64,
    log_index: u32,
    value: u64,
) -> RawEvent {
    let selector = registry
        .contract("Token")
        .unwrap()
        .event(event)
        .unwrap()
        .selector();
    RawEvent {
        chain_id,
        block_number,
        tx_index: 0,
        log_index,
        block_hash: format!("0x{block_number:064x}"),
        block_timestamp: Utc::now(),
        tx_hash: format!("0x{:064x}", block_number * 1_000 + log_index as u64),
        address: TOKEN.to_string(),
        topic0: format!("{selector:#x}"),
        topic1: Some(pad_address("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")),
        topic2: Some(pad_address("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")),
        topic3: None,
        data: format!("0x{value:064x}"),
    }
}

async fn seed(pool: &PgPool, names: &SchemaNames, events: &[RawEvent]) {
    let store = RawEventStore::new(pool.clone(), &names.sync);
    let mut tx = pool.begin().await.unwrap();
    store.insert_batch(&mut tx, events).await.unwrap();
    tx.commit().await.unwrap();
}

async fn start_processor(
    pool: &PgPool,
    names: &SchemaNames,
    registry: Arc<AbiRegistry>,
    handlers: HandlerRegistry,
    rpc: Arc<dyn EvmRpc>,
    chain_id: u64,
    cancel: CancellationToken,
) -> Processor {
    Processor::start(
        ProcessorOptions::new("testnet", chain_id),
        pool.clone(),
        names,
        registry,
        Arc::new(handlers),
        rpc,
        NotificationBus::new(pool.clone()),
        cancel,
    )
    .await
    .unwrap()
}

async fn wait_until_processed(pool: &PgPool, names: &SchemaNames, chain_id: u64, block: u64) {
    let workers = ProcessWorkerStore::new(pool.clone(), &names.app);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(worker) = workers.get(chain_id).await.unwrap()
            && worker.current_block >= block
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "processor never reached block {block}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn chain_audit_handler(name: &'static str, chain_id: u64) -> Handler {
    Arc::new(move |ctx| {
        Box::pin(async move {
            ctx.db
                .insert("auditEntries")
                .values(json!({
                    "id": format!(
                        "{name}-{}-{}",
                        ctx.event.block.number, ctx.event.log.index
                    ),
                    "chainId": chain_id,
                    "blockNumber": ctx.event.block.number,
                    "handler": name,
                    "amount": ctx.event.arg("value").cloned().unwrap_or(Value::Null),
                    "note": ctx.event.name.clone(),
                }))
                .execute()
                .await?;
            Ok(())
        })
    })
}

async fn audit_rows(pool: &PgPool, names: &SchemaNames, chain_id: u64) -> Vec<(String, i64, String)> {
    sqlx::query_as(&format!(
        "SELECT id, block_number, handler FROM {}.audit_entries \
         WHERE chain_id = $1 ORDER BY block_number, id",
        names.app
    ))
    .bind(chain_id as i64)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn processes_events_in_order_with_checkpoints(pool: PgPool) {
    let chain_id = 92001;
    let (names, registry) = setup(&pool, chain_id).await;

    let mut events = Vec::new();
    for block in 100..=104u64 {
        for log_index in 0..2u32 {
            events.push(raw_event(&registry, "Transfer", chain_id, block, log_index, 1_000));
        }
    }
    seed(&pool, &names, &events).await;

    let mut handlers = HandlerRegistry::new();
    handlers
        .on(&registry, "Token:Transfer", chain_audit_handler("seq", chain_id))
        .unwrap();

    let cancel = CancellationToken::new();
    let processor = start_processor(
        &pool,
        &names,
        registry,
        handlers,
        Arc::new(MockRpc { calls: AtomicU32::new(0) }),
        chain_id,
        cancel.clone(),
    )
    .await;

    wait_until_processed(&pool, &names, chain_id, 104).await;
    processor.stop().await;

    let rows = audit_rows(&pool, &names, chain_id).await;
    assert_eq!(rows.len(), 10, "one audit row per decoded event");

    let worker = ProcessWorkerStore::new(pool.clone(), &names.app)
        .get(chain_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.events_processed, 10);
    assert!(worker.current_block >= 104);
    assert_eq!(worker.status, ProcessStatus::Live);

    // The per-handler checkpoint tracked the block transaction.
    let checkpoint: (i64,) = sqlx::query_as(&format!(
        "SELECT block_number FROM {}.process_checkpoints \
         WHERE chain_id = $1 AND handler_name = 'Token:Transfer#0'",
        names.app
    ))
    .bind(chain_id as i64)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(checkpoint.0, 104);
}

#[sqlx::test]
#[ignore]
async fn failing_handler_rolls_back_block_and_pauses_chain(pool: PgPool) {
    let chain_id = 92002;
    let (names, registry) = setup(&pool, chain_id).await;

    let mut events = Vec::new();
    for block in 100..=103u64 {
        events.push(raw_event(&registry, "Transfer", chain_id, block, 0, 1_000));
    }
    seed(&pool, &names, &events).await;

    let writer = chain_audit_handler("writer", chain_id);
    let poison: Handler = Arc::new(move |ctx| {
        let writer = Arc::clone(&writer);
        Box::pin(async move {
            // Write first, then fail on the poisoned block: the write must
            // never become visible.
            writer(ctx.clone()).await?;
            if ctx.event.block.number == 102 {
                return Err(kyomei_common::KyomeiError::Internal("boom".into()));
            }
            Ok(())
        })
    });

    let mut handlers = HandlerRegistry::new();
    handlers.on(&registry, "Token:Transfer", poison).unwrap();

    let cancel = CancellationToken::new();
    let processor = start_processor(
        &pool,
        &names,
        registry,
        handlers,
        Arc::new(MockRpc { calls: AtomicU32::new(0) }),
        chain_id,
        cancel.clone(),
    )
    .await;

    // Ten retries with backoff, then the chain pauses.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    while !processor.is_paused() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "chain never paused on failing handler"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    processor.stop().await;

    let rows = audit_rows(&pool, &names, chain_id).await;
    let blocks: Vec<i64> = rows.iter().map(|(_, b, _)| *b).collect();
    assert_eq!(blocks, vec![100, 101], "poisoned block left no effects");

    let worker = ProcessWorkerStore::new(pool.clone(), &names.app)
        .get(chain_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.current_block, 101);
}

#[sqlx::test]
#[ignore]
async fn cached_rpc_replays_without_upstream_calls(pool: PgPool) {
    let chain_id = 92003;
    let (names, registry) = setup(&pool, chain_id).await;

    let events = vec![
        raw_event(&registry, "Transfer", chain_id, 300, 0, 5),
        raw_event(&registry, "Transfer", chain_id, 301, 0, 7),
    ];
    seed(&pool, &names, &events).await;

    let rpc = Arc::new(MockRpc { calls: AtomicU32::new(0) });
    let reader: Handler = Arc::new(move |ctx| {
        Box::pin(async move {
            let decimals = ctx.rpc.read_contract(TOKEN, "0x313ce567").await?;
            ctx.db
                .insert("auditEntries")
                .values(json!({
                    "id": format!("read-{}", ctx.event.block.number),
                    "chainId": ctx.rpc.pinned_block(),
                    "blockNumber": ctx.event.block.number,
                    "handler": "reader",
                    "note": decimals,
                }))
                .execute()
                .await?;
            Ok(())
        })
    });

    let mut handlers = HandlerRegistry::new();
    handlers.on(&registry, "Token:Transfer", reader.clone()).unwrap();

    let cancel = CancellationToken::new();
    let processor = start_processor(
        &pool,
        &names,
        registry.clone(),
        handlers,
        rpc.clone(),
        chain_id,
        cancel,
    )
    .await;
    wait_until_processed(&pool, &names, chain_id, 301).await;
    processor.stop().await;

    // One upstream call per (block, request) key.
    assert_eq!(rpc.calls.load(Ordering::SeqCst), 2);

    let first_notes: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT note FROM {}.audit_entries WHERE handler = 'reader' ORDER BY block_number",
        names.app
    ))
    .fetch_all(&pool)
    .await
    .unwrap();

    // Wipe app state and replay from scratch; the upstream client must not
    // be touched again and the values must match byte for byte.
    sqlx::query(&format!("DELETE FROM {}.audit_entries", names.app))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!(
        "DELETE FROM {}.process_workers WHERE chain_id = {chain_id}",
        names.app
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "DELETE FROM {}.process_checkpoints WHERE chain_id = {chain_id}",
        names.app
    ))
    .execute(&pool)
    .await
    .unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.on(&registry, "Token:Transfer", reader).unwrap();

    let cancel = CancellationToken::new();
    let processor = start_processor(
        &pool,
        &names,
        registry,
        handlers,
        rpc.clone(),
        chain_id,
        cancel,
    )
    .await;
    wait_until_processed(&pool, &names, chain_id, 301).await;
    processor.stop().await;

    assert_eq!(rpc.calls.load(Ordering::SeqCst), 2, "replay hit the cache");

    let replay_notes: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT note FROM {}.audit_entries WHERE handler = 'reader' ORDER BY block_number",
        names.app
    ))
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(first_notes, replay_notes);
}

#[sqlx::test]
#[ignore]
async fn parallel_and_sequential_handlers_commit_together(pool: PgPool) {
    let chain_id = 92004;
    let (names, registry) = setup(&pool, chain_id).await;

    let events = vec![
        raw_event(&registry, "Transfer", chain_id, 400, 0, 11),
        raw_event(&registry, "Approval", chain_id, 400, 1, 13),
    ];
    seed(&pool, &names, &events).await;

    let mut handlers = HandlerRegistry::new();
    handlers
        .on_parallel(&registry, "Token:Transfer", chain_audit_handler("p1", chain_id))
        .unwrap();
    handlers
        .on_parallel(&registry, "Token:Transfer", chain_audit_handler("p2", chain_id))
        .unwrap();
    handlers
        .on(&registry, "Token:Approval", chain_audit_handler("s1", chain_id))
        .unwrap();

    let cancel = CancellationToken::new();
    let processor = start_processor(
        &pool,
        &names,
        registry,
        handlers,
        Arc::new(MockRpc { calls: AtomicU32::new(0) }),
        chain_id,
        cancel,
    )
    .await;
    wait_until_processed(&pool, &names, chain_id, 400).await;
    processor.stop().await;

    let rows = audit_rows(&pool, &names, chain_id).await;
    let mut handlers_seen: Vec<String> = rows.iter().map(|(_, _, h)| h.clone()).collect();
    handlers_seen.sort();
    assert_eq!(handlers_seen, vec!["p1", "p2", "s1"]);

    let worker = ProcessWorkerStore::new(pool.clone(), &names.app)
        .get(chain_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.events_processed, 2);
}
