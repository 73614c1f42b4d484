//! Integration tests for the persistence layer.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p kyomei-store --test integration -- --ignored --nocapture
//! ```

use chrono::Utc;
use sqlx::PgPool;

use kyomei_common::config::SchemaNames;
use kyomei_common::types::{FactoryChild, ProcessStatus, RawEvent, RpcCacheRow, SyncStatus};
use kyomei_store::{
    CronStore, FactoryChildStore, ProcessWorkerStore, RawEventStore, RpcCacheStore,
    SyncWorkerStore, schema,
};

const CHAIN: u64 = 31337;

async fn setup(pool: &PgPool) -> SchemaNames {
    let names = SchemaNames::default();
    schema::bootstrap(pool, &names).await.unwrap();

    for table in ["raw_events", "sync_workers", "factory_children", "rpc_cache"] {
        sqlx::query(&format!(
            "DELETE FROM {}.{table} WHERE chain_id = {CHAIN}",
            names.sync
        ))
        .execute(pool)
        .await
        .unwrap();
    }
    sqlx::query(&format!(
        "DELETE FROM {}.process_workers WHERE chain_id = {CHAIN}",
        names.app
    ))
    .execute(pool)
    .await
    .unwrap();
    for table in ["cron_executions", "cron_checkpoints", "cron_jobs"] {
        sqlx::query(&format!("DELETE FROM {}.{table}", names.crons))
            .execute(pool)
            .await
            .unwrap();
    }

    names
}

fn make_event(block_number: u64, log_index: u32) -> RawEvent {
    RawEvent {
        chain_id: CHAIN,
        block_number,
        tx_index: 0,
        log_index,
        block_hash: format!("0x{:064x}", block_number),
        block_timestamp: Utc::now(),
        tx_hash: format!("0x{:064x}", block_number * 1000 + log_index as u64),
        address: "0x0000000000000000000000000000000000001234".to_string(),
        topic0: format!("0x{:064x}", 0xddf2u64),
        topic1: None,
        topic2: None,
        topic3: None,
        data: "0x".to_string(),
    }
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn raw_event_batches_are_idempotent(pool: PgPool) {
    let names = setup(&pool).await;
    let store = RawEventStore::new(pool.clone(), &names.sync);

    let events = vec![make_event(100, 0), make_event(100, 1), make_event(101, 0)];

    let mut tx = pool.begin().await.unwrap();
    let inserted = store.insert_batch(&mut tx, &events).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(inserted, 3);

    // Same batch again: every row conflicts away.
    let mut tx = pool.begin().await.unwrap();
    let inserted = store.insert_batch(&mut tx, &events).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(inserted, 0);

    let rows = store.range(CHAIN, 99, 101).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].block_number, 100);
    assert_eq!(rows[0].log_index, 0);
    assert_eq!(rows[1].log_index, 1);
    assert_eq!(rows[2].block_number, 101);

    assert_eq!(store.max_block(CHAIN).await.unwrap(), Some(101));
}

#[sqlx::test]
#[ignore]
async fn stale_block_rows_are_deleted_on_reorg(pool: PgPool) {
    let names = setup(&pool).await;
    let store = RawEventStore::new(pool.clone(), &names.sync);

    let mut stale = make_event(200, 0);
    stale.block_hash = format!("0x{:064x}", 0xaaaau64);

    let mut tx = pool.begin().await.unwrap();
    store.insert_batch(&mut tx, &[stale]).await.unwrap();
    tx.commit().await.unwrap();

    let canonical_hash = format!("0x{:064x}", 0xbbbbu64);
    let mut tx = pool.begin().await.unwrap();
    let deleted = store
        .delete_stale_block(&mut tx, CHAIN, 200, &canonical_hash)
        .await
        .unwrap();
    let mut replacement = make_event(200, 0);
    replacement.block_hash = canonical_hash.clone();
    let mut second = make_event(200, 1);
    second.block_hash = canonical_hash.clone();
    store.insert_batch(&mut tx, &[replacement, second]).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(deleted, 1);
    let rows = store.range(CHAIN, 199, 200).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.block_hash == canonical_hash));
}

#[sqlx::test]
#[ignore]
async fn sync_worker_lifecycle(pool: PgPool) {
    let names = setup(&pool).await;
    let store = SyncWorkerStore::new(pool.clone(), &names.sync);

    store.insert_historical(CHAIN, 1, 100, 149).await.unwrap();
    store.insert_historical(CHAIN, 2, 150, 199).await.unwrap();
    let live = store.upsert_live(CHAIN, 199).await.unwrap();
    assert_eq!(live.worker_id, 0);
    assert_eq!(live.current_block, 199);

    assert!(!store.historical_done(CHAIN).await.unwrap());

    let mut tx = pool.begin().await.unwrap();
    store.advance(&mut tx, CHAIN, 1, 149).await.unwrap();
    tx.commit().await.unwrap();
    store.complete(CHAIN, 1).await.unwrap();

    let workers = store.list(CHAIN).await.unwrap();
    let w1 = workers.iter().find(|w| w.worker_id == 1).unwrap();
    assert_eq!(w1.status, SyncStatus::Completed);
    assert_eq!(w1.current_block, 149);

    store.complete(CHAIN, 2).await.unwrap();
    assert!(store.historical_done(CHAIN).await.unwrap());

    // The live checkpoint never rewinds.
    let live = store.upsert_live(CHAIN, 150).await.unwrap();
    assert_eq!(live.current_block, 199);

    assert_eq!(store.next_worker_id(CHAIN).await.unwrap(), 3);
}

#[sqlx::test]
#[ignore]
async fn process_worker_monotonic_advance(pool: PgPool) {
    let names = setup(&pool).await;
    let store = ProcessWorkerStore::new(pool.clone(), &names.app);

    let worker = store.ensure(CHAIN, 100).await.unwrap();
    assert_eq!(worker.current_block, 99);
    assert_eq!(worker.events_processed, 0);

    let mut tx = pool.begin().await.unwrap();
    store
        .advance(&mut tx, CHAIN, 150, 42, ProcessStatus::Processing)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // A lower block does not rewind the checkpoint.
    let mut tx = pool.begin().await.unwrap();
    store
        .advance(&mut tx, CHAIN, 120, 5, ProcessStatus::Live)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let worker = store.get(CHAIN).await.unwrap().unwrap();
    assert_eq!(worker.current_block, 150);
    assert_eq!(worker.events_processed, 47);
    assert_eq!(worker.status, ProcessStatus::Live);
}

#[sqlx::test]
#[ignore]
async fn factory_children_unique_per_chain(pool: PgPool) {
    let names = setup(&pool).await;
    let store = FactoryChildStore::new(pool.clone(), &names.sync);

    let child = FactoryChild {
        chain_id: CHAIN,
        child_address: "0xcccccccccccccccccccccccccccccccccccccccc".to_string(),
        factory_address: "0x2222222222222222222222222222222222222222".to_string(),
        contract_name: "Pair".to_string(),
        discovered_block: 150,
        discovered_tx: format!("0x{:064x}", 150_000u64),
        child_abi: None,
    };

    let mut tx = pool.begin().await.unwrap();
    assert!(store.insert(&mut tx, &child).await.unwrap());
    // Rediscovery along any path is not a new row.
    assert!(!store.insert(&mut tx, &child).await.unwrap());
    tx.commit().await.unwrap();

    let children = store.children(CHAIN).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].contract_name, "Pair");
}

#[sqlx::test]
#[ignore]
async fn rpc_cache_first_write_wins(pool: PgPool) {
    let names = setup(&pool).await;
    let store = RpcCacheStore::new(pool.clone(), &names.sync);

    let row = RpcCacheRow {
        chain_id: CHAIN,
        block_number: 300,
        request_hash: format!("0x{:064x}", 1u64),
        method: "eth_call".to_string(),
        params: serde_json::json!({ "to": "0x1234", "data": "0x313ce567" }),
        response: serde_json::json!("0x12"),
    };
    store.put(&row).await.unwrap();

    let mut conflicting = row.clone();
    conflicting.response = serde_json::json!("0x99");
    store.put(&conflicting).await.unwrap();

    let cached = store
        .get(CHAIN, 300, &row.request_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached, serde_json::json!("0x12"));
}

#[sqlx::test]
#[ignore]
async fn cron_lease_blocks_contenders(pool: PgPool) {
    let names = setup(&pool).await;
    let store = CronStore::new(pool.clone(), &names.crons);

    store
        .ensure_job("hourly", &serde_json::json!({ "kind": "time", "expr": "0 0 * * * *" }))
        .await
        .unwrap();

    let mut holder = pool.begin().await.unwrap();
    assert!(store.lease(&mut holder, "hourly").await.unwrap());

    // While the first transaction holds the row lock, a contender skips.
    let mut contender = pool.begin().await.unwrap();
    assert!(!store.lease(&mut contender, "hourly").await.unwrap());
    contender.rollback().await.unwrap();

    holder.commit().await.unwrap();

    let mut after = pool.begin().await.unwrap();
    assert!(store.lease(&mut after, "hourly").await.unwrap());
    after.rollback().await.unwrap();
}

#[sqlx::test]
#[ignore]
async fn cron_execution_and_checkpoint_round_trip(pool: PgPool) {
    let names = setup(&pool).await;
    let store = CronStore::new(pool.clone(), &names.crons);

    store
        .ensure_job("snapshot", &serde_json::json!({ "kind": "block", "interval": 100 }))
        .await
        .unwrap();

    let id = store.start_execution("snapshot").await.unwrap();
    store
        .finish_execution(id, kyomei_common::types::CronStatus::Success, 12, None)
        .await
        .unwrap();

    let executions = store.executions("snapshot", 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, kyomei_common::types::CronStatus::Success);
    assert_eq!(executions[0].duration_ms, Some(12));

    store.set_checkpoint("snapshot", CHAIN, 107).await.unwrap();
    store.set_checkpoint("snapshot", CHAIN, 207).await.unwrap();
    // Checkpoints never move backwards either.
    store.set_checkpoint("snapshot", CHAIN, 150).await.unwrap();

    let checkpoint = store.checkpoint("snapshot", CHAIN).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_block_number, 207);
}
