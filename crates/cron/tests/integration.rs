//! Cron scheduler scenarios: block-interval firing with offsets and
//! checkpoints, and leased time-cron execution.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p kyomei-cron --test integration -- --ignored --nocapture
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use kyomei_common::config::{CronConfig, SchemaNames};
use kyomei_common::types::CronStatus;
use kyomei_cron::{CronContext, CronHandler, CronJob, CronScheduler};
use kyomei_store::{CronStore, SyncWorkerStore, schema};

async fn setup(pool: &PgPool, chain_id: u64) -> SchemaNames {
    let names = SchemaNames::default();
    schema::bootstrap(pool, &names).await.unwrap();

    for table in ["cron_executions", "cron_checkpoints", "cron_jobs"] {
        sqlx::query(&format!("DELETE FROM {}.{table}", names.crons))
            .execute(pool)
            .await
            .unwrap();
    }
    sqlx::query(&format!(
        "DELETE FROM {}.sync_workers WHERE chain_id = {chain_id}",
        names.sync
    ))
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.snapshots (
            id TEXT PRIMARY KEY,
            block_number BIGINT,
            job TEXT NOT NULL
        )",
        names.crons
    ))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(&format!("DELETE FROM {}.snapshots", names.crons))
        .execute(pool)
        .await
        .unwrap();

    names
}

fn cron_config(name: &str, schedule: &str) -> CronConfig {
    let schedule: serde_json::Value = serde_json::from_str(schedule).unwrap();
    serde_json::from_value(json!({ "name": name, "schedule": schedule, "schema": "dedicated" }))
        .unwrap()
}

fn recording_handler(fired: Arc<Mutex<Vec<u64>>>) -> CronHandler {
    Arc::new(move |ctx: CronContext| {
        let fired = Arc::clone(&fired);
        Box::pin(async move {
            let block = ctx.trigger_block.unwrap_or_default();
            fired.lock().unwrap().push(block);
            ctx.db
                .insert("snapshots")
                .values(json!({
                    "id": format!("{}-{block}", ctx.job),
                    "blockNumber": block,
                    "job": ctx.job.clone(),
                }))
                .execute()
                .await?;
            Ok(())
        })
    })
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn block_cron_fires_on_offset_multiples(pool: PgPool) {
    let chain_id = 93001;
    let names = setup(&pool, chain_id).await;

    // The syncer has durably committed through block 250.
    SyncWorkerStore::new(pool.clone(), &names.sync)
        .upsert_live(chain_id, 250)
        .await
        .unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let job = CronJob {
        config: cron_config(
            "snapshot",
            r#"{ "kind": "block", "chain": "testnet", "interval": 100, "offset": 7 }"#,
        ),
        chain_id: Some(chain_id),
        rpc: None,
        handler: recording_handler(Arc::clone(&fired)),
    };

    let cancel = CancellationToken::new();
    let scheduler = CronScheduler::start(vec![job], pool.clone(), &names, cancel.clone())
        .await
        .unwrap();

    let store = CronStore::new(pool.clone(), &names.crons);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(checkpoint) = store.checkpoint("snapshot", chain_id).await.unwrap()
            && checkpoint.last_block_number == 207
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "checkpoint never reached 207"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    scheduler.stop().await;

    assert_eq!(*fired.lock().unwrap(), vec![107, 207]);

    let rows: Vec<(i64,)> = sqlx::query_as(&format!(
        "SELECT block_number FROM {}.snapshots ORDER BY block_number",
        names.crons
    ))
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![(107,), (207,)]);

    let executions = store.executions("snapshot", 10).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|e| e.status == CronStatus::Success));
}

#[sqlx::test]
#[ignore]
async fn failed_run_is_persisted_and_checkpoint_held_back(pool: PgPool) {
    let chain_id = 93002;
    let names = setup(&pool, chain_id).await;

    SyncWorkerStore::new(pool.clone(), &names.sync)
        .upsert_live(chain_id, 120)
        .await
        .unwrap();

    let handler: CronHandler = Arc::new(|_ctx| {
        Box::pin(async { Err(kyomei_common::KyomeiError::Internal("flaky job".into())) })
    });
    let job = CronJob {
        config: cron_config(
            "flaky",
            r#"{ "kind": "block", "chain": "testnet", "interval": 100, "offset": 0 }"#,
        ),
        chain_id: Some(chain_id),
        rpc: None,
        handler,
    };

    let cancel = CancellationToken::new();
    let scheduler = CronScheduler::start(vec![job], pool.clone(), &names, cancel.clone())
        .await
        .unwrap();

    let store = CronStore::new(pool.clone(), &names.crons);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let executions = store.executions("flaky", 10).await.unwrap();
        if !executions.is_empty() {
            assert_eq!(executions[0].status, CronStatus::Failed);
            assert_eq!(executions[0].error.as_deref(), Some("Internal error: flaky job"));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "failed execution never recorded"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    scheduler.stop().await;

    // Failure never advances the persisted checkpoint.
    assert!(store.checkpoint("flaky", chain_id).await.unwrap().is_none());
}

#[sqlx::test]
#[ignore]
async fn time_cron_executes_on_schedule(pool: PgPool) {
    let chain_id = 93003;
    let names = setup(&pool, chain_id).await;

    let fired = Arc::new(Mutex::new(Vec::new()));
    let job = CronJob {
        config: cron_config("everySecond", r#"{ "kind": "time", "expr": "* * * * * *" }"#),
        chain_id: None,
        rpc: None,
        handler: recording_handler(Arc::clone(&fired)),
    };

    let cancel = CancellationToken::new();
    let scheduler = CronScheduler::start(vec![job], pool.clone(), &names, cancel.clone())
        .await
        .unwrap();

    let store = CronStore::new(pool.clone(), &names.crons);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let executions = store.executions("everySecond", 10).await.unwrap();
        if executions.iter().any(|e| e.status == CronStatus::Success) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "time cron never fired"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    scheduler.stop().await;
}
