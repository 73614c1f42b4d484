use sqlx::PgPool;

use kyomei_common::config::SchemaNames;
use kyomei_common::error::{KyomeiError, Result};

/// Apply any pending schema versions.
///
/// Versions already recorded in `public.migrations` are skipped; each
/// pending version runs all of its statements plus the version insert in a
/// single transaction, so a crash mid-bootstrap leaves a resumable state.
pub async fn bootstrap(pool: &PgPool, names: &SchemaNames) -> Result<()> {
    for schema in [&names.sync, &names.app, &names.crons] {
        validate_identifier(schema)?;
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS public.migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<(i32,)> = sqlx::query_as("SELECT version FROM public.migrations")
        .fetch_all(pool)
        .await?;
    let applied: std::collections::HashSet<i32> = applied.into_iter().map(|(v,)| v).collect();

    for (version, statements) in migrations(names) {
        if applied.contains(&version) {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO public.migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version, "Applied schema migration");
    }

    Ok(())
}

/// Schema names come from config and end up interpolated into SQL, so they
/// must be plain lowercase identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid && !name.is_empty() && name.len() <= 63 {
        Ok(())
    } else {
        Err(KyomeiError::Config(format!(
            "'{name}' is not a valid schema identifier"
        )))
    }
}

fn migrations(n: &SchemaNames) -> Vec<(i32, Vec<String>)> {
    let sync = &n.sync;
    let app = &n.app;
    let crons = &n.crons;

    vec![
        (
            1,
            vec![
                format!("CREATE SCHEMA IF NOT EXISTS {sync}"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {sync}.raw_events (
                        chain_id BIGINT NOT NULL,
                        block_number BIGINT NOT NULL,
                        tx_index INTEGER NOT NULL,
                        log_index INTEGER NOT NULL,
                        block_hash TEXT NOT NULL,
                        block_timestamp TIMESTAMPTZ NOT NULL,
                        tx_hash TEXT NOT NULL,
                        address TEXT NOT NULL,
                        topic0 TEXT NOT NULL,
                        topic1 TEXT,
                        topic2 TEXT,
                        topic3 TEXT,
                        data TEXT NOT NULL,
                        PRIMARY KEY (chain_id, block_number, tx_index, log_index)
                    )"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS raw_events_address_idx
                     ON {sync}.raw_events (chain_id, address, block_number)"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {sync}.sync_workers (
                        chain_id BIGINT NOT NULL,
                        worker_id INTEGER NOT NULL,
                        range_start BIGINT NOT NULL,
                        range_end BIGINT,
                        current_block BIGINT NOT NULL,
                        status TEXT NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        PRIMARY KEY (chain_id, worker_id)
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {sync}.factory_children (
                        chain_id BIGINT NOT NULL,
                        child_address TEXT NOT NULL,
                        factory_address TEXT NOT NULL,
                        contract_name TEXT NOT NULL,
                        discovered_block BIGINT NOT NULL,
                        discovered_tx TEXT NOT NULL,
                        child_abi TEXT,
                        PRIMARY KEY (chain_id, child_address)
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {sync}.rpc_cache (
                        chain_id BIGINT NOT NULL,
                        block_number BIGINT NOT NULL,
                        request_hash TEXT NOT NULL,
                        method TEXT NOT NULL,
                        params JSONB NOT NULL,
                        response JSONB NOT NULL,
                        PRIMARY KEY (chain_id, block_number, request_hash)
                    )"
                ),
            ],
        ),
        (
            2,
            vec![
                format!("CREATE SCHEMA IF NOT EXISTS {app}"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {app}.process_workers (
                        chain_id BIGINT PRIMARY KEY,
                        range_start BIGINT NOT NULL,
                        range_end BIGINT,
                        current_block BIGINT NOT NULL,
                        events_processed BIGINT NOT NULL DEFAULT 0,
                        status TEXT NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {app}.process_checkpoints (
                        chain_id BIGINT NOT NULL,
                        handler_name TEXT NOT NULL,
                        block_number BIGINT NOT NULL,
                        PRIMARY KEY (chain_id, handler_name)
                    )"
                ),
            ],
        ),
        (
            3,
            vec![
                format!("CREATE SCHEMA IF NOT EXISTS {crons}"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {crons}.cron_jobs (
                        name TEXT PRIMARY KEY,
                        schedule JSONB NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {crons}.cron_executions (
                        id UUID PRIMARY KEY,
                        job_name TEXT NOT NULL,
                        status TEXT NOT NULL,
                        started_at TIMESTAMPTZ NOT NULL,
                        finished_at TIMESTAMPTZ,
                        duration_ms BIGINT,
                        error TEXT
                    )"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {crons}.cron_checkpoints (
                        job_name TEXT NOT NULL,
                        chain_id BIGINT NOT NULL,
                        last_block_number BIGINT NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        PRIMARY KEY (job_name, chain_id)
                    )"
                ),
            ],
        ),
    ]
}
