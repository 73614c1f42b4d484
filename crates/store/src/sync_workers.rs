use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use kyomei_common::error::Result;
use kyomei_common::types::{LIVE_WORKER_ID, SyncStatus, SyncWorker};

/// Persisted coordination state for sync workers. This table is the single
/// source of truth for restartability; `advance` runs inside the same
/// transaction as the page's raw-event insert.
#[derive(Clone)]
pub struct SyncWorkerStore {
    pool: PgPool,
    schema: String,
}

#[derive(sqlx::FromRow)]
struct SyncWorkerRow {
    chain_id: i64,
    worker_id: i32,
    range_start: i64,
    range_end: Option<i64>,
    current_block: i64,
    status: SyncStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SyncWorkerRow> for SyncWorker {
    fn from(r: SyncWorkerRow) -> Self {
        SyncWorker {
            chain_id: r.chain_id as u64,
            worker_id: r.worker_id,
            range_start: r.range_start as u64,
            range_end: r.range_end.map(|b| b as u64),
            current_block: r.current_block as u64,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl SyncWorkerStore {
    pub fn new(pool: PgPool, sync_schema: &str) -> Self {
        Self {
            pool,
            schema: sync_schema.to_string(),
        }
    }

    pub async fn list(&self, chain_id: u64) -> Result<Vec<SyncWorker>> {
        let rows: Vec<SyncWorkerRow> = sqlx::query_as(&format!(
            "SELECT chain_id, worker_id, range_start, range_end, current_block, status, \
                    created_at, updated_at \
             FROM {}.sync_workers WHERE chain_id = $1 ORDER BY worker_id",
            self.schema
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Insert a fresh historical worker lease. `current_block` starts at
    /// `range_start`; the worker's first page re-covers that block, which is
    /// harmless because raw-event inserts are idempotent.
    pub async fn insert_historical(
        &self,
        chain_id: u64,
        worker_id: i32,
        range_start: u64,
        range_end: u64,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.sync_workers \
             (chain_id, worker_id, range_start, range_end, current_block, status) \
             VALUES ($1, $2, $3, $4, $3, $5) \
             ON CONFLICT (chain_id, worker_id) DO NOTHING",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(worker_id)
        .bind(range_start as i64)
        .bind(range_end as i64)
        .bind(SyncStatus::Historical.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the tip follower (worker id 0). `current_block` never moves
    /// backwards: an old follower that outran the new finalized tip keeps
    /// its progress.
    pub async fn upsert_live(&self, chain_id: u64, finalized: u64) -> Result<SyncWorker> {
        let row: SyncWorkerRow = sqlx::query_as(&format!(
            "INSERT INTO {}.sync_workers \
             (chain_id, worker_id, range_start, range_end, current_block, status) \
             VALUES ($1, $2, $3, NULL, $3, $4) \
             ON CONFLICT (chain_id, worker_id) DO UPDATE SET \
                current_block = GREATEST({}.sync_workers.current_block, EXCLUDED.current_block), \
                status = EXCLUDED.status, \
                updated_at = now() \
             RETURNING chain_id, worker_id, range_start, range_end, current_block, status, \
                       created_at, updated_at",
            self.schema, self.schema
        ))
        .bind(chain_id as i64)
        .bind(LIVE_WORKER_ID)
        .bind(finalized as i64)
        .bind(SyncStatus::Live.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Move a worker's checkpoint inside the caller's page transaction.
    pub async fn advance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain_id: u64,
        worker_id: i32,
        current_block: u64,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.sync_workers \
             SET current_block = $3, updated_at = now() \
             WHERE chain_id = $1 AND worker_id = $2",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(worker_id)
        .bind(current_block as i64)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Terminal transition for a historical worker.
    pub async fn complete(&self, chain_id: u64, worker_id: i32) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.sync_workers \
             SET status = $3, updated_at = now() \
             WHERE chain_id = $1 AND worker_id = $2",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(worker_id)
        .bind(SyncStatus::Completed.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// True once no historical worker is still running for the chain; the
    /// gate the live follower waits behind.
    pub async fn historical_done(&self, chain_id: u64) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {}.sync_workers \
             WHERE chain_id = $1 AND status = $2",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(SyncStatus::Historical.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 == 0)
    }

    /// Next free historical worker id (live worker holds 0).
    pub async fn next_worker_id(&self, chain_id: u64) -> Result<i32> {
        let row: (Option<i32>,) = sqlx::query_as(&format!(
            "SELECT MAX(worker_id) FROM {}.sync_workers WHERE chain_id = $1",
            self.schema
        ))
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.unwrap_or(0) + 1)
    }
}
