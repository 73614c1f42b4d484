use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use kyomei_common::error::Result;
use kyomei_common::types::{ProcessStatus, ProcessWorker};

/// The per-chain processing checkpoint. `current_block` is monotonic: the
/// update takes `GREATEST` so a replayed transaction can never rewind it.
#[derive(Clone)]
pub struct ProcessWorkerStore {
    pool: PgPool,
    schema: String,
}

#[derive(sqlx::FromRow)]
struct ProcessWorkerRow {
    chain_id: i64,
    range_start: i64,
    range_end: Option<i64>,
    current_block: i64,
    events_processed: i64,
    status: ProcessStatus,
    updated_at: DateTime<Utc>,
}

impl From<ProcessWorkerRow> for ProcessWorker {
    fn from(r: ProcessWorkerRow) -> Self {
        ProcessWorker {
            chain_id: r.chain_id as u64,
            range_start: r.range_start as u64,
            range_end: r.range_end.map(|b| b as u64),
            current_block: r.current_block as u64,
            events_processed: r.events_processed as u64,
            status: r.status,
            updated_at: r.updated_at,
        }
    }
}

impl ProcessWorkerStore {
    pub fn new(pool: PgPool, app_schema: &str) -> Self {
        Self {
            pool,
            schema: app_schema.to_string(),
        }
    }

    pub async fn get(&self, chain_id: u64) -> Result<Option<ProcessWorker>> {
        let row: Option<ProcessWorkerRow> = sqlx::query_as(&format!(
            "SELECT chain_id, range_start, range_end, current_block, events_processed, \
                    status, updated_at \
             FROM {}.process_workers WHERE chain_id = $1",
            self.schema
        ))
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Create the row on first run. The reader consumes `(current_block,
    /// watermark]`, so a fresh row starts one block before `range_start`.
    pub async fn ensure(&self, chain_id: u64, range_start: u64) -> Result<ProcessWorker> {
        let row: ProcessWorkerRow = sqlx::query_as(&format!(
            "INSERT INTO {}.process_workers \
             (chain_id, range_start, range_end, current_block, events_processed, status) \
             VALUES ($1, $2, NULL, $3, 0, $4) \
             ON CONFLICT (chain_id) DO UPDATE SET updated_at = now() \
             RETURNING chain_id, range_start, range_end, current_block, events_processed, \
                       status, updated_at",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(range_start as i64)
        .bind(range_start.saturating_sub(1) as i64)
        .bind(ProcessStatus::Processing.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Advance the checkpoint inside the caller's block transaction.
    pub async fn advance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain_id: u64,
        current_block: u64,
        events_delta: u64,
        status: ProcessStatus,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.process_workers \
             SET current_block = GREATEST(current_block, $2), \
                 events_processed = events_processed + $3, \
                 status = $4, \
                 updated_at = now() \
             WHERE chain_id = $1",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(current_block as i64)
        .bind(events_delta as i64)
        .bind(status.to_string())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
