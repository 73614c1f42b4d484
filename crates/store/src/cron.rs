use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use kyomei_common::error::Result;
use kyomei_common::types::{CronCheckpoint, CronExecution, CronStatus};

/// Cron jobs, per-run execution records, and per-(job, chain) checkpoints.
#[derive(Clone)]
pub struct CronStore {
    pool: PgPool,
    schema: String,
}

impl CronStore {
    pub fn new(pool: PgPool, crons_schema: &str) -> Self {
        Self {
            pool,
            schema: crons_schema.to_string(),
        }
    }

    /// Register the job row a lease can lock against. The schedule is stored
    /// for operator inspection; config stays authoritative.
    pub async fn ensure_job(&self, name: &str, schedule: &serde_json::Value) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.cron_jobs (name, schedule) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET schedule = EXCLUDED.schedule",
            self.schema
        ))
        .bind(name)
        .bind(schedule)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Row-level lease on the job for the duration of the caller's
    /// transaction. Returns false when another runner holds it; contending
    /// runners skip the fire rather than wait.
    pub async fn lease(&self, tx: &mut Transaction<'_, Postgres>, name: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT name FROM {}.cron_jobs WHERE name = $1 FOR UPDATE SKIP LOCKED",
            self.schema
        ))
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.is_some())
    }

    pub async fn start_execution(&self, job_name: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(&format!(
            "INSERT INTO {}.cron_executions (id, job_name, status, started_at) \
             VALUES ($1, $2, $3, now())",
            self.schema
        ))
        .bind(id)
        .bind(job_name)
        .bind(CronStatus::Running.to_string())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn finish_execution(
        &self,
        id: Uuid,
        status: CronStatus,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {}.cron_executions \
             SET status = $2, finished_at = now(), duration_ms = $3, error = $4 \
             WHERE id = $1",
            self.schema
        ))
        .bind(id)
        .bind(status.to_string())
        .bind(duration_ms)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn executions(&self, job_name: &str, limit: i64) -> Result<Vec<CronExecution>> {
        let rows: Vec<(Uuid, String, String, DateTime<Utc>, Option<DateTime<Utc>>, Option<i64>, Option<String>)> =
            sqlx::query_as(&format!(
                "SELECT id, job_name, status, started_at, finished_at, duration_ms, error \
                 FROM {}.cron_executions WHERE job_name = $1 \
                 ORDER BY started_at DESC LIMIT $2",
                self.schema
            ))
            .bind(job_name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, job_name, status, started_at, finished_at, duration_ms, error)| {
                CronExecution {
                    id,
                    job_name,
                    status: match status.as_str() {
                        "running" => CronStatus::Running,
                        "success" => CronStatus::Success,
                        _ => CronStatus::Failed,
                    },
                    started_at,
                    finished_at,
                    duration_ms,
                    error,
                }
            })
            .collect())
    }

    pub async fn checkpoint(&self, job_name: &str, chain_id: u64) -> Result<Option<CronCheckpoint>> {
        let row: Option<(String, i64, i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT job_name, chain_id, last_block_number, updated_at \
             FROM {}.cron_checkpoints WHERE job_name = $1 AND chain_id = $2",
            self.schema
        ))
        .bind(job_name)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(job_name, chain_id, last_block_number, updated_at)| CronCheckpoint {
            job_name,
            chain_id: chain_id as u64,
            last_block_number: last_block_number as u64,
            updated_at,
        }))
    }

    /// Checkpoints advance only on success; the caller invokes this after a
    /// run reports `CronStatus::Success`.
    pub async fn set_checkpoint(&self, job_name: &str, chain_id: u64, block: u64) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.cron_checkpoints (job_name, chain_id, last_block_number) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (job_name, chain_id) DO UPDATE SET \
                last_block_number = GREATEST({}.cron_checkpoints.last_block_number, EXCLUDED.last_block_number), \
                updated_at = now()",
            self.schema, self.schema
        ))
        .bind(job_name)
        .bind(chain_id as i64)
        .bind(block as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
