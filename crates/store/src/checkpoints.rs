use sqlx::{PgPool, Postgres, Transaction};

use kyomei_common::error::Result;

/// Optional per-handler progress index. The process-worker row stays
/// canonical; this table exists for per-handler catch-up semantics and is
/// written inside the same block transaction.
#[derive(Clone)]
pub struct CheckpointStore {
    pool: PgPool,
    schema: String,
}

impl CheckpointStore {
    pub fn new(pool: PgPool, app_schema: &str) -> Self {
        Self {
            pool,
            schema: app_schema.to_string(),
        }
    }

    pub async fn get(&self, chain_id: u64, handler_name: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT block_number FROM {}.process_checkpoints \
             WHERE chain_id = $1 AND handler_name = $2",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(b,)| b as u64))
    }

    pub async fn set(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain_id: u64,
        handler_name: &str,
        block_number: u64,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.process_checkpoints (chain_id, handler_name, block_number) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (chain_id, handler_name) DO UPDATE SET \
                block_number = GREATEST({}.process_checkpoints.block_number, EXCLUDED.block_number)",
            self.schema, self.schema
        ))
        .bind(chain_id as i64)
        .bind(handler_name)
        .bind(block_number as i64)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
