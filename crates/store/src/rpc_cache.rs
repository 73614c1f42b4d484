use sqlx::PgPool;

use kyomei_common::error::Result;
use kyomei_common::types::RpcCacheRow;

/// Deterministic RPC response cache keyed by
/// `(chain_id, block_number, request_hash)`. A read at the same key must
/// return the same bytes forever, so writes never overwrite.
#[derive(Clone)]
pub struct RpcCacheStore {
    pool: PgPool,
    schema: String,
}

impl RpcCacheStore {
    pub fn new(pool: PgPool, sync_schema: &str) -> Self {
        Self {
            pool,
            schema: sync_schema.to_string(),
        }
    }

    pub async fn get(
        &self,
        chain_id: u64,
        block_number: u64,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&format!(
            "SELECT response FROM {}.rpc_cache \
             WHERE chain_id = $1 AND block_number = $2 AND request_hash = $3",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(v,)| v))
    }

    /// Concurrent identical misses race benignly: first write wins, the
    /// conflict is dropped.
    pub async fn put(&self, row: &RpcCacheRow) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.rpc_cache \
             (chain_id, block_number, request_hash, method, params, response) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (chain_id, block_number, request_hash) DO NOTHING",
            self.schema
        ))
        .bind(row.chain_id as i64)
        .bind(row.block_number as i64)
        .bind(&row.request_hash)
        .bind(&row.method)
        .bind(&row.params)
        .bind(&row.response)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
