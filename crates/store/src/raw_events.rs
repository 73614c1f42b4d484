use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use kyomei_common::error::Result;
use kyomei_common::types::RawEvent;

/// Postgres bind parameters are capped at 65535; 13 columns per row keeps
/// batches comfortably under it.
const INSERT_CHUNK_ROWS: usize = 1_000;

/// Idempotent, time-partitioned store of raw log rows.
#[derive(Clone)]
pub struct RawEventStore {
    pool: PgPool,
    schema: String,
}

#[derive(sqlx::FromRow)]
struct RawEventRow {
    chain_id: i64,
    block_number: i64,
    tx_index: i32,
    log_index: i32,
    block_hash: String,
    block_timestamp: DateTime<Utc>,
    tx_hash: String,
    address: String,
    topic0: String,
    topic1: Option<String>,
    topic2: Option<String>,
    topic3: Option<String>,
    data: String,
}

impl From<RawEventRow> for RawEvent {
    fn from(r: RawEventRow) -> Self {
        RawEvent {
            chain_id: r.chain_id as u64,
            block_number: r.block_number as u64,
            tx_index: r.tx_index as u32,
            log_index: r.log_index as u32,
            block_hash: r.block_hash,
            block_timestamp: r.block_timestamp,
            tx_hash: r.tx_hash,
            address: r.address,
            topic0: r.topic0,
            topic1: r.topic1,
            topic2: r.topic2,
            topic3: r.topic3,
            data: r.data,
        }
    }
}

impl RawEventStore {
    pub fn new(pool: PgPool, sync_schema: &str) -> Self {
        Self {
            pool,
            schema: sync_schema.to_string(),
        }
    }

    /// Append rows inside the caller's transaction. Duplicate keys are
    /// absorbed (`ON CONFLICT DO NOTHING`); returns the number of rows that
    /// were actually new.
    pub async fn insert_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[RawEvent],
    ) -> Result<u64> {
        let mut inserted = 0u64;

        for chunk in events.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {}.raw_events \
                 (chain_id, block_number, tx_index, log_index, block_hash, block_timestamp, \
                  tx_hash, address, topic0, topic1, topic2, topic3, data) ",
                self.schema
            ));
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.chain_id as i64)
                    .push_bind(e.block_number as i64)
                    .push_bind(e.tx_index as i32)
                    .push_bind(e.log_index as i32)
                    .push_bind(&e.block_hash)
                    .push_bind(e.block_timestamp)
                    .push_bind(&e.tx_hash)
                    .push_bind(&e.address)
                    .push_bind(&e.topic0)
                    .push_bind(&e.topic1)
                    .push_bind(&e.topic2)
                    .push_bind(&e.topic3)
                    .push_bind(&e.data);
            });
            qb.push(" ON CONFLICT DO NOTHING");

            let result = qb.build().execute(&mut **tx).await?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    /// Ordered scan of `(from, to]` for one chain.
    pub async fn range(&self, chain_id: u64, from_exclusive: u64, to_inclusive: u64) -> Result<Vec<RawEvent>> {
        let rows: Vec<RawEventRow> = sqlx::query_as(&format!(
            "SELECT chain_id, block_number, tx_index, log_index, block_hash, block_timestamp, \
                    tx_hash, address, topic0, topic1, topic2, topic3, data \
             FROM {}.raw_events \
             WHERE chain_id = $1 AND block_number > $2 AND block_number <= $3 \
             ORDER BY block_number, tx_index, log_index",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(from_exclusive as i64)
        .bind(to_inclusive as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Greatest committed block for a chain; the fallback watermark when a
    /// bus notification was missed.
    pub async fn max_block(&self, chain_id: u64) -> Result<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as(&format!(
            "SELECT MAX(block_number) FROM {}.raw_events WHERE chain_id = $1",
            self.schema
        ))
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.map(|b| b as u64))
    }

    /// Committed block hashes over an inclusive window, for reorg checks.
    pub async fn block_hashes(&self, chain_id: u64, from: u64, to: u64) -> Result<HashMap<u64, String>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
            "SELECT DISTINCT block_number, block_hash FROM {}.raw_events \
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(b, h)| (b as u64, h)).collect())
    }

    /// Drop rows for a block whose hash no longer matches the canonical
    /// chain. Runs inside the caller's reorg-repair transaction.
    pub async fn delete_stale_block(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain_id: u64,
        block_number: u64,
        canonical_hash: &str,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {}.raw_events \
             WHERE chain_id = $1 AND block_number = $2 AND block_hash <> $3",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .bind(canonical_hash)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }
}
