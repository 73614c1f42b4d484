use sqlx::{PgPool, Postgres, Transaction};

use kyomei_common::error::Result;
use kyomei_common::types::FactoryChild;

/// Append-only registry of factory-discovered child contracts, unique per
/// `(chain, child_address)` regardless of discovery path.
#[derive(Clone)]
pub struct FactoryChildStore {
    pool: PgPool,
    schema: String,
}

#[derive(sqlx::FromRow)]
struct FactoryChildRow {
    chain_id: i64,
    child_address: String,
    factory_address: String,
    contract_name: String,
    discovered_block: i64,
    discovered_tx: String,
    child_abi: Option<String>,
}

impl From<FactoryChildRow> for FactoryChild {
    fn from(r: FactoryChildRow) -> Self {
        FactoryChild {
            chain_id: r.chain_id as u64,
            child_address: r.child_address,
            factory_address: r.factory_address,
            contract_name: r.contract_name,
            discovered_block: r.discovered_block as u64,
            discovered_tx: r.discovered_tx,
            child_abi: r.child_abi,
        }
    }
}

impl FactoryChildStore {
    pub fn new(pool: PgPool, sync_schema: &str) -> Self {
        Self {
            pool,
            schema: sync_schema.to_string(),
        }
    }

    /// Insert inside the page transaction. Returns whether the row was new;
    /// only an effective insert is broadcast on the bus.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        child: &FactoryChild,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {}.factory_children \
             (chain_id, child_address, factory_address, contract_name, discovered_block, \
              discovered_tx, child_abi) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (chain_id, child_address) DO NOTHING",
            self.schema
        ))
        .bind(child.chain_id as i64)
        .bind(&child.child_address)
        .bind(&child.factory_address)
        .bind(&child.contract_name)
        .bind(child.discovered_block as i64)
        .bind(&child.discovered_tx)
        .bind(&child.child_abi)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn children(&self, chain_id: u64) -> Result<Vec<FactoryChild>> {
        let rows: Vec<FactoryChildRow> = sqlx::query_as(&format!(
            "SELECT chain_id, child_address, factory_address, contract_name, \
                    discovered_block, discovered_tx, child_abi \
             FROM {}.factory_children WHERE chain_id = $1 ORDER BY discovered_block",
            self.schema
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn children_for(&self, chain_id: u64, factory_address: &str) -> Result<Vec<FactoryChild>> {
        let rows: Vec<FactoryChildRow> = sqlx::query_as(&format!(
            "SELECT chain_id, child_address, factory_address, contract_name, \
                    discovered_block, discovered_tx, child_abi \
             FROM {}.factory_children \
             WHERE chain_id = $1 AND factory_address = $2 ORDER BY discovered_block",
            self.schema
        ))
        .bind(chain_id as i64)
        .bind(factory_address)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
