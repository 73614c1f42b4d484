use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;

use kyomei_common::error::{KyomeiError, Result};

/// A row as handlers see it: a JSON object with camelCase keys.
pub type Row = Map<String, Value>;

/// One reflected application table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// snake_case column name → Postgres type (udt) used for bind casts.
    pub columns: HashMap<String, String>,
    /// Primary-key columns in ordinal order.
    pub primary_key: Vec<String>,
}

/// Tables reflected from `information_schema` for the app schema at
/// startup. Handler-supplied table and column names resolve against this —
/// nothing a handler provides reaches SQL as an identifier unless it was
/// already on disk.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    schema: String,
    tables: HashMap<String, TableInfo>,
}

/// Bookkeeping tables live in the reflected schemas but are not part of
/// the handler surface.
const RESERVED_TABLES: [&str; 5] = [
    "process_workers",
    "process_checkpoints",
    "cron_jobs",
    "cron_executions",
    "cron_checkpoints",
];

impl TableRegistry {
    pub async fn reflect(pool: &PgPool, app_schema: &str) -> Result<Self> {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT table_name, column_name, udt_name \
             FROM information_schema.columns \
             WHERE table_schema = $1 \
             ORDER BY table_name, ordinal_position",
        )
        .bind(app_schema)
        .fetch_all(pool)
        .await?;

        let keys: Vec<(String, String)> = sqlx::query_as(
            "SELECT kcu.table_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 \
             ORDER BY kcu.table_name, kcu.ordinal_position",
        )
        .bind(app_schema)
        .fetch_all(pool)
        .await?;

        let mut tables: HashMap<String, TableInfo> = HashMap::new();
        for (table, column, udt) in columns {
            if RESERVED_TABLES.contains(&table.as_str()) {
                continue;
            }
            tables
                .entry(table.clone())
                .or_insert_with(|| TableInfo {
                    name: table,
                    columns: HashMap::new(),
                    primary_key: Vec::new(),
                })
                .columns
                .insert(column, udt);
        }
        for (table, column) in keys {
            if let Some(info) = tables.get_mut(&table) {
                info.primary_key.push(column);
            }
        }

        tracing::debug!(
            schema = app_schema,
            tables = tables.len(),
            "Reflected application tables"
        );

        Ok(Self {
            schema: app_schema.to_string(),
            tables,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Resolve a handler-facing (camelCase or snake_case) table name.
    pub fn table(&self, name: &str) -> Result<&TableInfo> {
        let snake = camel_to_snake(name);
        self.tables
            .get(&snake)
            .ok_or_else(|| KyomeiError::UnknownTable(name.to_string()))
    }
}

/// Shared block transaction: parallel handlers overlap on RPC and compute
/// while their statements serialize on this lock.
pub type SharedTx = Arc<Mutex<Transaction<'static, Postgres>>>;

/// The narrow CRUD surface handlers get. Every value binds as a `$n`
/// parameter cast to the column's reflected type.
#[derive(Clone)]
pub struct DbContext {
    tx: SharedTx,
    tables: Arc<TableRegistry>,
}

impl DbContext {
    pub fn new(tx: SharedTx, tables: Arc<TableRegistry>) -> Self {
        Self { tx, tables }
    }

    pub fn insert(&self, table: &str) -> InsertBuilder {
        InsertBuilder {
            ctx: self.clone(),
            table: table.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn update(&self, table: &str) -> UpdateBuilder {
        UpdateBuilder {
            ctx: self.clone(),
            table: table.to_string(),
            patch: Map::new(),
            conds: Map::new(),
        }
    }

    pub fn delete(&self, table: &str) -> DeleteBuilder {
        DeleteBuilder {
            ctx: self.clone(),
            table: table.to_string(),
            conds: Map::new(),
        }
    }

    pub fn find(&self, table: &str) -> FindBuilder {
        FindBuilder {
            ctx: self.clone(),
            table: table.to_string(),
            conds: Map::new(),
        }
    }

    /// Single-row lookup by primary key.
    pub async fn get(&self, table: &str, id: impl Into<Value>) -> Result<Option<Row>> {
        let info = self.tables.table(table)?.clone();
        let pk = match info.primary_key.as_slice() {
            [single] => single.clone(),
            _ => {
                return Err(KyomeiError::Internal(format!(
                    "get() needs a single-column primary key on '{table}'"
                )));
            }
        };

        let mut conds = Map::new();
        conds.insert(snake_to_camel(&pk), id.into());
        self.find(table).filter(Value::Object(conds)).one().await
    }

    async fn execute(&self, qb: &mut QueryBuilder<'_, Postgres>) -> Result<u64> {
        let mut tx = self.tx.lock().await;
        let result = qb.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_rows(&self, qb: &mut QueryBuilder<'_, Postgres>) -> Result<Vec<Row>> {
        let mut tx = self.tx.lock().await;
        let rows: Vec<(Value,)> = qb.build_query_as().fetch_all(&mut **tx).await?;
        drop(tx);

        rows.into_iter()
            .map(|(value,)| match value {
                Value::Object(map) => Ok(map
                    .into_iter()
                    .map(|(k, v)| (snake_to_camel(&k), v))
                    .collect()),
                other => Err(KyomeiError::Internal(format!(
                    "row_to_json returned non-object: {other}"
                ))),
            })
            .collect()
    }
}

pub struct InsertBuilder {
    ctx: DbContext,
    table: String,
    rows: Vec<Map<String, Value>>,
}

impl InsertBuilder {
    /// Accepts a single row object or an array of rows.
    pub fn values(mut self, rows: Value) -> Self {
        match rows {
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(map) = item {
                        self.rows.push(map);
                    }
                }
            }
            Value::Object(map) => self.rows.push(map),
            _ => {}
        }
        self
    }

    pub async fn execute(self) -> Result<u64> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let info = self.ctx.tables.table(&self.table)?.clone();

        // Column set comes from the first row; later rows fill missing
        // columns with NULL.
        let columns: Vec<String> = self.rows[0].keys().map(|k| camel_to_snake(k)).collect();
        for column in &columns {
            check_column(&info, column)?;
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {}.{} ({}) ",
            self.ctx.tables.schema(),
            info.name,
            columns.join(", ")
        ));
        qb.push_values(&self.rows, |mut b, row| {
            for (camel, column) in self.rows[0].keys().zip(&columns) {
                let value = row.get(camel).unwrap_or(&Value::Null);
                push_cast_bind(&mut b, value, info.columns.get(column).map(String::as_str));
            }
        });

        self.ctx.execute(&mut qb).await
    }
}

pub struct UpdateBuilder {
    ctx: DbContext,
    table: String,
    patch: Map<String, Value>,
    conds: Map<String, Value>,
}

impl UpdateBuilder {
    pub fn set(mut self, patch: Value) -> Self {
        if let Value::Object(map) = patch {
            self.patch.extend(map);
        }
        self
    }

    pub fn filter(mut self, conds: Value) -> Self {
        if let Value::Object(map) = conds {
            self.conds.extend(map);
        }
        self
    }

    pub async fn execute(self) -> Result<u64> {
        if self.patch.is_empty() {
            return Ok(0);
        }
        let info = self.ctx.tables.table(&self.table)?.clone();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE {}.{} SET ",
            self.ctx.tables.schema(),
            info.name
        ));
        let mut first = true;
        for (camel, value) in &self.patch {
            let column = camel_to_snake(camel);
            check_column(&info, &column)?;
            if !first {
                qb.push(", ");
            }
            first = false;
            qb.push(format!("{column} = "));
            push_cast_bind_qb(&mut qb, value, info.columns.get(&column).map(String::as_str));
        }
        push_conditions(&mut qb, &info, &self.conds)?;

        self.ctx.execute(&mut qb).await
    }
}

pub struct DeleteBuilder {
    ctx: DbContext,
    table: String,
    conds: Map<String, Value>,
}

impl DeleteBuilder {
    pub fn filter(mut self, conds: Value) -> Self {
        if let Value::Object(map) = conds {
            self.conds.extend(map);
        }
        self
    }

    pub async fn execute(self) -> Result<u64> {
        let info = self.ctx.tables.table(&self.table)?.clone();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "DELETE FROM {}.{}",
            self.ctx.tables.schema(),
            info.name
        ));
        push_conditions(&mut qb, &info, &self.conds)?;

        self.ctx.execute(&mut qb).await
    }
}

pub struct FindBuilder {
    ctx: DbContext,
    table: String,
    conds: Map<String, Value>,
}

impl FindBuilder {
    pub fn filter(mut self, conds: Value) -> Self {
        if let Value::Object(map) = conds {
            self.conds.extend(map);
        }
        self
    }

    pub async fn one(self) -> Result<Option<Row>> {
        let mut rows = self.fetch(Some(1)).await?;
        Ok(rows.pop())
    }

    pub async fn many(self) -> Result<Vec<Row>> {
        self.fetch(None).await
    }

    async fn fetch(self, limit: Option<u32>) -> Result<Vec<Row>> {
        let info = self.ctx.tables.table(&self.table)?.clone();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT row_to_json(t) FROM {}.{} t",
            self.ctx.tables.schema(),
            info.name
        ));
        push_conditions(&mut qb, &info, &self.conds)?;
        if let Some(limit) = limit {
            qb.push(format!(" LIMIT {limit}"));
        }

        self.ctx.fetch_rows(&mut qb).await
    }
}

fn check_column(info: &TableInfo, column: &str) -> Result<()> {
    if info.columns.contains_key(column) {
        Ok(())
    } else {
        Err(KyomeiError::UnknownColumn {
            table: info.name.clone(),
            column: column.to_string(),
        })
    }
}

/// Equality conditions, ANDed. An empty condition set matches everything.
fn push_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    info: &TableInfo,
    conds: &Map<String, Value>,
) -> Result<()> {
    if conds.is_empty() {
        return Ok(());
    }
    qb.push(" WHERE ");
    let mut first = true;
    for (camel, value) in conds {
        let column = camel_to_snake(camel);
        check_column(info, &column)?;
        if !first {
            qb.push(" AND ");
        }
        first = false;
        if value.is_null() {
            qb.push(format!("{column} IS NULL"));
        } else {
            qb.push(format!("{column} = "));
            push_cast_bind_qb(qb, value, info.columns.get(&column).map(String::as_str));
        }
    }
    Ok(())
}

/// Bind a JSON value as text and cast to the column's reflected type, so
/// bigints-as-strings land in NUMERIC columns and objects in JSONB.
fn push_cast_bind_qb(qb: &mut QueryBuilder<'_, Postgres>, value: &Value, udt: Option<&str>) {
    match value {
        Value::Null => {
            qb.push("NULL");
            return;
        }
        Value::String(s) => qb.push_bind(s.clone()),
        Value::Bool(b) => qb.push_bind(b.to_string()),
        Value::Number(n) => qb.push_bind(n.to_string()),
        other => qb.push_bind(other.to_string()),
    };
    if let Some(udt) = udt
        && udt.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        qb.push(format!("::{udt}"));
    }
}

/// `push_values` separator variant of the same cast logic.
fn push_cast_bind(
    b: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    value: &Value,
    udt: Option<&str>,
) {
    match value {
        Value::Null => {
            b.push("NULL");
            return;
        }
        Value::String(s) => b.push_bind(s.clone()),
        Value::Bool(v) => b.push_bind(v.to_string()),
        Value::Number(n) => b.push_bind(n.to_string()),
        other => b.push_bind(other.to_string()),
    };
    if let Some(udt) = udt
        && udt.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        b.push_unseparated(format!("::{udt}"));
    }
}

/// `transferAmount` → `transfer_amount`. Consecutive capitals collapse into
/// one word boundary (`erc20ID` → `erc20_id`).
pub fn camel_to_snake(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for c in input.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

/// `transfer_amount` → `transferAmount`.
pub fn snake_to_camel(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for c in input.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_conversions_round_trip() {
        for (camel, snake) in [
            ("transferAmount", "transfer_amount"),
            ("id", "id"),
            ("blockNumber", "block_number"),
            ("erc20Balance", "erc20_balance"),
        ] {
            assert_eq!(camel_to_snake(camel), snake);
            assert_eq!(snake_to_camel(snake), camel);
        }
    }

    #[test]
    fn snake_inputs_pass_through_camel_to_snake() {
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn unknown_column_is_rejected() {
        let info = TableInfo {
            name: "transfers".into(),
            columns: HashMap::from([("amount".to_string(), "numeric".to_string())]),
            primary_key: vec!["id".into()],
        };
        assert!(check_column(&info, "amount").is_ok());
        assert!(matches!(
            check_column(&info, "amount; DROP TABLE x"),
            Err(KyomeiError::UnknownColumn { .. })
        ));
    }
}
