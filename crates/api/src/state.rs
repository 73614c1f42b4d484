//! Shared application state for the Axum API server.

use sqlx::PgPool;

use kyomei_common::config::SchemaNames;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub schemas: SchemaNames,
}

impl AppState {
    pub fn new(pool: PgPool, schemas: SchemaNames) -> Self {
        Self { pool, schemas }
    }
}
