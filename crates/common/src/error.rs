use thiserror::Error;

/// Common error types used across the workspace.
///
/// The variants follow the failure taxonomy of the pipeline: configuration
/// problems are fatal at startup, transient source/store errors are retried
/// by the caller, and integrity violations other than the idempotent
/// raw-event unique conflict halt the affected chain.
#[derive(Debug, Error)]
pub enum KyomeiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transient source error: {0}")]
    SourceTransient(String),

    #[error("Fatal source error: {0}")]
    SourceFatal(String),

    #[error("Store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Chain {chain_id} paused after {failures} consecutive handler failures")]
    ChainPaused { chain_id: u64, failures: u32 },

    #[error("Invalid handler key '{0}': expected \"Contract:Event\"")]
    InvalidHandlerKey(String),

    #[error("Unknown contract: {0}")]
    UnknownContract(String),

    #[error("Unknown event '{event}' on contract '{contract}'")]
    UnknownEvent { contract: String, event: String },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KyomeiError>;

impl KyomeiError {
    /// Whether the caller should retry with backoff rather than escalate.
    pub fn is_transient(&self) -> bool {
        match self {
            KyomeiError::SourceTransient(_) => true,
            KyomeiError::Database(e) => is_transient_db_error(e),
            _ => false,
        }
    }

    /// Unique-key conflicts on raw events are absorbed silently; everything
    /// that reaches this check is some other integrity problem.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
            _ => false,
        }
    }
}

/// Connection-level failures are retried; statement-level failures are not.
fn is_transient_db_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}
