/// Storage errors. Propagated up per the error-handling design: a database
/// write failure is never silently swallowed, and callers finalizing a
/// `running` execution get one best-effort retry before falling back to
/// health-monitor reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
