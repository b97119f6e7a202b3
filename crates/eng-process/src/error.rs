/// Process-supervision errors. These never propagate out of the engine's
/// public boundary (per the error-handling design) — callers translate them
/// into `StageExecution.error_message` and a terminal status.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("process not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
