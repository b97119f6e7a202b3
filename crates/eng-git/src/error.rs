/// Git/hosting adapter errors. Per the error-handling design, a `GitError`
/// for the merge stage is inspected for the "conflict" substring by the
/// caller to decide whether to surface the "Ask agent to fix" affordance;
/// a `HostingError` is retried by `retry_with_backoff` before propagating.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    Command(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    #[error("hosting API error: {0}")]
    Api(#[from] octocrab::Error),
    #[error("missing hosting token — set the configured token environment variable")]
    MissingToken,
    #[error("environment variable error: {0}")]
    Env(#[from] std::env::VarError),
    #[error("retries exhausted after {0} attempts: {1}")]
    RetriesExhausted(u32, String),
}

pub type GitResult<T> = std::result::Result<T, GitError>;
pub type HostingResult<T> = std::result::Result<T, HostingError>;
