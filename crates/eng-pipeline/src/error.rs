use uuid::Uuid;

/// Errors surfaced by the engine's public API. Per the error-handling
/// design, each abstract failure kind gets its own variant rather than a
/// blanket wrapper — callers pattern-match to decide whether a failure is
/// retryable, user-facing, or a bug.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("a stage is already running for this task")]
    Busy,

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("stage template not found: {0}")]
    TemplateNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution is not awaiting a user decision")]
    NotAwaitingUser,

    #[error("gate validation failed: {0}")]
    GateFailed(String),

    #[error("another task in this project is already ejected")]
    AlreadyEjected,

    #[error("the main repository has uncommitted changes")]
    DirtyMainRepo,

    #[error("store: {0}")]
    Store(#[from] eng_store::StoreError),

    #[error("process: {0}")]
    Process(#[from] eng_process::ProcessError),

    #[error("git: {0}")]
    Git(#[from] eng_git::GitError),

    #[error("hosting: {0}")]
    Hosting(#[from] eng_git::HostingError),

    #[error("worktree: {0}")]
    Worktree(#[from] eng_worktree::WorktreeManagerError),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
