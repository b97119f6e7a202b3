pub mod engine;
pub mod error;
pub mod merge;
pub mod parsing;
pub mod pr_review;
pub mod terminal;

pub use engine::{CommitAction, Engine, PendingCommit};
pub use error::{PipelineError, Result};
pub use merge::{MergeOutcome, MergeStage};
pub use pr_review::{FixAction, PrReviewLoop};
pub use terminal::{TerminalAction, TerminalStage};
