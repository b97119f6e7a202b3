pub mod manager;

pub use manager::{derive_branch_name, MergeResult, WorktreeManager, WorktreeManagerError};
