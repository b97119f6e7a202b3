pub mod error;
pub mod hosting;
pub mod retry;
pub mod runner;

pub use error::{GitError, GitResult, HostingError, HostingResult};
pub use hosting::{HostingClient, PrComment};
pub use retry::retry_with_backoff;
pub use runner::{GitOps, GitOutput, GitRunner, RealGitRunner, run_git_command};
