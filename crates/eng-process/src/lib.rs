pub mod error;
pub mod health;
pub mod pty;
pub mod supervisor;

pub use error::{ProcessError, Result};
pub use health::{ActivityTracker, HealthMonitor, ReconciliationOutcome};
pub use pty::{PtyEvent, PtyProcess};
pub use supervisor::{AgentEvent, Supervisor};
