use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eng_core::types::ProcessRecord;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::supervisor::Supervisor;

/// Tracks when each (task, stage) output buffer last received a line, so
/// the reconciler can detect an execution idle past `inactivity_timeout`.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    last_output_at: Arc<Mutex<HashMap<Uuid, chrono::DateTime<Utc>>>>,
}

impl ActivityTracker {
    pub async fn touch(&self, execution_id: Uuid) {
        self.last_output_at.lock().await.insert(execution_id, Utc::now());
    }

    pub async fn last_output_at(&self, execution_id: Uuid) -> Option<chrono::DateTime<Utc>> {
        self.last_output_at.lock().await.get(&execution_id).copied()
    }

    pub async fn clear(&self, execution_id: Uuid) {
        self.last_output_at.lock().await.remove(&execution_id);
    }
}

/// One outcome of a health-monitor pass, for the engine to fold into a
/// Store write (`status=failed`, the given `error_message`).
#[derive(Debug, Clone)]
pub struct ReconciliationOutcome {
    pub execution_id: Uuid,
    pub error_message: &'static str,
}

/// Periodic reconciler per the §4.3 contract: crashed processes, processes
/// that lost their event subscriber across a restart, and executions idle
/// past the inactivity timeout.
pub struct HealthMonitor {
    supervisor: Supervisor,
    activity: ActivityTracker,
    inactivity_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: Supervisor, activity: ActivityTracker, inactivity_timeout_ms: u64) -> Self {
        Self {
            supervisor,
            activity,
            inactivity_timeout: Duration::from_millis(inactivity_timeout_ms),
        }
    }

    /// One reconciliation pass over the given set of `running` executions,
    /// each paired with its in-memory `process_id` if the engine has one.
    pub async fn reconcile(
        &self,
        running: &[(Uuid, Option<Uuid>)],
    ) -> Vec<ReconciliationOutcome> {
        let live = self.supervisor.list_processes_detailed().await;
        let live_by_process: HashMap<Uuid, &ProcessRecord> =
            live.iter().map(|p| (p.process_id, p)).collect();
        let live_by_execution: HashMap<Uuid, &ProcessRecord> = live
            .iter()
            .filter_map(|p| p.stage_execution_id.map(|e| (e, p)))
            .collect();

        let mut outcomes = Vec::new();

        for (execution_id, process_id) in running {
            match process_id {
                Some(pid) if !live_by_process.contains_key(pid) => {
                    warn!(%execution_id, %pid, "process vanished");
                    outcomes.push(ReconciliationOutcome {
                        execution_id: *execution_id,
                        error_message: "Process crashed unexpectedly",
                    });
                    continue;
                }
                None => {
                    if let Some(record) = live_by_execution.get(execution_id) {
                        warn!(%execution_id, process_id = %record.process_id, "killing orphaned live process with no subscriber");
                        let _ = self.supervisor.kill(record.process_id).await;
                        outcomes.push(ReconciliationOutcome {
                            execution_id: *execution_id,
                            error_message: "Process lost connection",
                        });
                        continue;
                    }
                }
                _ => {}
            }

            if let Some(last) = self.activity.last_output_at(*execution_id).await {
                let idle_for = Utc::now().signed_duration_since(last);
                if idle_for.to_std().unwrap_or_default() > self.inactivity_timeout {
                    warn!(%execution_id, "execution inactivity timeout exceeded");
                    if let Some(pid) = process_id {
                        let _ = self.supervisor.kill(*pid).await;
                    }
                    outcomes.push(ReconciliationOutcome {
                        execution_id: *execution_id,
                        error_message: "Timed out waiting for output",
                    });
                }
            }
        }

        outcomes
    }

    /// Run on application startup, before accepting user actions: kill any
    /// live process whose `stage_execution_id` no longer maps to a
    /// `running` execution, and return the set of `running` executions that
    /// have no live process (to be marked `failed` by the caller).
    pub async fn orphan_sweep(&self, running_execution_ids: &[Uuid]) -> Vec<Uuid> {
        let running: std::collections::HashSet<Uuid> =
            running_execution_ids.iter().copied().collect();
        let live = self.supervisor.list_processes_detailed().await;

        for record in &live {
            match record.stage_execution_id {
                Some(execution_id) if running.contains(&execution_id) => {}
                _ => {
                    info!(process_id = %record.process_id, "killing process orphaned across restart");
                    let _ = self.supervisor.kill(record.process_id).await;
                }
            }
        }

        let live_executions: std::collections::HashSet<Uuid> =
            live.iter().filter_map(|p| p.stage_execution_id).collect();
        running_execution_ids
            .iter()
            .copied()
            .filter(|e| !live_executions.contains(e))
            .collect()
    }

    pub async fn run_forever(
        self: Arc<Self>,
        poll_interval_ms: u64,
        running_snapshot: impl Fn() -> Vec<(Uuid, Option<Uuid>)> + Send + Sync + 'static,
        on_outcome: impl Fn(ReconciliationOutcome) + Send + Sync + 'static,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms));
        loop {
            ticker.tick().await;
            let running = running_snapshot();
            if running.is_empty() {
                continue;
            }
            for outcome in self.reconcile(&running).await {
                on_outcome(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vanished_process_is_reconciled_as_crashed() {
        let supervisor = Supervisor::new();
        let activity = ActivityTracker::default();
        let monitor = HealthMonitor::new(supervisor, activity, 10 * 60 * 1000);

        let execution_id = Uuid::new_v4();
        let phantom_process_id = Uuid::new_v4();
        let outcomes = monitor.reconcile(&[(execution_id, Some(phantom_process_id))]).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].execution_id, execution_id);
        assert_eq!(outcomes[0].error_message, "Process crashed unexpectedly");
    }

    #[tokio::test]
    async fn orphan_sweep_reports_running_without_live_process() {
        let supervisor = Supervisor::new();
        let activity = ActivityTracker::default();
        let monitor = HealthMonitor::new(supervisor, activity, 10 * 60 * 1000);

        let execution_id = Uuid::new_v4();
        let orphaned = monitor.orphan_sweep(&[execution_id]).await;
        assert_eq!(orphaned, vec![execution_id]);
    }
}
