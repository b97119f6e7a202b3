use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use eng_core::types::{ProcessKind, ProcessRecord};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProcessError, Result};
use crate::pty::{PtyEvent, PtyProcess};

/// One event emitted by an agent (line-oriented) process, per the external
/// interface's agent subprocess contract.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Started { process_id: Uuid },
    StdoutLine { line: String },
    StderrLine { line: String },
    Completed { exit_code: i32 },
    Error { message: String },
}

enum Handle {
    Agent(Arc<Mutex<Child>>),
    Pty(Arc<PtyProcess>),
}

/// Owns the lifetime of every child process: agent (structured stdout) and
/// PTY (interactive byte stream). Spawns return an id immediately; the
/// first event delivered for that id is always `started`.
#[derive(Clone)]
pub struct Supervisor {
    table: Arc<Mutex<HashMap<Uuid, ProcessRecord>>>,
    handles: Arc<Mutex<HashMap<Uuid, Handle>>>,
    kill_requested: Arc<Mutex<std::collections::HashSet<Uuid>>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            handles: Arc::new(Mutex::new(HashMap::new())),
            kill_requested: Arc::new(Mutex::new(std::collections::HashSet::new())),
        }
    }

    /// Spawn an agent process. `stdin_payload`, if given, is written then
    /// the stdin handle is closed so the agent sees EOF. `envs` is merged
    /// into the child's environment on top of the inherited one, e.g. to
    /// seed the stage-context service env vars a tool subprocess reads.
    pub async fn spawn_agent(
        &self,
        binary: &str,
        args: &[String],
        working_directory: &str,
        stage_execution_id: Option<Uuid>,
        stdin_payload: Option<String>,
        envs: &[(String, String)],
    ) -> Result<(Uuid, flume::Receiver<AgentEvent>)> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .current_dir(working_directory)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let id = Uuid::new_v4();
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdin = child.stdin.take();

        self.register(id, ProcessKind::Agent, stage_execution_id, working_directory)
            .await;

        let child = Arc::new(Mutex::new(child));
        self.handles.lock().await.insert(id, Handle::Agent(Arc::clone(&child)));

        if let Some(payload) = stdin_payload {
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        }
        drop(stdin);

        let (tx, rx) = flume::unbounded::<AgentEvent>();
        let _ = tx.send(AgentEvent::Started { process_id: id });

        if self.kill_requested.lock().await.remove(&id) {
            self.kill(id).await?;
        }

        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(AgentEvent::StdoutLine { line }).is_err() {
                    break;
                }
            }
        });

        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(AgentEvent::StderrLine { line }).is_err() {
                    break;
                }
            }
        });

        let wait_table = Arc::clone(&self.table);
        let wait_handles = Arc::clone(&self.handles);
        let wait_child = Arc::clone(&child);
        tokio::spawn(async move {
            let status = {
                let mut guard = wait_child.lock().await;
                guard.wait().await
            };
            match status {
                Ok(status) => {
                    let _ = tx.send(AgentEvent::Completed {
                        exit_code: status.code().unwrap_or(-1),
                    });
                }
                Err(e) => {
                    let _ = tx.send(AgentEvent::Error { message: e.to_string() });
                }
            }
            wait_table.lock().await.remove(&id);
            wait_handles.lock().await.remove(&id);
        });

        Ok((id, rx))
    }

    /// Spawn an interactive PTY process, bridging its synchronous event
    /// channel onto an async one so callers use a single await point.
    pub async fn spawn_pty(
        &self,
        binary: &str,
        args: &[String],
        working_directory: &str,
        stage_execution_id: Option<Uuid>,
    ) -> Result<(Uuid, flume::Receiver<PtyEvent>)> {
        let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let process = PtyProcess::spawn(binary, &args_refs, working_directory, &[])?;
        let id = process.id;
        let process = Arc::new(process);

        self.register(id, ProcessKind::Pty, stage_execution_id, working_directory)
            .await;
        self.handles.lock().await.insert(id, Handle::Pty(Arc::clone(&process)));

        if self.kill_requested.lock().await.remove(&id) {
            self.kill(id).await?;
        }

        let (tx, rx) = flume::unbounded::<PtyEvent>();
        let source = process.events.clone();
        let table = Arc::clone(&self.table);
        let handles = Arc::clone(&self.handles);
        tokio::spawn(async move {
            while let Ok(event) = source.recv_async().await {
                let exited = matches!(event, PtyEvent::Exited);
                let forwarded = tx.send(event).is_ok();
                if exited || !forwarded {
                    table.lock().await.remove(&id);
                    handles.lock().await.remove(&id);
                    break;
                }
            }
        });

        Ok((id, rx))
    }

    pub async fn write(&self, id: Uuid, data: &[u8]) -> Result<()> {
        match self.handles.lock().await.get(&id) {
            Some(Handle::Pty(p)) => p.write(data),
            Some(Handle::Agent(_)) => Err(ProcessError::Pty("not a pty process".into())),
            None => Err(ProcessError::NotFound(id)),
        }
    }

    pub async fn resize(&self, id: Uuid, cols: u16, rows: u16) -> Result<()> {
        match self.handles.lock().await.get(&id) {
            Some(Handle::Pty(p)) => p.resize(cols, rows),
            Some(Handle::Agent(_)) => Err(ProcessError::Pty("not a pty process".into())),
            None => Err(ProcessError::NotFound(id)),
        }
    }

    /// Idempotent: killing an id with no registered handle (already exited,
    /// or not yet spawned) is a no-op recorded as a pending kill intent.
    pub async fn kill(&self, id: Uuid) -> Result<()> {
        let handle = self.handles.lock().await.remove(&id);
        match handle {
            Some(Handle::Agent(child)) => {
                let mut guard = child.lock().await;
                let _ = guard.start_kill();
                info!(%id, "killed agent process");
                Ok(())
            }
            Some(Handle::Pty(p)) => {
                p.kill().map_err(Into::into)?;
                info!(%id, "killed pty process");
                Ok(())
            }
            None => {
                self.kill_requested.lock().await.insert(id);
                debug!(%id, "kill requested before spawn completed");
                Ok(())
            }
        }
    }

    /// Invoked on orderly shutdown.
    pub async fn kill_all(&self) {
        let ids: Vec<Uuid> = self.table.lock().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.kill(id).await {
                warn!(%id, error = %e, "failed to kill process during shutdown");
            }
        }
    }

    /// Snapshot of every tracked process, for health-monitor reconciliation.
    pub async fn list_processes_detailed(&self) -> Vec<ProcessRecord> {
        self.table.lock().await.values().cloned().collect()
    }

    pub async fn is_registered(&self, id: Uuid) -> bool {
        self.table.lock().await.contains_key(&id)
    }

    async fn register(
        &self,
        id: Uuid,
        kind: ProcessKind,
        stage_execution_id: Option<Uuid>,
        working_directory: &str,
    ) {
        let record = ProcessRecord {
            process_id: id,
            kind,
            stage_execution_id,
            spawned_at: Utc::now(),
            working_directory: working_directory.to_string(),
        };
        self.table.lock().await.insert(id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_agent_emits_started_first() {
        let supervisor = Supervisor::new();
        let (id, rx) = supervisor
            .spawn_agent("echo", &["hello".to_string()], ".", None, None, &[])
            .await
            .unwrap();
        let first = rx.recv_async().await.unwrap();
        assert!(matches!(first, AgentEvent::Started { process_id } if process_id == id));
    }

    #[tokio::test]
    async fn spawn_agent_reaches_completed() {
        let supervisor = Supervisor::new();
        let (_id, rx) = supervisor
            .spawn_agent("echo", &["hi".to_string()], ".", None, None, &[])
            .await
            .unwrap();
        let mut saw_completed = false;
        while let Ok(event) = rx.recv_async().await {
            if matches!(event, AgentEvent::Completed { .. }) {
                saw_completed = true;
                break;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn kill_before_spawn_completes_is_recorded_not_an_error() {
        let supervisor = Supervisor::new();
        let random_id = Uuid::new_v4();
        assert!(supervisor.kill(random_id).await.is_ok());
    }
}
