use std::sync::Arc;

use eng_core::types::{StageExecution, StageTemplate, Task};
use eng_git::{GitOps, GitRunner};
use eng_process::{AgentEvent, PtyEvent, Supervisor};
use uuid::Uuid;

use crate::engine::PendingCommit;
use crate::error::{PipelineError, Result};

/// §6's "last ≤8 KB of terminal output" captured for the summary call.
const CAPTURE_MAX_BYTES: usize = 8 * 1024;

/// What the user chose to do with a running interactive terminal.
pub enum TerminalAction {
    Finish { captured_output: String },
    Stop,
}

/// The interactive-terminal sub-stage (§4.1.6): bypasses the generic
/// spawn/stream/parse run path entirely. Spawns a PTY at the task worktree
/// and streams bytes to/from the UI; "Finish" kills it, summarizes the
/// captured tail, and proposes a commit; "Stop" just fails the execution.
pub struct TerminalStage {
    supervisor: Arc<Supervisor>,
    git_runner: Arc<dyn GitRunner>,
    pty_binary: String,
    agent_binary: String,
}

impl TerminalStage {
    pub fn new(
        supervisor: Arc<Supervisor>,
        git_runner: Arc<dyn GitRunner>,
        pty_binary: impl Into<String>,
        agent_binary: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            git_runner,
            pty_binary: pty_binary.into(),
            agent_binary: agent_binary.into(),
        }
    }

    pub async fn start(
        &self,
        working_directory: &str,
        stage_execution_id: Uuid,
    ) -> Result<(Uuid, flume::Receiver<PtyEvent>)> {
        self.supervisor
            .spawn_pty(&self.pty_binary, &[], working_directory, Some(stage_execution_id))
            .await
            .map_err(Into::into)
    }

    pub async fn write(&self, process_id: Uuid, data: &[u8]) -> Result<()> {
        self.supervisor.write(process_id, data).await.map_err(Into::into)
    }

    pub async fn resize(&self, process_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        self.supervisor.resize(process_id, cols, rows).await.map_err(Into::into)
    }

    /// "Finish": kill the PTY, summarize the captured tail into 2-4
    /// sentences, then propose a commit if the worktree is dirty. Returns
    /// the summary text (destined for `stage_result`) and an optional
    /// `PendingCommit` for the caller to hand to the same commit sub-flow
    /// used by §4.1.5.
    pub async fn finish(
        &self,
        process_id: Uuid,
        captured_output: &str,
        task: &Task,
        template: &StageTemplate,
        execution: &StageExecution,
        working_directory: &str,
    ) -> Result<(String, Option<PendingCommit>)> {
        self.supervisor.kill(process_id).await?;

        let tail = tail_bytes(captured_output, CAPTURE_MAX_BYTES);
        let summary = self
            .summarize(task, template, &tail)
            .await
            .unwrap_or_else(|_| "Interactive terminal session completed.".to_string());

        let ops = GitOps::new(self.git_runner.as_ref());
        if ops.is_clean(working_directory)? {
            return Ok((summary, None));
        }

        let diff_stat = ops.diff_stat(working_directory)?;
        let pending = PendingCommit {
            stage_execution_id: execution.id,
            task_id: task.id,
            stage_template_id: template.id,
            suggested_message: format!("{}: {}", template.name, task.title),
            diff_stat,
        };
        Ok((summary, Some(pending)))
    }

    /// "Stop": kill the PTY without summarizing; the caller marks the
    /// execution `failed`.
    pub async fn stop(&self, process_id: Uuid) -> Result<()> {
        self.supervisor.kill(process_id).await.map_err(Into::into)
    }

    async fn summarize(&self, task: &Task, template: &StageTemplate, tail: &str) -> Result<String> {
        let prompt = format!(
            "Summarize in 2-4 sentences what happened in this interactive terminal session from the \"{}\" stage of \"{}\":\n\n{}",
            template.name, task.title, tail
        );
        let (_id, rx) = self
            .supervisor
            .spawn_agent(&self.agent_binary, &[], ".", None, Some(prompt), &[])
            .await?;

        let mut text = String::new();
        while let Ok(event) = rx.recv_async().await {
            match event {
                AgentEvent::StdoutLine { line } => {
                    text.push_str(&line);
                    text.push('\n');
                }
                AgentEvent::Completed { .. } | AgentEvent::Error { .. } => break,
                _ => {}
            }
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            Err(PipelineError::Internal("empty terminal summary".to_string()))
        } else {
            Ok(trimmed.to_string())
        }
    }
}

/// The last `max_bytes` of `s`, snapped forward to the nearest UTF-8 char
/// boundary so the slice never panics on a split multi-byte character.
fn tail_bytes(s: &str, max_bytes: usize) -> String {
    let bytes = s.as_bytes();
    if bytes.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = bytes.len() - max_bytes;
    while start < bytes.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_bytes_returns_whole_string_when_under_limit() {
        assert_eq!(tail_bytes("short", 1024), "short");
    }

    #[test]
    fn tail_bytes_truncates_to_last_n_bytes() {
        let long = "a".repeat(100);
        let tail = tail_bytes(&long, 10);
        assert_eq!(tail.len(), 10);
    }

    #[test]
    fn tail_bytes_snaps_to_char_boundary() {
        let s = "héllo wörld this is a longer string with multibyte chars: ñ";
        let tail = tail_bytes(s, 5);
        assert!(String::from_utf8(tail.clone().into_bytes()).is_ok());
    }
}
