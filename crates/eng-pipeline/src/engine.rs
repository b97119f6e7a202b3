use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eng_core::types::{
    CompletionStrategy, ExecutionStatus, OutputFormat, PrReviewFix, StageExecution, StageTemplate,
    Task, TaskStage, TaskStatus,
};
use eng_git::{GitOps, GitRunner, HostingClient};
use eng_process::{ActivityTracker, AgentEvent, Supervisor};
use eng_store::ProjectDb;
use eng_worktree::WorktreeManager;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::merge::{MergeOutcome, MergeStage};
use crate::parsing;
use crate::pr_review::{FixAction, PrReviewLoop};
use crate::terminal::TerminalStage;

/// A commit awaiting the user's "commit" or "skip" decision, produced by
/// the commit sub-flow of a `commit_eligible` stage once its approval has
/// been persisted.
#[derive(Debug, Clone)]
pub struct PendingCommit {
    pub stage_execution_id: Uuid,
    pub task_id: Uuid,
    pub stage_template_id: Uuid,
    pub suggested_message: String,
    pub diff_stat: String,
}

#[derive(Debug, Clone)]
pub enum CommitAction {
    Commit { message: Option<String> },
    Skip,
}

/// The Stage Execution Engine: runs one attempt of a stage at a time per
/// (task, template), parses its output, gates approval, and advances the
/// task through its stage sequence. Scoped to a single project's database.
pub struct Engine {
    store: ProjectDb,
    supervisor: Arc<Supervisor>,
    git_runner: Arc<dyn GitRunner>,
    hosting: Option<Arc<HostingClient>>,
    project_path: PathBuf,
    db_path: String,
    agent_binary: String,
    pty_binary: String,
    running: Arc<Mutex<HashSet<(Uuid, Uuid)>>>,
    processes: Arc<Mutex<HashMap<Uuid, Uuid>>>,
    killed: Arc<Mutex<HashSet<Uuid>>>,
    pending_commits: Arc<Mutex<HashMap<Uuid, PendingCommit>>>,
    /// Process ids of in-flight interactive terminals, keyed by stage
    /// execution id so `finish_terminal`/`stop_terminal` can look them up.
    terminals: Arc<Mutex<HashMap<Uuid, Uuid>>>,
    /// Last-output timestamps for the §4.3 inactivity check, touched on
    /// every stdout/stderr line the running attempt produces.
    activity: ActivityTracker,
    health_poll_interval_ms: u64,
    health_inactivity_timeout_ms: u64,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ProjectDb,
        supervisor: Arc<Supervisor>,
        git_runner: Arc<dyn GitRunner>,
        project_path: impl Into<PathBuf>,
        db_path: impl Into<String>,
        agent_binary: impl Into<String>,
    ) -> Self {
        Self {
            store,
            supervisor,
            git_runner,
            hosting: None,
            project_path: project_path.into(),
            db_path: db_path.into(),
            agent_binary: agent_binary.into(),
            pty_binary: std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string()),
            running: Arc::new(Mutex::new(HashSet::new())),
            processes: Arc::new(Mutex::new(HashMap::new())),
            killed: Arc::new(Mutex::new(HashSet::new())),
            pending_commits: Arc::new(Mutex::new(HashMap::new())),
            terminals: Arc::new(Mutex::new(HashMap::new())),
            activity: ActivityTracker::default(),
            health_poll_interval_ms: 5_000,
            health_inactivity_timeout_ms: 600_000,
        }
    }

    pub fn with_hosting(mut self, hosting: Arc<HostingClient>) -> Self {
        self.hosting = Some(hosting);
        self
    }

    pub fn with_pty_binary(mut self, pty_binary: impl Into<String>) -> Self {
        self.pty_binary = pty_binary.into();
        self
    }

    /// Override the §4.3 reconciler's poll interval and inactivity timeout
    /// (defaults mirror `HealthConfig::default()`).
    pub fn with_health_config(mut self, poll_interval_ms: u64, inactivity_timeout_ms: u64) -> Self {
        self.health_poll_interval_ms = poll_interval_ms;
        self.health_inactivity_timeout_ms = inactivity_timeout_ms;
        self
    }

    pub fn store(&self) -> &ProjectDb {
        &self.store
    }

    /// Run the first attempt of a stage.
    pub async fn run_stage(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
        user_input: Option<String>,
    ) -> Result<Uuid> {
        self.start_attempt(task_id, stage_template_id, user_input, None).await
    }

    /// Re-run a stage whose latest attempt is `awaiting_user` or `failed`.
    ///
    /// For `findings`-format stages, the incoming `feedback` is the user's
    /// selection of findings to apply: it is routed into
    /// `{{prior_attempt_output}}` and the stage's `{{user_input}}` hole is
    /// left empty for this attempt. For every other format, the *first*
    /// attempt's `user_input` is preserved across redos and `feedback` is
    /// appended to it as a follow-up answer; the prior attempt's raw output
    /// becomes `{{prior_attempt_output}}`.
    pub async fn redo_stage(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
        feedback: Option<String>,
    ) -> Result<Uuid> {
        let latest = self.store.latest_execution(task_id, stage_template_id).await?;
        match &latest {
            Some(e) if matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Running) => {
                return Err(PipelineError::Busy);
            }
            _ => {}
        }
        let template = self
            .store
            .get_stage_template(stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(stage_template_id))?;

        let (effective_user_input, prior_attempt_output) = match &latest {
            None => (feedback, None),
            Some(_) if template.output_format == OutputFormat::Findings => {
                (None, feedback.or_else(|| Some(String::new())))
            }
            Some(e) => {
                let first_input = self.first_attempt_user_input(task_id, stage_template_id).await?;
                let combined = match (first_input, feedback) {
                    (Some(first), Some(new)) if !new.trim().is_empty() => {
                        Some(format!("{first}\n\nFollow-up: {new}"))
                    }
                    (Some(first), _) => Some(first),
                    (None, new) => new,
                };
                (combined, Some(e.raw_output.clone()))
            }
        };
        self.start_attempt(task_id, stage_template_id, effective_user_input, prior_attempt_output).await
    }

    /// The `user_input` stored on attempt 1 of (task, template), if any.
    async fn first_attempt_user_input(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<Option<String>> {
        let executions = self.store.list_executions_for_stage(task_id, stage_template_id).await?;
        Ok(executions
            .into_iter()
            .find(|e| e.attempt_number == 1)
            .and_then(|e| e.user_input))
    }

    async fn start_attempt(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
        user_input: Option<String>,
        prior_attempt_output: Option<String>,
    ) -> Result<Uuid> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let template = self
            .store
            .get_stage_template(stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(stage_template_id))?;

        {
            let mut running = self.running.lock().await;
            if !running.insert((task_id, stage_template_id)) {
                return Err(PipelineError::Busy);
            }
        }
        let result = self
            .run_attempt_locked(&mut task, &template, user_input, prior_attempt_output)
            .await;
        self.running.lock().await.remove(&(task_id, stage_template_id));
        result
    }

    async fn run_attempt_locked(
        &self,
        task: &mut Task,
        template: &StageTemplate,
        user_input: Option<String>,
        prior_attempt_output: Option<String>,
    ) -> Result<Uuid> {
        let prior = self
            .store
            .latest_execution(task.id, template.id)
            .await?;
        let attempt_number = prior.map(|e| e.attempt_number + 1).unwrap_or(1);

        let mut worktree_warning = None;
        if template.output_format == OutputFormat::Research {
            if task.worktree_path.is_none() {
                let manager = WorktreeManager::new(self.project_path.clone(), &*self.git_runner);
                match manager.ensure_worktree(task) {
                    Ok(()) => self.store.update_task(task).await?,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "failed to create worktree for research stage, continuing in project root");
                        worktree_warning = Some(format!("[warn] failed to create worktree, continuing in project root: {e}\n"));
                    }
                }
            }
            if attempt_number > 1 {
                self.store.clear_task_stages(task.id).await?;
            }
        }

        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());

        let prompt = self
            .compose_prompt(task, template, user_input.as_deref(), prior_attempt_output.as_deref())
            .await?;

        let mut execution = StageExecution::new(task.id, template.id, attempt_number, prompt.clone());
        execution.user_input = user_input;

        self.store
            .create_execution_and_mark_in_progress(&execution, task.id)
            .await?;

        let envs = vec![
            ("STAGEHAND_DB_PATH".to_string(), self.db_path.clone()),
            ("STAGEHAND_TASK_ID".to_string(), task.id.to_string()),
        ];

        let args = build_agent_args(task, template);
        let (process_id, rx) = self
            .supervisor
            .spawn_agent(
                &self.agent_binary,
                &args,
                &working_directory,
                Some(execution.id),
                Some(prompt),
                &envs,
            )
            .await?;
        self.processes.lock().await.insert(execution.id, process_id);

        let mut raw_output = worktree_warning.unwrap_or_default();
        let mut exit_status: Option<Result<()>> = None;
        self.activity.touch(execution.id).await;

        let mut ticker = tokio::time::interval(Duration::from_millis(self.health_poll_interval_ms));
        ticker.tick().await; // first tick fires immediately; consume it up front

        'drain: loop {
            tokio::select! {
                event = rx.recv_async() => {
                    let Ok(event) = event else { break 'drain };
                    match event {
                        AgentEvent::Started { .. } => {
                            execution.status = ExecutionStatus::Running;
                            execution.started_at = Some(chrono::Utc::now());
                            self.store.update_execution(&execution).await?;
                        }
                        AgentEvent::StdoutLine { line } => {
                            raw_output.push_str(&line);
                            raw_output.push('\n');
                            self.activity.touch(execution.id).await;
                        }
                        AgentEvent::StderrLine { line } => {
                            raw_output.push_str(&format!("[stderr] {line}\n"));
                            self.activity.touch(execution.id).await;
                        }
                        AgentEvent::Completed { exit_code } => {
                            exit_status = Some(if exit_code == 0 { Ok(()) } else {
                                Err(PipelineError::Internal(format!("Process exited with code {exit_code}")))
                            });
                            break 'drain;
                        }
                        AgentEvent::Error { message } => {
                            exit_status = Some(Err(PipelineError::Internal(message)));
                            break 'drain;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let idle_for = self
                        .activity
                        .last_output_at(execution.id)
                        .await
                        .map(|last| chrono::Utc::now().signed_duration_since(last));
                    if let Some(idle_for) = idle_for {
                        if idle_for.to_std().unwrap_or_default()
                            > Duration::from_millis(self.health_inactivity_timeout_ms)
                        {
                            warn!(execution_id = %execution.id, "execution inactivity timeout exceeded");
                            let _ = self.supervisor.kill(process_id).await;
                            exit_status = Some(Err(PipelineError::Internal("Timed out waiting for output".to_string())));
                            break 'drain;
                        }
                    }
                }
            }
        }

        self.activity.clear(execution.id).await;
        self.processes.lock().await.remove(&execution.id);
        let was_killed = self.killed.lock().await.remove(&execution.id);

        execution.raw_output = raw_output;
        execution.counters = parsing::extract_usage_counters(&execution.raw_output);
        execution.completed_at = Some(chrono::Utc::now());

        if was_killed {
            execution.status = ExecutionStatus::Failed;
            execution.error_message = Some("Stopped by user".to_string());
        } else {
            match exit_status {
                Some(Ok(())) => {
                    execution.parsed_output = parsing::extract_structured_output(
                        &execution.raw_output,
                        execution.attempt_number,
                        template.output_format,
                    );
                    execution.status = ExecutionStatus::AwaitingUser;
                }
                Some(Err(e)) => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error_message = Some(e.to_string());
                }
                None => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error_message = Some("agent process ended without a result".to_string());
                }
            }
        }

        self.store.update_execution(&execution).await?;
        Ok(execution.id)
    }

    /// Request cancellation of a task's in-flight stage. Idempotent; safe
    /// to call before the process has finished spawning.
    pub async fn kill_current(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<()> {
        let execution = self
            .store
            .latest_execution(task_id, stage_template_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_template_id))?;
        self.killed.lock().await.insert(execution.id);
        if let Some(process_id) = self.processes.lock().await.get(&execution.id).copied() {
            self.supervisor.kill(process_id).await?;
        }
        Ok(())
    }

    /// Validate the user's decision against the stage's gate rule, fold the
    /// rendered output into `stage_result`/`stage_summary`, optionally open
    /// a PR, then either enter the commit sub-flow or advance directly.
    pub async fn approve_stage(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
        decision: Option<Value>,
    ) -> Result<()> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let template = self
            .store
            .get_stage_template(stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(stage_template_id))?;
        let mut execution = self
            .store
            .latest_execution(task_id, stage_template_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_template_id))?;

        if execution.status != ExecutionStatus::AwaitingUser {
            return Err(PipelineError::NotAwaitingUser);
        }

        parsing::validate_gate(&template.gate_rules, decision.as_ref())
            .map_err(PipelineError::GateFailed)?;

        let previous_approved = self.latest_approved_stage_result(task_id, stage_template_id).await?;
        let view = parsing::render_view(
            template.output_format,
            execution.parsed_output.as_ref(),
            &execution.raw_output,
            decision.as_ref(),
            execution.attempt_number,
        );
        let stage_result = parsing::compose_stage_result(template.result_mode, &view, previous_approved.as_deref());
        let stage_summary = parsing::render_summary(
            template.output_format,
            execution.parsed_output.as_ref(),
            &execution.raw_output,
            decision.as_ref(),
            execution.attempt_number,
        );

        execution.user_decision = decision;
        execution.stage_result = Some(stage_result);
        execution.stage_summary = Some(stage_summary);
        execution.status = ExecutionStatus::Approved;

        if template.creates_pr {
            self.create_pr_for_task(&mut task, &execution).await?;
            self.store.update_task(&task).await?;
        }

        if template.commit_eligible {
            self.store.update_execution(&execution).await?;
            self.enter_commit_subflow(&task, &template, &execution).await?;
        } else {
            self.store.update_execution(&execution).await?;
            self.advance(&task, &template).await?;
        }

        Ok(())
    }

    /// Approve a stage-selection stage: persist the chosen subsequent
    /// stages as the task's fixed stage sequence, then approve normally.
    pub async fn approve_with_stages(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
        selected_template_ids: Vec<Uuid>,
    ) -> Result<()> {
        let stages: Vec<TaskStage> = selected_template_ids
            .iter()
            .enumerate()
            .map(|(i, id)| TaskStage {
                task_id,
                stage_template_id: *id,
                sort_order: i as i64,
            })
            .collect();
        self.store.set_task_stages(task_id, &stages).await?;
        let decision = serde_json::to_value(&selected_template_ids)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        self.approve_stage(task_id, stage_template_id, Some(decision)).await
    }

    /// Resolve a pending commit left by the commit sub-flow, then advance
    /// the task past the stage that produced it.
    pub async fn resolve_commit(&self, stage_execution_id: Uuid, action: CommitAction) -> Result<()> {
        let pending = self
            .pending_commits
            .lock()
            .await
            .remove(&stage_execution_id)
            .ok_or_else(|| PipelineError::Internal("no pending commit for this execution".to_string()))?;

        let task = self
            .store
            .get_task(pending.task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(pending.task_id))?;
        let template = self
            .store
            .get_stage_template(pending.stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(pending.stage_template_id))?;

        if let CommitAction::Commit { message } = action {
            let working_directory = task
                .worktree_path
                .clone()
                .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());
            let ops = GitOps::new(self.git_runner.as_ref());
            ops.add_all(&working_directory)?;
            let message = message.unwrap_or(pending.suggested_message);
            ops.commit(&working_directory, &message)?;
        }

        self.advance(&task, &template).await
    }

    pub async fn pending_commit(&self, stage_execution_id: Uuid) -> Option<PendingCommit> {
        self.pending_commits.lock().await.get(&stage_execution_id).cloned()
    }

    async fn enter_commit_subflow(
        &self,
        task: &Task,
        template: &StageTemplate,
        execution: &StageExecution,
    ) -> Result<()> {
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());
        let ops = GitOps::new(self.git_runner.as_ref());

        if ops.is_clean(&working_directory)? {
            return self.advance(task, template).await;
        }

        let diff_stat = ops.diff_stat(&working_directory)?;
        let suggested_message = self
            .suggest_commit_message(task, template, &diff_stat)
            .await
            .unwrap_or_else(|_| format!("{}: {}", template.name, task.title));

        self.pending_commits.lock().await.insert(
            execution.id,
            PendingCommit {
                stage_execution_id: execution.id,
                task_id: task.id,
                stage_template_id: template.id,
                suggested_message,
                diff_stat,
            },
        );
        Ok(())
    }

    /// A one-shot, non-interactive agent call to summarize a diff into a
    /// commit message. Falls back to a templated message on any failure.
    async fn suggest_commit_message(
        &self,
        task: &Task,
        template: &StageTemplate,
        diff_stat: &str,
    ) -> Result<String> {
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());
        let prompt = format!(
            "Write a single-line git commit message summarizing this diff from the \"{}\" stage of \"{}\":\n\n{}",
            template.name, task.title, diff_stat
        );
        let (_id, rx) = self
            .supervisor
            .spawn_agent(&self.agent_binary, &[], &working_directory, None, Some(prompt), &[])
            .await?;
        let mut line = String::new();
        while let Ok(event) = rx.recv_async().await {
            match event {
                AgentEvent::StdoutLine { line: l } => line.push_str(&l),
                AgentEvent::Completed { .. } | AgentEvent::Error { .. } => break,
                _ => {}
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Err(PipelineError::Internal("empty commit message suggestion".to_string()))
        } else {
            Ok(trimmed.to_string())
        }
    }

    async fn create_pr_for_task(&self, task: &mut Task, execution: &StageExecution) -> Result<()> {
        let hosting = self
            .hosting
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("hosting client not configured".to_string()))?;
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());
        let ops = GitOps::new(self.git_runner.as_ref());
        let branch = task
            .branch_name
            .clone()
            .ok_or_else(|| PipelineError::Internal("task has no branch to open a PR from".to_string()))?;
        let base = ops.remote_head_branch(&working_directory)?;
        ops.push(&working_directory, &format!("{branch}:{branch}"))?;

        let body = execution.stage_summary.clone().unwrap_or_default();
        let pr_url = hosting.create_pr(&task.title, &body, &branch, &base).await?;
        task.pr_url = Some(pr_url);
        task.touch();
        Ok(())
    }

    /// Advance the task past `template` to the next stage in its effective
    /// sequence, or mark it completed (and tear down its worktree) if none
    /// remains.
    async fn advance(&self, task: &Task, template: &StageTemplate) -> Result<()> {
        let sequence = self.effective_stage_sequence(task.project_id, task.id).await?;
        let next = next_in_sequence(&sequence, template.id);

        let execution = self
            .store
            .latest_execution(task.id, template.id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(template.id))?;

        match &next {
            Some(next_template) => {
                self.store
                    .approve_and_advance(&execution, task.id, Some(next_template.id), false)
                    .await?;
            }
            None => {
                self.store
                    .approve_and_advance(&execution, task.id, None, true)
                    .await?;
                if matches!(task.completion_strategy, CompletionStrategy::DirectMerge | CompletionStrategy::Pr) {
                    let ops = GitOps::new(self.git_runner.as_ref());
                    let manager = WorktreeManager::new(self.project_path.clone(), &*self.git_runner);
                    let target = ops.remote_head_branch(&self.project_path.to_string_lossy())?;
                    manager.teardown(task, &target);
                }
            }
        }
        Ok(())
    }

    async fn effective_stage_sequence(&self, project_id: Uuid, task_id: Uuid) -> Result<Vec<StageTemplate>> {
        let mut task_stages = self.store.list_task_stages(task_id).await?;
        if task_stages.is_empty() {
            let mut templates = self.store.list_stage_templates(project_id).await?;
            templates.sort_by_key(|t| t.sort_order);
            return Ok(templates);
        }
        task_stages.sort_by_key(|s| s.sort_order);
        let mut out = Vec::with_capacity(task_stages.len());
        for stage in task_stages {
            if let Some(t) = self.store.get_stage_template(stage.stage_template_id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    async fn latest_approved_stage_result(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<Option<String>> {
        let executions = self.store.list_executions_for_stage(task_id, stage_template_id).await?;
        Ok(executions
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Approved)
            .filter_map(|e| e.stage_result)
            .last())
    }

    async fn compose_prompt(
        &self,
        task: &Task,
        template: &StageTemplate,
        user_input: Option<&str>,
        prior_attempt_output: Option<&str>,
    ) -> Result<String> {
        use eng_compose::ComposeContext;
        use eng_core::types::InputSource;

        let mut ctx = ComposeContext::new().set("task_description", task.description.clone());

        if matches!(template.input_source, InputSource::User | InputSource::Both) {
            ctx = ctx.set_opt("user_input", user_input.map(str::to_string));
        }
        if matches!(template.input_source, InputSource::PreviousStage | InputSource::Both) {
            let sequence = self.effective_stage_sequence(task.project_id, task.id).await?;
            if let Some(idx) = sequence.iter().position(|t| t.id == template.id) {
                if idx > 0 {
                    let previous = &sequence[idx - 1];
                    let previous_output = self.latest_approved_stage_result(task.id, previous.id).await?;
                    ctx = ctx.set_opt("previous_output", previous_output);
                }
            }
        }
        ctx = ctx.set_opt("prior_attempt_output", prior_attempt_output.map(str::to_string));

        let summaries = self.approved_stage_summaries(task.id).await?;
        ctx = ctx.set_opt("stage_summaries", (!summaries.is_empty()).then_some(summaries));

        Ok(eng_compose::render(&template.prompt_template, &ctx))
    }

    async fn approved_stage_summaries(&self, task_id: Uuid) -> Result<String> {
        let executions = self.store.list_executions_for_task(task_id).await?;
        let mut lines = Vec::new();
        for execution in executions {
            if execution.status != ExecutionStatus::Approved {
                continue;
            }
            if let Some(template) = self.store.get_stage_template(execution.stage_template_id).await? {
                if let Some(summary) = execution.stage_summary {
                    lines.push(format!("{}: {}", template.name, summary));
                }
            }
        }
        Ok(lines.join("\n"))
    }

    /// Run the merge sub-stage (§4.8) for `template`'s stage against the
    /// task's current attempt. Shares the same (task, template) soft-lock
    /// as the generic run path so a merge can't race a redo of itself.
    pub async fn run_merge_stage(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<MergeOutcome> {
        {
            let mut running = self.running.lock().await;
            if !running.insert((task_id, stage_template_id)) {
                return Err(PipelineError::Busy);
            }
        }
        let result = self.run_merge_stage_locked(task_id, stage_template_id).await;
        self.running.lock().await.remove(&(task_id, stage_template_id));
        result
    }

    async fn run_merge_stage_locked(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<MergeOutcome> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let template = self
            .store
            .get_stage_template(stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(stage_template_id))?;

        let any_ejected = self
            .store
            .ejected_task(task.project_id)
            .await?
            .map(|t| t.id != task_id)
            .unwrap_or(false);

        let stage = MergeStage::new(self.git_runner.as_ref(), self.project_path.clone());
        let outcome = stage.run(&task, any_ejected)?;

        let prior = self.store.latest_execution(task_id, stage_template_id).await?;
        let attempt_number = prior.map(|e| e.attempt_number + 1).unwrap_or(1);
        let mut execution = StageExecution::new(task_id, stage_template_id, attempt_number, String::new());
        execution.status = ExecutionStatus::Approved;
        execution.stage_result = Some(match &outcome {
            MergeOutcome::Merged { target_branch } => format!("merged into {target_branch}"),
            MergeOutcome::NothingToMerge { target_branch } => format!("nothing to merge into {target_branch}"),
        });
        execution.stage_summary = execution.stage_result.clone();
        execution.completed_at = Some(chrono::Utc::now());
        self.store
            .create_execution_and_mark_in_progress(&execution, task_id)
            .await?;
        self.store.update_execution(&execution).await?;

        let target = ops_remote_head_branch(self.git_runner.as_ref(), &self.project_path.to_string_lossy())?;
        let manager = WorktreeManager::new(self.project_path.clone(), &*self.git_runner);
        manager.teardown(&task, &target);
        task.status = TaskStatus::Completed;
        task.touch();
        self.store.update_task(&task).await?;

        self.advance(&task, &template).await?;
        Ok(outcome)
    }

    /// Start an interactive terminal sub-stage (§4.1.6) for `task`'s current
    /// worktree, recording the spawned process id against the stage
    /// execution so `finish_terminal`/`stop_terminal` can find it again.
    pub async fn start_terminal(&self, task_id: Uuid, stage_template_id: Uuid) -> Result<(Uuid, flume::Receiver<eng_process::PtyEvent>)> {
        {
            let mut running = self.running.lock().await;
            if !running.insert((task_id, stage_template_id)) {
                return Err(PipelineError::Busy);
            }
        }
        let result = self.start_terminal_locked(task_id, stage_template_id).await;
        if result.is_err() {
            self.running.lock().await.remove(&(task_id, stage_template_id));
        }
        result
    }

    async fn start_terminal_locked(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
    ) -> Result<(Uuid, flume::Receiver<eng_process::PtyEvent>)> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let template = self
            .store
            .get_stage_template(stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(stage_template_id))?;

        let had_worktree = task.worktree_path.is_some();
        let manager = WorktreeManager::new(self.project_path.clone(), &*self.git_runner);
        manager.ensure_worktree(&mut task)?;
        if !had_worktree {
            self.store.update_task(&task).await?;
        }
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());

        let prior = self.store.latest_execution(task_id, stage_template_id).await?;
        let attempt_number = prior.map(|e| e.attempt_number + 1).unwrap_or(1);
        let mut execution = StageExecution::new(task_id, stage_template_id, attempt_number, String::new());
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(chrono::Utc::now());
        self.store
            .create_execution_and_mark_in_progress(&execution, task_id)
            .await?;
        let _ = &template;

        let stage = TerminalStage::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.git_runner),
            self.pty_binary.clone(),
            self.agent_binary.clone(),
        );
        let (process_id, rx) = stage.start(&working_directory, execution.id).await?;
        self.processes.lock().await.insert(execution.id, process_id);
        self.terminals.lock().await.insert(execution.id, process_id);
        Ok((execution.id, rx))
    }

    pub async fn write_terminal(&self, stage_execution_id: Uuid, data: &[u8]) -> Result<()> {
        let process_id = self
            .terminals
            .lock()
            .await
            .get(&stage_execution_id)
            .copied()
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        self.supervisor.write(process_id, data).await.map_err(Into::into)
    }

    pub async fn resize_terminal(&self, stage_execution_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        let process_id = self
            .terminals
            .lock()
            .await
            .get(&stage_execution_id)
            .copied()
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        self.supervisor.resize(process_id, cols, rows).await.map_err(Into::into)
    }

    /// "Finish" an interactive terminal: kill the PTY, summarize, and hand
    /// back a pending commit if the worktree is dirty, exactly like the
    /// generic commit sub-flow.
    pub async fn finish_terminal(
        &self,
        stage_execution_id: Uuid,
        captured_output: &str,
    ) -> Result<String> {
        let mut execution = self
            .store
            .get_execution(stage_execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        let task = self
            .store
            .get_task(execution.task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(execution.task_id))?;
        let template = self
            .store
            .get_stage_template(execution.stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(execution.stage_template_id))?;
        let process_id = self
            .terminals
            .lock()
            .await
            .remove(&stage_execution_id)
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        self.processes.lock().await.remove(&stage_execution_id);

        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());

        let stage = TerminalStage::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.git_runner),
            self.pty_binary.clone(),
            self.agent_binary.clone(),
        );
        let (summary, pending) = stage
            .finish(process_id, captured_output, &task, &template, &execution, &working_directory)
            .await?;

        execution.stage_summary = Some(summary.clone());
        execution.completed_at = Some(chrono::Utc::now());

        if let Some(pending) = pending {
            execution.status = ExecutionStatus::Approved;
            self.store.update_execution(&execution).await?;
            self.pending_commits.lock().await.insert(stage_execution_id, pending);
        } else {
            execution.stage_result = Some(summary.clone());
            execution.status = ExecutionStatus::Approved;
            self.store.update_execution(&execution).await?;
            self.advance(&task, &template).await?;
        }

        self.running.lock().await.remove(&(task.id, template.id));
        Ok(summary)
    }

    /// "Stop" an interactive terminal: kill without summarizing and fail
    /// the execution.
    pub async fn stop_terminal(&self, stage_execution_id: Uuid) -> Result<()> {
        let mut execution = self
            .store
            .get_execution(stage_execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        let process_id = self
            .terminals
            .lock()
            .await
            .remove(&stage_execution_id)
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        self.processes.lock().await.remove(&stage_execution_id);

        let stage = TerminalStage::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.git_runner),
            self.pty_binary.clone(),
            self.agent_binary.clone(),
        );
        stage.stop(process_id).await?;

        execution.status = ExecutionStatus::Failed;
        execution.error_message = Some("Stopped by user".to_string());
        execution.completed_at = Some(chrono::Utc::now());
        self.store.update_execution(&execution).await?;
        self.running.lock().await.remove(&(execution.task_id, execution.stage_template_id));
        Ok(())
    }

    /// Poll the hosting remote for new review activity on a task's PR and
    /// upsert it into `pr_review_fixes`. Returns the count of newly seen
    /// comments, for the caller to raise a notification.
    pub async fn poll_pr_review(&self, stage_execution_id: Uuid) -> Result<usize> {
        let execution = self
            .store
            .get_execution(stage_execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        let task = self
            .store
            .get_task(execution.task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(execution.task_id))?;
        let pr_number = pr_number_from_url(&task)?;
        let loop_ = self.pr_review_loop()?;
        loop_.poll(stage_execution_id, pr_number).await
    }

    /// Run one fix (or mark one comment skipped) as part of the PR-review
    /// sub-loop (§4.7).
    pub async fn apply_pr_review_fix(&self, fix: &PrReviewFix, task_id: Uuid, action: FixAction<'_>) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());
        let loop_ = self.pr_review_loop()?;
        match action {
            FixAction::Fix { user_context } => loop_.fix(fix, &working_directory, user_context).await,
            FixAction::Skip => loop_.skip(fix.id).await,
        }
    }

    /// Finalize the PR-review sub-stage: push, post the triage summary, and
    /// advance the task past this stage.
    pub async fn finalize_pr_review(&self, stage_execution_id: Uuid) -> Result<()> {
        let mut execution = self
            .store
            .get_execution(stage_execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(stage_execution_id))?;
        let mut task = self
            .store
            .get_task(execution.task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(execution.task_id))?;
        let template = self
            .store
            .get_stage_template(execution.stage_template_id)
            .await?
            .ok_or(PipelineError::TemplateNotFound(execution.stage_template_id))?;
        let pr_number = pr_number_from_url(&task)?;
        let working_directory = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.project_path.to_string_lossy().to_string());

        let loop_ = self.pr_review_loop()?;
        loop_.finalize(&mut execution, &mut task, pr_number, &working_directory).await?;
        self.advance(&task, &template).await
    }

    fn pr_review_loop(&self) -> Result<PrReviewLoop> {
        let hosting = self
            .hosting
            .clone()
            .ok_or_else(|| PipelineError::Internal("hosting client not configured".to_string()))?;
        Ok(PrReviewLoop::new(
            self.store.clone(),
            hosting,
            Arc::clone(&self.supervisor),
            Arc::clone(&self.git_runner),
            self.agent_binary.clone(),
        ))
    }
}

/// Build the agent subprocess's CLI arguments per §6's agent contract: an
/// output-format selector requesting newline-delimited structured events, a
/// session id scoping this (task, stage) conversation, an appended system
/// prompt (the template's persona, plus a staging/commit-forbidding
/// directive for `commit_eligible` stages per §4.1.1 step 10), and a tool
/// whitelist.
fn build_agent_args(task: &Task, template: &StageTemplate) -> Vec<String> {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--session-id".to_string(),
        format!("{}-{}", task.id, template.id),
    ];

    let mut system_prompt = template.persona_system_prompt.clone().unwrap_or_default();
    if template.commit_eligible {
        let directive = "Do not stage or commit any changes yourself (no `git add`, `git commit`, or \
            equivalent) — the caller stages and commits on your behalf once you finish.";
        system_prompt = if system_prompt.trim().is_empty() {
            directive.to_string()
        } else {
            format!("{system_prompt}\n\n{directive}")
        };
    }
    if !system_prompt.trim().is_empty() {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt);
    }

    if !template.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(template.allowed_tools.join(","));
    }

    args
}

/// The trailing `/123` segment of a task's PR URL, parsed as a PR number.
fn pr_number_from_url(task: &Task) -> Result<u64> {
    let url = task
        .pr_url
        .as_deref()
        .ok_or_else(|| PipelineError::Internal("task has no PR url".to_string()))?;
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| PipelineError::Internal(format!("could not parse PR number from url: {url}")))
}

fn ops_remote_head_branch(git_runner: &dyn GitRunner, dir: &str) -> Result<String> {
    GitOps::new(git_runner).remote_head_branch(dir).map_err(Into::into)
}

fn next_in_sequence(sequence: &[StageTemplate], current_id: Uuid) -> Option<StageTemplate> {
    let idx = sequence.iter().position(|t| t.id == current_id)?;
    sequence.get(idx + 1).cloned()
}

#[allow(dead_code)]
fn mark_ejected(task: &mut Task) {
    task.ejected = true;
    task.touch();
}

#[allow(dead_code)]
fn task_status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Archived => "archived",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eng_core::types::{GateRule, InputSource, OutputFormat, Project, ResultMode};
    use eng_git::{GitOutput, GitResult};
    use std::sync::Mutex as StdMutex;

    struct MockRunner {
        calls: StdMutex<Vec<String>>,
    }

    impl MockRunner {
        fn new() -> Self {
            Self { calls: StdMutex::new(Vec::new()) }
        }
    }

    impl GitRunner for MockRunner {
        fn run_git(&self, _working_directory: &str, args: &[&str]) -> GitResult<GitOutput> {
            self.calls.lock().unwrap().push(args.join(" "));
            let stdout = match args.first() {
                Some(&"status") => String::new(),
                Some(&"rev-parse") => "main\n".to_string(),
                _ => String::new(),
            };
            Ok(GitOutput { success: true, stdout, stderr: String::new() })
        }
    }

    async fn engine_with_store() -> (Engine, ProjectDb, Uuid, Uuid, Uuid) {
        let store = ProjectDb::open_in_memory().await.unwrap();
        let project = Project::new("demo", "/tmp/demo");
        let research = StageTemplate::new(project.id, "research", 0, "Research: {{task_description}}", OutputFormat::Research);
        let mut plan = StageTemplate::new(project.id, "plan", 1, "Plan from: {{previous_output}}", OutputFormat::Plan);
        plan.gate_rules = GateRule::RequireApproval;
        plan.input_source = InputSource::PreviousStage;
        plan.result_mode = ResultMode::Replace;
        store.upsert_stage_template(&research).await.unwrap();
        store.upsert_stage_template(&plan).await.unwrap();

        let task = Task::new(project.id, "Fix the login bug", "users cannot log in");
        store.create_task(&task).await.unwrap();

        let supervisor = Arc::new(Supervisor::new());
        let runner: Arc<dyn GitRunner> = Arc::new(MockRunner::new());
        let engine = Engine::new(store.clone(), supervisor, runner, "/tmp/demo", "/tmp/demo/app.db", "echo");
        (engine, store, project.id, task.id, research.id)
    }

    #[tokio::test]
    async fn run_stage_rejects_concurrent_attempts_on_same_stage() {
        let (engine, _store, _project_id, task_id, stage_id) = engine_with_store().await;
        let first = engine.run_stage(task_id, stage_id, None);
        let second = engine.run_stage(task_id, stage_id, None);
        let (a, b) = tokio::join!(first, second);
        let ok_count = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok_count, 1, "exactly one concurrent attempt should win the lock");
    }

    #[tokio::test]
    async fn approve_stage_rejects_when_not_awaiting_user() {
        let (engine, _store, _project_id, task_id, stage_id) = engine_with_store().await;
        let err = engine.approve_stage(task_id, stage_id, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn run_stage_then_approve_advances_to_next_stage() {
        let (engine, store, _project_id, task_id, stage_id) = engine_with_store().await;
        engine.run_stage(task_id, stage_id, None).await.unwrap();

        let execution = store.latest_execution(task_id, stage_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::AwaitingUser);

        engine.approve_stage(task_id, stage_id, None).await.unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.current_stage_id.is_some());
    }

    #[tokio::test]
    async fn research_redo_clears_prior_task_stage_selection() {
        let (engine, store, _project_id, task_id, stage_id) = engine_with_store().await;
        engine.run_stage(task_id, stage_id, None).await.unwrap();

        let stages = vec![TaskStage { task_id, stage_template_id: stage_id, sort_order: 0 }];
        store.set_task_stages(task_id, &stages).await.unwrap();
        assert!(!store.list_task_stages(task_id).await.unwrap().is_empty());

        engine.redo_stage(task_id, stage_id, None).await.unwrap();
        assert!(
            store.list_task_stages(task_id).await.unwrap().is_empty(),
            "a second research attempt must force the user to re-select stages"
        );
    }

    #[tokio::test]
    async fn redo_findings_stage_routes_feedback_into_prior_attempt_output() {
        let (engine, store, project_id, task_id, _stage_id) = engine_with_store().await;
        let findings = StageTemplate::new(
            project_id,
            "findings",
            2,
            "Findings request: {{user_input}} | prior={{prior_attempt_output}}",
            OutputFormat::Findings,
        );
        store.upsert_stage_template(&findings).await.unwrap();

        engine.run_stage(task_id, findings.id, Some("initial ask".to_string())).await.unwrap();
        engine
            .redo_stage(task_id, findings.id, Some("apply f1 and f2".to_string()))
            .await
            .unwrap();

        let execution = store.latest_execution(task_id, findings.id).await.unwrap().unwrap();
        assert_eq!(execution.attempt_number, 2);
        assert!(execution.user_input.is_none(), "selection feedback should not become {{user_input}}");
        assert!(execution.input_prompt.contains("prior=apply f1 and f2"));
        assert!(!execution.input_prompt.contains("Findings request: apply"));
    }

    #[tokio::test]
    async fn redo_text_stage_preserves_first_attempt_user_input_and_appends_followup() {
        let (engine, store, project_id, task_id, _stage_id) = engine_with_store().await;
        let mut text_stage = StageTemplate::new(
            project_id,
            "implementation",
            3,
            "Task: {{user_input}}",
            OutputFormat::Text,
        );
        text_stage.input_source = InputSource::User;
        store.upsert_stage_template(&text_stage).await.unwrap();

        engine.run_stage(task_id, text_stage.id, Some("fix the bug".to_string())).await.unwrap();
        engine
            .redo_stage(task_id, text_stage.id, Some("also add a test".to_string()))
            .await
            .unwrap();

        let execution = store.latest_execution(task_id, text_stage.id).await.unwrap().unwrap();
        assert_eq!(execution.attempt_number, 2);
        let carried = execution.user_input.as_deref().unwrap_or_default();
        assert!(carried.contains("fix the bug"));
        assert!(carried.contains("also add a test"));
    }

    #[test]
    fn build_agent_args_appends_commit_forbidding_directive_for_commit_eligible_stages() {
        let project_id = Uuid::new_v4();
        let task = Task::new(project_id, "Fix the login bug", "users cannot log in");
        let mut template = StageTemplate::new(project_id, "implementation", 1, "Task: {{user_input}}", OutputFormat::Text);
        template.commit_eligible = true;
        template.persona_system_prompt = Some("You are a careful senior engineer.".to_string());
        template.allowed_tools = vec!["edit".to_string(), "bash".to_string()];

        let args = build_agent_args(&task, &template);
        assert!(args.windows(2).any(|w| w == ["--output-format".to_string(), "stream-json".to_string()]));
        let system_prompt_idx = args.iter().position(|a| a == "--append-system-prompt").unwrap();
        let system_prompt = &args[system_prompt_idx + 1];
        assert!(system_prompt.contains("You are a careful senior engineer."));
        assert!(system_prompt.to_lowercase().contains("commit"));
        let tools_idx = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(args[tools_idx + 1], "edit,bash");
    }

    #[test]
    fn build_agent_args_omits_system_prompt_flag_when_nothing_to_say() {
        let project_id = Uuid::new_v4();
        let task = Task::new(project_id, "Research the bug", "users cannot log in");
        let template = StageTemplate::new(project_id, "research", 0, "Research: {{task_description}}", OutputFormat::Research);
        let args = build_agent_args(&task, &template);
        assert!(!args.contains(&"--append-system-prompt".to_string()));
        assert!(!args.contains(&"--allowed-tools".to_string()));
    }
}
