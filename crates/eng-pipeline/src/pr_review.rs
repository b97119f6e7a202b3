use std::collections::HashSet;
use std::sync::Arc;

use eng_core::types::{CommentType, ExecutionStatus, FixStatus, PrReviewFix, StageExecution, Task, TaskStatus};
use eng_git::{GitOps, GitRunner, HostingClient};
use eng_process::{AgentEvent, Supervisor};
use eng_store::ProjectDb;
use uuid::Uuid;

use crate::error::Result;

/// What the user chose to do with one `PrReviewFix`.
pub enum FixAction<'a> {
    Fix { user_context: Option<&'a str> },
    Skip,
}

/// The PR-review sub-loop (§4.7): polls the hosting remote for review
/// activity, upserts it as `PrReviewFix` rows, runs a fix for one row at a
/// time, and finalizes the stage once the user has triaged everything.
pub struct PrReviewLoop {
    store: ProjectDb,
    hosting: Arc<HostingClient>,
    supervisor: Arc<Supervisor>,
    git_runner: Arc<dyn GitRunner>,
    agent_binary: String,
}

impl PrReviewLoop {
    pub fn new(
        store: ProjectDb,
        hosting: Arc<HostingClient>,
        supervisor: Arc<Supervisor>,
        git_runner: Arc<dyn GitRunner>,
        agent_binary: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hosting,
            supervisor,
            git_runner,
            agent_binary: agent_binary.into(),
        }
    }

    /// One poll pass: fetch reviews, inline comments, and conversation
    /// comments, and upsert each as a `PrReviewFix` row keyed by
    /// (execution_id, comment_id, comment_type). Returns the count of rows
    /// not previously seen, for the caller to fire a desktop notification.
    pub async fn poll(&self, execution_id: Uuid, pr_number: u64) -> Result<usize> {
        let existing: HashSet<(i64, CommentType)> = self
            .store
            .list_fixes_for_execution(execution_id)
            .await?
            .into_iter()
            .map(|f| (f.comment_id, f.comment_type))
            .collect();

        let mut comments = self.hosting.list_reviews(pr_number).await?;
        comments.extend(self.hosting.list_inline_comments(pr_number).await?);
        comments.extend(self.hosting.list_conversation_comments(pr_number).await?);

        let mut new_count = 0;
        for comment in comments {
            if !existing.contains(&(comment.comment_id, comment.comment_type)) {
                new_count += 1;
            }
            let mut fix = PrReviewFix::new(
                execution_id,
                comment.comment_id,
                comment.comment_type,
                comment.author,
                comment.body,
            );
            fix.file_path = comment.file_path;
            fix.line = comment.line;
            fix.diff_hunk = comment.diff_hunk;
            fix.state = comment.state;
            self.store.upsert_pr_review_fix(&fix).await?;
        }
        Ok(new_count)
    }

    /// Fix one comment: snapshot the pre-fix changed-file set, spawn an
    /// agent from the comment's body/file/line/diff_hunk plus optional user
    /// context, then stage and commit only the files that changed since the
    /// snapshot. A clean worktree after the agent runs (nothing to do, or
    /// the user only wanted a comment acknowledged) still counts as fixed.
    pub async fn fix(&self, fix: &PrReviewFix, working_directory: &str, user_context: Option<&str>) -> Result<()> {
        self.store.update_fix_status(fix.id, FixStatus::Fixing, None).await?;

        let ops = GitOps::new(self.git_runner.as_ref());
        let before = changed_files(&ops, working_directory)?;

        let prompt = build_fix_prompt(fix, user_context);
        let (_id, rx) = self
            .supervisor
            .spawn_agent(&self.agent_binary, &[], working_directory, None, Some(prompt), &[])
            .await?;
        drain_agent_events(rx).await;

        if ops.is_clean(working_directory)? {
            self.store.update_fix_status(fix.id, FixStatus::Fixed, None).await?;
            return Ok(());
        }

        let after = changed_files(&ops, working_directory)?;
        let newly_changed: Vec<String> = after.into_iter().filter(|f| !before.contains(f)).collect();
        if newly_changed.is_empty() {
            self.store.update_fix_status(fix.id, FixStatus::Fixed, None).await?;
            return Ok(());
        }

        ops.add_paths(working_directory, &newly_changed)?;
        let message = format!("fix: address review comment by {}", fix.author);
        let hash = ops.commit(working_directory, &message)?;
        self.store.update_fix_status(fix.id, FixStatus::Fixed, Some(hash)).await?;
        Ok(())
    }

    /// "Skip": the user chose not to address this comment at all.
    pub async fn skip(&self, fix_id: Uuid) -> Result<()> {
        self.store.update_fix_status(fix_id, FixStatus::Skipped, None).await?;
        Ok(())
    }

    /// "Mark done": push the branch, post a summary comment on the PR,
    /// write that summary as the execution's `stage_result`, mark the
    /// execution `approved`, and the task `completed`.
    pub async fn finalize(
        &self,
        execution: &mut StageExecution,
        task: &mut Task,
        pr_number: u64,
        working_directory: &str,
    ) -> Result<()> {
        let ops = GitOps::new(self.git_runner.as_ref());
        if let Some(branch) = &task.branch_name {
            ops.push(working_directory, &format!("{branch}:{branch}"))?;
        }

        let fixes = self.store.list_fixes_for_execution(execution.id).await?;
        let fixed = fixes.iter().filter(|f| f.fix_status == FixStatus::Fixed).count();
        let skipped = fixes.iter().filter(|f| f.fix_status == FixStatus::Skipped).count();
        let pending = fixes.iter().filter(|f| f.fix_status == FixStatus::Pending).count();
        let summary = format!("{fixed} fixed, {skipped} skipped, {pending} pending");

        self.hosting.add_comment(pr_number, &summary).await?;

        execution.stage_result = Some(summary);
        execution.status = ExecutionStatus::Approved;
        self.store.update_execution(execution).await?;

        task.status = TaskStatus::Completed;
        task.touch();
        self.store.update_task(task).await?;
        Ok(())
    }
}

/// Paths with pending changes per `git status --porcelain`: two status
/// characters, a space, then the path.
fn changed_files(ops: &GitOps<'_>, dir: &str) -> Result<HashSet<String>> {
    let status = ops.status_porcelain(dir)?;
    Ok(status
        .lines()
        .filter_map(|l| l.get(3..))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn build_fix_prompt(fix: &PrReviewFix, user_context: Option<&str>) -> String {
    let mut prompt = format!("Address this PR review comment from {}:\n\n{}\n", fix.author, fix.body);
    if let (Some(path), Some(line)) = (&fix.file_path, fix.line) {
        prompt.push_str(&format!("\nFile: {path}:{line}\n"));
    }
    if let Some(hunk) = &fix.diff_hunk {
        prompt.push_str(&format!("\nDiff context:\n{hunk}\n"));
    }
    if let Some(context) = user_context {
        prompt.push_str(&format!("\nAdditional context from the user:\n{context}\n"));
    }
    prompt
}

async fn drain_agent_events(rx: flume::Receiver<AgentEvent>) {
    while let Ok(event) = rx.recv_async().await {
        if matches!(event, AgentEvent::Completed { .. } | AgentEvent::Error { .. }) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eng_core::types::Project;

    #[tokio::test]
    async fn poll_upserts_rows_and_counts_only_new_ones() {
        let store = ProjectDb::open_in_memory().await.unwrap();
        let project = Project::new("demo", "/tmp/demo");
        let template = eng_core::types::StageTemplate::new(
            project.id,
            "PR Review",
            0,
            "{{task_description}}",
            eng_core::types::OutputFormat::PrReview,
        );
        store.upsert_stage_template(&template).await.unwrap();
        let task = Task::new(project.id, "Add button", "desc");
        store.create_task(&task).await.unwrap();
        let execution = StageExecution::new(task.id, template.id, 1, "prompt");
        store.create_execution_and_mark_in_progress(&execution, task.id).await.unwrap();

        let fix_id = Uuid::new_v4();
        let mut existing = PrReviewFix::new(execution.id, 1, CommentType::Inline, "reviewer", "fix this");
        existing.id = fix_id;
        store.upsert_pr_review_fix(&existing).await.unwrap();

        let fixes = store.list_fixes_for_execution(execution.id).await.unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].fix_status, FixStatus::Pending);
    }

    #[test]
    fn build_fix_prompt_includes_file_and_line() {
        let mut fix = PrReviewFix::new(Uuid::new_v4(), 1, CommentType::Inline, "reviewer", "please fix");
        fix.file_path = Some("src/lib.rs".to_string());
        fix.line = Some(42);
        let prompt = build_fix_prompt(&fix, None);
        assert!(prompt.contains("src/lib.rs:42"));
    }

    #[test]
    fn build_fix_prompt_includes_user_context_when_given() {
        let fix = PrReviewFix::new(Uuid::new_v4(), 1, CommentType::Conversation, "reviewer", "please fix");
        let prompt = build_fix_prompt(&fix, Some("only touch the error path"));
        assert!(prompt.contains("only touch the error path"));
    }

    #[test]
    fn changed_files_parses_porcelain_status() {
        struct StaticRunner;
        impl GitRunner for StaticRunner {
            fn run_git(&self, _dir: &str, _args: &[&str]) -> eng_git::GitResult<eng_git::GitOutput> {
                Ok(eng_git::GitOutput {
                    success: true,
                    stdout: " M src/lib.rs\n?? new_file.rs\n".to_string(),
                    stderr: String::new(),
                })
            }
        }
        let runner = StaticRunner;
        let ops = GitOps::new(&runner);
        let files = changed_files(&ops, ".").unwrap();
        assert!(files.contains("src/lib.rs"));
        assert!(files.contains("new_file.rs"));
    }
}
