use std::path::PathBuf;

use eng_core::types::Task;
use eng_git::{GitError, GitOps, GitResult, GitRunner};
use thiserror::Error;
use tracing::{info, warn};

const WORKTREE_DIRNAME: &str = ".stagehand-worktrees";
const MAX_BRANCH_NAME_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("project root is dirty, eject refused")]
    DirtyMainRepo,
    #[error("another task is already ejected for this project")]
    AlreadyEjected,
    #[error("no worktree recorded for this task")]
    NoWorktree,
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

/// Outcome of a task-branch merge attempt, mirrored in the merge sub-stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict(Vec<String>),
    NothingToMerge,
}

/// Derive a branch name from a task title: lowercase, alphanumeric-and-dash,
/// stripped of any leading `[TICKET]`-style token, truncated to 50 chars.
pub fn derive_branch_name(title: &str) -> String {
    let without_ticket = match title.find(']') {
        Some(end) if title.trim_start().starts_with('[') => title[end + 1..].trim(),
        _ => title,
    };

    let mut sanitized = String::new();
    let mut last_was_dash = false;
    for c in without_ticket.to_lowercase().chars() {
        if c.is_alphanumeric() {
            sanitized.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !sanitized.is_empty() {
            sanitized.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = sanitized.trim_end_matches('-');
    let truncated: String = trimmed.chars().take(MAX_BRANCH_NAME_LEN).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        "task".to_string()
    } else {
        format!("feature/{truncated}")
    }
}

/// Path a branch name resolves to under `.stagehand-worktrees`, with slashes
/// replaced by a double dash so the branch's namespace segments don't create
/// nested directories.
fn worktree_dir_name(branch_name: &str) -> String {
    branch_name.replace('/', "--")
}

/// Manages per-task git worktrees: creation on first Research stage,
/// eject/inject, and teardown on completion or merge, per §4.6.
pub struct WorktreeManager<'a> {
    project_path: PathBuf,
    ops: GitOps<'a>,
}

impl<'a> WorktreeManager<'a> {
    pub fn new(project_path: impl Into<PathBuf>, runner: &'a dyn GitRunner) -> Self {
        Self { project_path: project_path.into(), ops: GitOps::new(runner) }
    }

    fn project_path_str(&self) -> String {
        self.project_path.to_string_lossy().to_string()
    }

    pub fn worktree_path(&self, branch_name: &str) -> PathBuf {
        self.project_path.join(WORKTREE_DIRNAME).join(worktree_dir_name(branch_name))
    }

    /// Ensure a task has a branch name and worktree, creating both if absent.
    /// Mutates `task` in place with the derived/persisted fields.
    pub fn ensure_worktree(&self, task: &mut Task) -> Result<()> {
        if task.worktree_path.is_some() && task.branch_name.is_some() {
            return Ok(());
        }

        let branch_name = task.branch_name.clone().unwrap_or_else(|| derive_branch_name(&task.title));
        let wt_path = self.worktree_path(&branch_name);
        let dir_str = self.project_path_str();

        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if wt_path.exists() {
            warn!(path = %wt_path.display(), "removing stale worktree before recreate");
            let _ = self.ops.worktree_remove(&dir_str, &wt_path.to_string_lossy());
            let _ = std::fs::remove_dir_all(&wt_path);
        }

        let branch_exists = self.ops.branch_exists(&dir_str, &branch_name)?;
        self.ops.worktree_add(&dir_str, &wt_path.to_string_lossy(), &branch_name, !branch_exists)?;

        info!(task_id = %task.id, branch = %branch_name, path = %wt_path.display(), "worktree created for task");

        task.branch_name = Some(branch_name);
        task.worktree_path = Some(wt_path.to_string_lossy().to_string());
        task.touch();
        Ok(())
    }

    /// Check the main repo out onto the task's branch, pausing the pipeline.
    /// Requires a clean main repo and, failing a clean worktree, a
    /// commit-before-eject by the caller.
    pub fn eject(&self, task: &mut Task, any_task_already_ejected: bool) -> Result<()> {
        if any_task_already_ejected {
            return Err(WorktreeManagerError::AlreadyEjected);
        }
        let dir_str = self.project_path_str();
        if !self.ops.is_clean(&dir_str)? {
            return Err(WorktreeManagerError::DirtyMainRepo);
        }
        let branch_name = task.branch_name.clone().ok_or(WorktreeManagerError::NoWorktree)?;
        self.ops.checkout(&dir_str, &branch_name)?;
        task.ejected = true;
        task.touch();
        Ok(())
    }

    /// Re-create the worktree at its expected path and clear `ejected`.
    pub fn inject(&self, task: &mut Task) -> Result<()> {
        let dir_str = self.project_path_str();
        let branch_name = task.branch_name.clone().ok_or(WorktreeManagerError::NoWorktree)?;
        let remote_head = self.ops.remote_head_branch(&dir_str).unwrap_or_else(|_| "main".to_string());
        self.ops.checkout(&dir_str, &remote_head)?;

        task.worktree_path = None;
        self.ensure_worktree(task)?;
        task.ejected = false;
        task.touch();
        Ok(())
    }

    /// Remove the worktree; if the branch was verified merged into
    /// `target_branch`, delete it too. Best-effort: logs and swallows
    /// failures rather than blocking task completion.
    pub fn teardown(&self, task: &Task, target_branch: &str) {
        let dir_str = self.project_path_str();
        let Some(wt_path) = &task.worktree_path else { return };

        if let Err(e) = self.ops.worktree_remove(&dir_str, wt_path) {
            warn!(task_id = %task.id, error = %e, "failed to remove worktree during teardown");
        }

        if let Some(branch_name) = &task.branch_name {
            match self.ops.is_ancestor(&dir_str, branch_name, target_branch) {
                Ok(true) => {
                    if let Err(e) = self.ops.delete_branch(&dir_str, branch_name) {
                        warn!(task_id = %task.id, error = %e, "failed to delete merged branch");
                    }
                }
                Ok(false) => {
                    info!(task_id = %task.id, branch = %branch_name, "branch not verified merged, keeping");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "could not verify branch ancestry, keeping branch");
                }
            }
        }
    }

    /// Merge a task's branch into the checked-out branch of the main repo.
    /// Used outside the detached-worktree merge sub-stage (§4.8) for simpler
    /// same-repo merges.
    pub fn merge_to_current(&self, branch_name: &str) -> GitResult<MergeResult> {
        let dir_str = self.project_path_str();
        let _ = self.ops.fetch(&dir_str);

        let current = self.ops.current_branch(&dir_str)?;
        let stat = self.ops.diff_range_stat(&dir_str, &current, branch_name)?;
        if stat.trim().is_empty() {
            return Ok(MergeResult::NothingToMerge);
        }

        let out = self.ops.merge(&dir_str, branch_name)?;
        if out.success {
            let msg = format!("Merge branch '{branch_name}' into {current}");
            self.ops.commit(&dir_str, &msg)?;
            Ok(MergeResult::Success)
        } else {
            let conflicts = self.ops.diff_range_name_only(&dir_str, &current, branch_name).unwrap_or_default();
            let _ = self.ops.merge_abort(&dir_str);
            Ok(MergeResult::Conflict(conflicts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eng_git::GitOutput;
    use std::sync::Mutex;

    struct MockRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl MockRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self { responses: Mutex::new(responses), commands: Mutex::new(Vec::new()) }
        }
    }

    impl GitRunner for MockRunner {
        fn run_git(&self, _dir: &str, args: &[&str]) -> GitResult<GitOutput> {
            self.commands.lock().unwrap().push(args.iter().map(|s| s.to_string()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput { success: true, stdout: String::new(), stderr: String::new() })
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    #[test]
    fn derive_branch_name_strips_ticket_token_and_lowercases() {
        let name = derive_branch_name("[ENG-123] Fix the Login Bug!!");
        assert_eq!(name, "feature/fix-the-login-bug");
    }

    #[test]
    fn derive_branch_name_truncates_to_fifty_chars() {
        let long_title = "a".repeat(200);
        let name = derive_branch_name(&long_title);
        assert!(name.len() <= MAX_BRANCH_NAME_LEN + "feature/".len());
    }

    #[test]
    fn worktree_dir_name_replaces_slashes_with_double_dash() {
        assert_eq!(worktree_dir_name("feature/fix-bug"), "feature--fix-bug");
    }

    #[test]
    fn eject_refuses_when_main_repo_dirty() {
        let runner = MockRunner::new(vec![GitOutput {
            success: true,
            stdout: " M src/lib.rs\n".into(),
            stderr: String::new(),
        }]);
        let manager = WorktreeManager::new("/tmp/proj", &runner);
        let mut task = Task::new(uuid::Uuid::new_v4(), "Fix bug", "desc");
        task.branch_name = Some("feature/fix-bug".into());
        let err = manager.eject(&mut task, false).unwrap_err();
        assert!(matches!(err, WorktreeManagerError::DirtyMainRepo));
    }

    #[test]
    fn eject_refuses_when_another_task_ejected() {
        let runner = MockRunner::new(vec![]);
        let manager = WorktreeManager::new("/tmp/proj", &runner);
        let mut task = Task::new(uuid::Uuid::new_v4(), "Fix bug", "desc");
        task.branch_name = Some("feature/fix-bug".into());
        let err = manager.eject(&mut task, true).unwrap_err();
        assert!(matches!(err, WorktreeManagerError::AlreadyEjected));
    }

    #[test]
    fn merge_to_current_reports_nothing_to_merge_on_empty_diff() {
        let runner = MockRunner::new(vec![
            GitOutput { success: true, stdout: String::new(), stderr: String::new() },
            GitOutput { success: true, stdout: "main\n".into(), stderr: String::new() },
            GitOutput { success: true, stdout: "".into(), stderr: String::new() },
        ]);
        let manager = WorktreeManager::new("/tmp/proj", &runner);
        let result = manager.merge_to_current("feature/x").unwrap();
        assert_eq!(result, MergeResult::NothingToMerge);
    }
}
