use std::path::PathBuf;

use eng_core::types::Task;
use eng_git::{GitOps, GitRunner};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Outcome of a successful merge attempt. A conflict is not represented
/// here — it surfaces as an `Err` carrying "CONFLICT" so the caller can
/// offer the "Ask agent to fix" escape hatch described in §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { target_branch: String },
    NothingToMerge { target_branch: String },
}

/// The merge sub-stage (§4.8). Merges a task's branch into the target
/// branch through a temporary *detached* worktree so neither the task's own
/// worktree nor the main repo's checked-out branch is touched.
pub struct MergeStage<'a> {
    git_runner: &'a dyn GitRunner,
    project_path: PathBuf,
}

impl<'a> MergeStage<'a> {
    pub fn new(git_runner: &'a dyn GitRunner, project_path: impl Into<PathBuf>) -> Self {
        Self {
            git_runner,
            project_path: project_path.into(),
        }
    }

    fn project_path_str(&self) -> String {
        self.project_path.to_string_lossy().to_string()
    }

    fn temp_worktree_path(&self, task: &Task) -> PathBuf {
        self.project_path
            .join(".stagehand-worktrees")
            .join(format!("merge--{}", task.id))
    }

    /// Run the merge. Refuses when the main repo has uncommitted changes or
    /// another task in the project is ejected. On conflict, the merge is
    /// aborted and the temporary worktree removed before returning; `task`
    /// is never mutated on a conflict path, so the caller leaves it
    /// `in_progress`.
    pub fn run(&self, task: &Task, any_task_ejected: bool) -> Result<MergeOutcome> {
        if any_task_ejected {
            return Err(PipelineError::AlreadyEjected);
        }

        let ops = GitOps::new(self.git_runner);
        let dir = self.project_path_str();
        if !ops.is_clean(&dir)? {
            return Err(PipelineError::DirtyMainRepo);
        }

        let branch_name = task
            .branch_name
            .clone()
            .ok_or_else(|| PipelineError::Internal("task has no branch to merge".to_string()))?;

        ops.fetch(&dir)?;
        let target_branch = ops.remote_head_branch(&dir)?;
        let target_ref = format!("origin/{target_branch}");

        let temp_path = self.temp_worktree_path(task);
        if let Some(parent) = temp_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Internal(e.to_string()))?;
        }
        if temp_path.exists() {
            let _ = ops.worktree_remove(&dir, &temp_path.to_string_lossy());
            let _ = std::fs::remove_dir_all(&temp_path);
        }
        ops.worktree_add_detached(&dir, &temp_path.to_string_lossy(), &target_ref)?;
        let temp_dir = temp_path.to_string_lossy().to_string();

        let outcome = self.merge_in_temp_worktree(&ops, &temp_dir, &target_ref, &branch_name, &target_branch);

        if let Err(e) = ops.worktree_remove(&dir, &temp_dir) {
            warn!(task_id = %task.id, error = %e, "failed to remove temporary merge worktree");
        }
        let _ = std::fs::remove_dir_all(&temp_path);

        outcome
    }

    fn merge_in_temp_worktree(
        &self,
        ops: &GitOps<'_>,
        temp_dir: &str,
        target_ref: &str,
        branch_name: &str,
        target_branch: &str,
    ) -> Result<MergeOutcome> {
        let stat = ops.diff_range_stat(temp_dir, target_ref, branch_name).unwrap_or_default();
        if stat.trim().is_empty() {
            return Ok(MergeOutcome::NothingToMerge {
                target_branch: target_branch.to_string(),
            });
        }

        match ops.merge(temp_dir, branch_name) {
            Ok(out) if out.success => {
                ops.push(temp_dir, &format!("HEAD:{target_branch}"))?;
                info!(%target_branch, branch = branch_name, "merged task branch via detached worktree");
                Ok(MergeOutcome::Merged {
                    target_branch: target_branch.to_string(),
                })
            }
            Ok(out) => {
                warn!(branch = branch_name, %target_branch, "merge conflict in temporary worktree");
                let _ = ops.merge_abort(temp_dir);
                Err(PipelineError::Internal(format!("CONFLICT: {}", out.stderr)))
            }
            Err(e) => {
                let _ = ops.merge_abort(temp_dir);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eng_git::{GitOutput, GitResult};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct ScriptedRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl GitRunner for ScriptedRunner {
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

    fn ok(stdout: &str) -> GitOutput {
        GitOutput { success: true, stdout: stdout.to_string(), stderr: String::new() }
    }

    fn task_with_branch() -> Task {
        let mut task = Task::new(Uuid::new_v4(), "Add button", "desc");
        task.branch_name = Some("feature/add-button".to_string());
        task
    }

    #[test]
    fn refuses_when_another_task_ejected() {
        let runner = ScriptedRunner::new(vec![]);
        let stage = MergeStage::new(&runner, "/tmp/proj");
        let err = stage.run(&task_with_branch(), true).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyEjected));
    }

    #[test]
    fn refuses_when_main_repo_dirty() {
        let runner = ScriptedRunner::new(vec![ok(" M src/lib.rs\n")]);
        let stage = MergeStage::new(&runner, "/tmp/proj");
        let err = stage.run(&task_with_branch(), false).unwrap_err();
        assert!(matches!(err, PipelineError::DirtyMainRepo));
    }

    #[test]
    fn reports_nothing_to_merge_on_empty_diff() {
        let runner = ScriptedRunner::new(vec![
            ok(""),       // status --porcelain
            ok(""),       // fetch
            ok("main\n"), // symbolic-ref
            ok(""),       // worktree add --detach
            ok(""),       // diff --stat (empty)
        ]);
        let stage = MergeStage::new(&runner, "/tmp/proj");
        let outcome = stage.run(&task_with_branch(), false).unwrap();
        assert_eq!(outcome, MergeOutcome::NothingToMerge { target_branch: "main".to_string() });
    }

    #[test]
    fn conflict_aborts_merge_and_removes_worktree() {
        let runner = ScriptedRunner::new(vec![
            ok(""),                                   // status --porcelain
            ok(""),                                   // fetch
            ok("main\n"),                              // symbolic-ref
            ok(""),                                   // worktree add --detach
            ok(" 1 file changed, 1 insertion(+)\n"),  // diff --stat
            GitOutput { success: false, stdout: String::new(), stderr: "CONFLICT (content)".into() }, // merge
        ]);
        let stage = MergeStage::new(&runner, "/tmp/proj");
        let err = stage.run(&task_with_branch(), false).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(m) if m.contains("CONFLICT")));
        let commands = runner.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c.first().map(String::as_str) == Some("merge") && c.get(1).map(String::as_str) == Some("--abort")));
        assert!(commands.iter().any(|c| c[0] == "worktree" && c[1] == "remove"));
    }

    #[test]
    fn success_pushes_merged_head_to_target() {
        let runner = ScriptedRunner::new(vec![
            ok(""),
            ok(""),
            ok("main\n"),
            ok(""),
            ok(" 1 file changed, 1 insertion(+)\n"),
            ok(""), // merge success
            ok(""), // push
        ]);
        let stage = MergeStage::new(&runner, "/tmp/proj");
        let outcome = stage.run(&task_with_branch(), false).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { target_branch: "main".to_string() });
        let commands = runner.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c[0] == "push" && c.contains(&"HEAD:main".to_string())));
    }
}
