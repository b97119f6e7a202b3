use tracing::debug;

use crate::error::{GitError, GitResult};

/// Output of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn into_stdout(self) -> GitResult<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(GitError::Command(self.stderr))
        }
    }
}

/// Thin, typed wrapper over the `git` CLI contract in §6: every command
/// returns textual output or fails with captured stderr.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, working_directory: &str, args: &[&str]) -> GitResult<GitOutput>;
}

/// Shells out to the real `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, working_directory: &str, args: &[&str]) -> GitResult<GitOutput> {
        debug!(working_directory, ?args, "running git command");
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(working_directory)
            .output()?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Free function matching the external-interface contract's
/// `run_git_command(args, working_directory)` — returns stdout or an error
/// carrying stderr.
pub fn run_git_command(
    runner: &dyn GitRunner,
    args: &[&str],
    working_directory: &str,
) -> GitResult<String> {
    runner.run_git(working_directory, args)?.into_stdout()
}

/// High-level operations grounded on the required-operations list in §6.
/// Each is a thin typed wrapper over `run_git_command` so call sites read
/// like the operation they perform instead of an args slice.
pub struct GitOps<'a> {
    runner: &'a dyn GitRunner,
}

impl<'a> GitOps<'a> {
    pub fn new(runner: &'a dyn GitRunner) -> Self {
        Self { runner }
    }

    pub fn status_porcelain(&self, dir: &str) -> GitResult<String> {
        run_git_command(self.runner, &["status", "--porcelain"], dir)
    }

    pub fn is_clean(&self, dir: &str) -> GitResult<bool> {
        Ok(self.status_porcelain(dir)?.trim().is_empty())
    }

    pub fn diff(&self, dir: &str) -> GitResult<String> {
        run_git_command(self.runner, &["diff"], dir)
    }

    pub fn diff_stat(&self, dir: &str) -> GitResult<String> {
        run_git_command(self.runner, &["diff", "--stat"], dir)
    }

    pub fn diff_range_stat(&self, dir: &str, base: &str, head: &str) -> GitResult<String> {
        let range = format!("{base}...{head}");
        run_git_command(self.runner, &["diff", &range, "--stat"], dir)
    }

    pub fn diff_range_name_only(&self, dir: &str, base: &str, head: &str) -> GitResult<Vec<String>> {
        let range = format!("{base}...{head}");
        let out = run_git_command(self.runner, &["diff", &range, "--name-only"], dir)?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    pub fn add_all(&self, dir: &str) -> GitResult<()> {
        run_git_command(self.runner, &["add", "-A"], dir).map(|_| ())
    }

    pub fn add_paths(&self, dir: &str, paths: &[String]) -> GitResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["add"];
        args.extend(paths.iter().map(|s| s.as_str()));
        run_git_command(self.runner, &args, dir).map(|_| ())
    }

    pub fn commit(&self, dir: &str, message: &str) -> GitResult<String> {
        let out = self.runner.run_git(dir, &["commit", "-m", message])?;
        if !out.success {
            return Err(GitError::Command(out.stderr));
        }
        self.rev_parse_head(dir)
    }

    pub fn checkout(&self, dir: &str, branch: &str) -> GitResult<()> {
        run_git_command(self.runner, &["checkout", branch], dir).map(|_| ())
    }

    pub fn checkout_new_branch(&self, dir: &str, branch: &str) -> GitResult<()> {
        run_git_command(self.runner, &["checkout", "-b", branch], dir).map(|_| ())
    }

    pub fn current_branch(&self, dir: &str) -> GitResult<String> {
        Ok(run_git_command(self.runner, &["branch", "--show-current"], dir)?.trim().to_string())
    }

    pub fn branch_exists(&self, dir: &str, branch: &str) -> GitResult<bool> {
        let out = run_git_command(self.runner, &["branch", "--list", branch], dir)?;
        Ok(!out.trim().is_empty())
    }

    pub fn delete_branch(&self, dir: &str, branch: &str) -> GitResult<()> {
        run_git_command(self.runner, &["branch", "-d", branch], dir).map(|_| ())
    }

    pub fn merge(&self, dir: &str, branch: &str) -> GitResult<GitOutput> {
        self.runner.run_git(dir, &["merge", branch])
    }

    pub fn merge_abort(&self, dir: &str) -> GitResult<()> {
        run_git_command(self.runner, &["merge", "--abort"], dir).map(|_| ())
    }

    pub fn fetch(&self, dir: &str) -> GitResult<()> {
        run_git_command(self.runner, &["fetch", "origin"], dir).map(|_| ())
    }

    pub fn push(&self, dir: &str, refspec: &str) -> GitResult<()> {
        run_git_command(self.runner, &["push", "origin", refspec], dir).map(|_| ())
    }

    pub fn rev_parse_head(&self, dir: &str) -> GitResult<String> {
        Ok(run_git_command(self.runner, &["rev-parse", "HEAD"], dir)?.trim().to_string())
    }

    pub fn remote_head_branch(&self, dir: &str) -> GitResult<String> {
        let out = run_git_command(self.runner, &["symbolic-ref", "refs/remotes/origin/HEAD"], dir)?;
        Ok(out.trim().trim_start_matches("refs/remotes/origin/").to_string())
    }

    pub fn worktree_add(&self, dir: &str, path: &str, branch: &str, create: bool) -> GitResult<()> {
        let mut args = vec!["worktree", "add"];
        if create {
            args.push("-b");
            args.push(branch);
            args.push(path);
        } else {
            args.push(path);
            args.push(branch);
        }
        run_git_command(self.runner, &args, dir).map(|_| ())
    }

    pub fn worktree_add_detached(&self, dir: &str, path: &str, commitish: &str) -> GitResult<()> {
        run_git_command(self.runner, &["worktree", "add", "--detach", path, commitish], dir).map(|_| ())
    }

    pub fn worktree_remove(&self, dir: &str, path: &str) -> GitResult<()> {
        run_git_command(self.runner, &["worktree", "remove", "--force", path], dir).map(|_| ())
    }

    pub fn log_oneline(&self, dir: &str, range: &str, limit: usize) -> GitResult<Vec<String>> {
        let limit_arg = format!("-{limit}");
        let out = run_git_command(self.runner, &["log", &limit_arg, "--oneline", range], dir)?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn is_ancestor(&self, dir: &str, branch: &str, target: &str) -> GitResult<bool> {
        let out = self.runner.run_git(dir, &["merge-base", "--is-ancestor", branch, target])?;
        Ok(out.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn is_clean_true_on_empty_status() {
        let runner = MockRunner::new(vec![GitOutput { success: true, stdout: String::new(), stderr: String::new() }]);
        let ops = GitOps::new(&runner);
        assert!(ops.is_clean(".").unwrap());
    }

    #[test]
    fn is_clean_false_on_dirty_status() {
        let runner = MockRunner::new(vec![GitOutput {
            success: true,
            stdout: " M src/lib.rs\n".into(),
            stderr: String::new(),
        }]);
        let ops = GitOps::new(&runner);
        assert!(!ops.is_clean(".").unwrap());
    }

    #[test]
    fn commit_failure_surfaces_stderr() {
        let runner = MockRunner::new(vec![GitOutput {
            success: false,
            stdout: String::new(),
            stderr: "nothing to commit".into(),
        }]);
        let ops = GitOps::new(&runner);
        let err = ops.commit(".", "msg").unwrap_err();
        assert!(matches!(err, GitError::Command(m) if m.contains("nothing to commit")));
    }

    #[test]
    fn worktree_add_with_new_branch_passes_dash_b() {
        let runner = MockRunner::new(vec![]);
        let ops = GitOps::new(&runner);
        ops.worktree_add(".", "/tmp/wt", "feature/x", true).unwrap();
        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands[0], vec!["worktree", "add", "-b", "feature/x", "/tmp/wt"]);
    }

    #[test]
    fn worktree_add_detached_passes_detach() {
        let runner = MockRunner::new(vec![]);
        let ops = GitOps::new(&runner);
        ops.worktree_add_detached(".", "/tmp/wt", "origin/main").unwrap();
        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands[0], vec!["worktree", "add", "--detach", "/tmp/wt", "origin/main"]);
    }
}
