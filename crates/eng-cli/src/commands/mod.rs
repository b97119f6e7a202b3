pub mod doctor;
pub mod merge;
pub mod pr_review;
pub mod project;
pub mod stage;
pub mod task;
pub mod template;
pub mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use eng_core::Config;
use eng_core::types::ExecutionStatus;
use eng_git::{GitRunner, HostingClient, RealGitRunner};
use eng_pipeline::Engine;
use eng_process::{ActivityTracker, HealthMonitor, Supervisor};
use eng_store::{ProjectDb, Store};
use tracing::warn;
use uuid::Uuid;

/// Everything one CLI invocation needs to talk to a single project: its
/// `Engine`, the project's own database (for ad-hoc reads the engine
/// doesn't expose), and the on-disk path of its repository.
pub struct ProjectHandle {
    pub engine: Engine,
    pub store: ProjectDb,
    pub project_path: PathBuf,
}

/// Wire a `Store`, `Supervisor`, `GitRunner`, and optional `HostingClient`
/// into an `Engine` scoped to `project_id`, the way `at-cli`'s subcommands
/// each build their own API client from a shared `Config`.
pub async fn project_handle(cfg: &Config, project_id: Uuid) -> anyhow::Result<ProjectHandle> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project = store
        .app()
        .get_project(project_id)
        .await
        .context("failed to look up project")?
        .ok_or_else(|| anyhow::anyhow!("no such project: {project_id}"))?;
    let project_db = store.project(project_id).await.context("failed to open project database")?;

    let supervisor = Arc::new(Supervisor::new());
    orphan_sweep(&project_db, &supervisor, cfg.health.inactivity_timeout_ms).await?;

    let project_db_path = expand_home(&cfg.store.project_db_dir).join(format!("{project_id}.db"));
    let git_runner: Arc<dyn GitRunner> = Arc::new(RealGitRunner);

    let mut engine = Engine::new(
        project_db.clone(),
        supervisor,
        git_runner,
        project.path.clone(),
        project_db_path.to_string_lossy().to_string(),
        cfg.process.agent_binary.clone(),
    )
    .with_health_config(cfg.health.poll_interval_ms, cfg.health.inactivity_timeout_ms);

    if let Some(hosting) = hosting_client(cfg)? {
        engine = engine.with_hosting(Arc::new(hosting));
    }

    Ok(ProjectHandle {
        engine,
        store: project_db,
        project_path: PathBuf::from(project.path),
    })
}

/// Startup crash recovery (§4.3): a freshly-launched CLI invocation has no
/// live processes of its own, so `HealthMonitor::orphan_sweep` against this
/// invocation's (empty) process table reports every execution this
/// project's store still has marked `running` as orphaned from a prior
/// invocation that never reached a terminal status (crashed, was killed, or
/// the process was SIGKILLed). Mark each one `failed` before this
/// invocation's command runs, so the at-most-one-running-execution-per-stage
/// lock never wedges a (task, template) pair shut forever.
async fn orphan_sweep(project_db: &ProjectDb, supervisor: &Supervisor, inactivity_timeout_ms: u64) -> anyhow::Result<()> {
    let running = project_db.list_running_executions().await?;
    let running_ids: Vec<Uuid> = running.iter().map(|e| e.id).collect();

    let monitor = HealthMonitor::new(supervisor.clone(), ActivityTracker::default(), inactivity_timeout_ms);
    let orphaned: std::collections::HashSet<Uuid> = monitor.orphan_sweep(&running_ids).await.into_iter().collect();

    for mut execution in running {
        if !orphaned.contains(&execution.id) {
            continue;
        }
        warn!(
            execution_id = %execution.id,
            task_id = %execution.task_id,
            "marking execution failed: orphaned from a prior process"
        );
        execution.status = ExecutionStatus::Failed;
        execution.error_message = Some("Process crashed unexpectedly".to_string());
        execution.completed_at = Some(chrono::Utc::now());
        project_db.update_execution(&execution).await?;
    }
    Ok(())
}

/// Build a `HostingClient` from the env vars named in `[hosting]`, or `None`
/// when any of them is unset (hosting-dependent stages then fail with a
/// clear "hosting client not configured" error instead of a missing token).
fn hosting_client(cfg: &Config) -> anyhow::Result<Option<HostingClient>> {
    let (Some(token_env), Some(owner_env), Some(repo_env)) = (
        cfg.hosting.token_env.as_deref(),
        cfg.hosting.owner_env.as_deref(),
        cfg.hosting.repo_env.as_deref(),
    ) else {
        return Ok(None);
    };
    let token = match std::env::var(token_env) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let owner = std::env::var(owner_env).unwrap_or_default();
    let repo = std::env::var(repo_env).unwrap_or_default();
    if owner.is_empty() || repo.is_empty() {
        return Ok(None);
    }
    let client = HostingClient::new(token, owner, repo, cfg.hosting.max_retries)
        .context("failed to build hosting client")?;
    Ok(Some(client))
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}
