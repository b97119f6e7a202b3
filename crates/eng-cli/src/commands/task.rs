use anyhow::Context;
use eng_core::types::Task;
use eng_core::Config;
use eng_git::RealGitRunner;
use eng_store::Store;
use eng_worktree::WorktreeManager;
use uuid::Uuid;

use super::project_handle;

pub async fn add(cfg: &Config, project_id: Uuid, title: &str, description: &str) -> anyhow::Result<()> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project_db = store.project(project_id).await.context("failed to open project database")?;
    let task = Task::new(project_id, title, description);
    project_db.create_task(&task).await.context("failed to create task")?;
    println!("{}", task.id);
    Ok(())
}

pub async fn list(cfg: &Config, project_id: Uuid) -> anyhow::Result<()> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project_db = store.project(project_id).await.context("failed to open project database")?;
    let tasks = project_db.list_tasks(project_id).await.context("failed to list tasks")?;
    for t in tasks {
        println!("{}\t{:?}\t{}", t.id, t.status, t.title);
    }
    Ok(())
}

/// Check the task's branch out in the project root, pausing its pipeline
/// (§4.6). Refuses if the main repo is dirty or another task is ejected.
pub async fn eject(cfg: &Config, project_id: Uuid, task_id: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project_id).await?;
    let mut task = handle
        .store
        .get_task(task_id)
        .await
        .context("failed to look up task")?
        .ok_or_else(|| anyhow::anyhow!("no such task: {task_id}"))?;

    let any_ejected = handle
        .store
        .ejected_task(project_id)
        .await
        .context("failed to look up ejected task")?
        .map(|t| t.id != task_id)
        .unwrap_or(false);

    let runner = RealGitRunner;
    let manager = WorktreeManager::new(handle.project_path.clone(), &runner);
    manager.eject(&mut task, any_ejected).context("eject refused")?;
    handle.store.update_task(&task).await.context("failed to persist ejected task")?;
    println!("ejected {} onto {}", task.id, task.branch_name.unwrap_or_default());
    Ok(())
}

/// Re-create the task's worktree and clear `ejected` (§4.6).
pub async fn inject(cfg: &Config, project_id: Uuid, task_id: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project_id).await?;
    let mut task = handle
        .store
        .get_task(task_id)
        .await
        .context("failed to look up task")?
        .ok_or_else(|| anyhow::anyhow!("no such task: {task_id}"))?;

    let runner = RealGitRunner;
    let manager = WorktreeManager::new(handle.project_path.clone(), &runner);
    manager.inject(&mut task).context("inject failed")?;
    handle.store.update_task(&task).await.context("failed to persist injected task")?;
    println!("injected {} at {}", task.id, task.worktree_path.unwrap_or_default());
    Ok(())
}
