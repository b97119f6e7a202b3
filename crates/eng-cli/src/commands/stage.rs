use anyhow::Context;
use eng_core::Config;
use eng_pipeline::CommitAction;
use uuid::Uuid;

use super::project_handle;

pub async fn run(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid, input: Option<String>) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let execution_id = handle
        .engine
        .run_stage(task, stage_template, input)
        .await
        .context("failed to run stage")?;
    println!("{execution_id}");
    Ok(())
}

pub async fn redo(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid, feedback: Option<String>) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let execution_id = handle
        .engine
        .redo_stage(task, stage_template, feedback)
        .await
        .context("failed to redo stage")?;
    println!("{execution_id}");
    Ok(())
}

pub async fn approve(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid, decision: Option<String>) -> anyhow::Result<()> {
    let decision = decision
        .map(|d| serde_json::from_str(&d))
        .transpose()
        .context("decision must be valid JSON")?;
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .approve_stage(task, stage_template, decision)
        .await
        .context("failed to approve stage")?;
    Ok(())
}

pub async fn approve_with_stages(
    cfg: &Config,
    project: Uuid,
    task: Uuid,
    stage_template: Uuid,
    selected: Vec<Uuid>,
) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .approve_with_stages(task, stage_template, selected)
        .await
        .context("failed to approve stage-selection stage")?;
    Ok(())
}

pub async fn kill(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle.engine.kill_current(task, stage_template).await.context("failed to kill stage")?;
    Ok(())
}

pub async fn commit_show(cfg: &Config, project: Uuid, stage_execution: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let pending = handle
        .engine
        .pending_commit(stage_execution)
        .await
        .context("no pending commit for this stage execution")?;
    println!("suggested message: {}", pending.suggested_message);
    println!("{}", pending.diff_stat);
    Ok(())
}

pub async fn commit_apply(cfg: &Config, project: Uuid, stage_execution: Uuid, message: Option<String>) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .resolve_commit(stage_execution, CommitAction::Commit { message })
        .await
        .context("failed to commit")?;
    Ok(())
}

pub async fn commit_skip(cfg: &Config, project: Uuid, stage_execution: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .resolve_commit(stage_execution, CommitAction::Skip)
        .await
        .context("failed to skip commit")?;
    Ok(())
}
