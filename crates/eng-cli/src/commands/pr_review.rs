use anyhow::Context;
use eng_core::Config;
use eng_pipeline::FixAction;
use uuid::Uuid;

use super::project_handle;

pub async fn poll(cfg: &Config, project: Uuid, stage_execution: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let new_count = handle.engine.poll_pr_review(stage_execution).await.context("failed to poll PR review")?;
    println!("{new_count} new comment(s)");
    Ok(())
}

pub async fn fix(cfg: &Config, project: Uuid, fix_id: Uuid, context: Option<String>) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let fix = handle
        .store
        .get_pr_review_fix(fix_id)
        .await
        .context("failed to look up fix")?
        .context("no such fix")?;
    let execution = handle
        .store
        .get_execution(fix.execution_id)
        .await
        .context("failed to look up execution")?
        .context("execution for fix not found")?;
    handle
        .engine
        .apply_pr_review_fix(&fix, execution.task_id, FixAction::Fix { user_context: context.as_deref() })
        .await
        .context("failed to apply fix")?;
    Ok(())
}

pub async fn skip(cfg: &Config, project: Uuid, fix_id: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let fix = handle
        .store
        .get_pr_review_fix(fix_id)
        .await
        .context("failed to look up fix")?
        .context("no such fix")?;
    let execution = handle
        .store
        .get_execution(fix.execution_id)
        .await
        .context("failed to look up execution")?
        .context("execution for fix not found")?;
    handle
        .engine
        .apply_pr_review_fix(&fix, execution.task_id, FixAction::Skip)
        .await
        .context("failed to skip fix")?;
    Ok(())
}

pub async fn finalize(cfg: &Config, project: Uuid, stage_execution: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .finalize_pr_review(stage_execution)
        .await
        .context("failed to finalize PR review")?;
    Ok(())
}
