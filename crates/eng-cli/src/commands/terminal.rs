use anyhow::Context;
use eng_core::Config;
use uuid::Uuid;

use super::project_handle;

pub async fn start(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let (stage_execution_id, _rx) = handle
        .engine
        .start_terminal(task, stage_template)
        .await
        .context("failed to start terminal")?;
    println!("{stage_execution_id}");
    Ok(())
}

pub async fn write(cfg: &Config, project: Uuid, stage_execution: Uuid, data: &str) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle
        .engine
        .write_terminal(stage_execution, data.as_bytes())
        .await
        .context("failed to write to terminal")?;
    Ok(())
}

pub async fn finish(cfg: &Config, project: Uuid, stage_execution: Uuid, captured_output: &str) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let summary = handle
        .engine
        .finish_terminal(stage_execution, captured_output)
        .await
        .context("failed to finish terminal")?;
    println!("{summary}");
    Ok(())
}

pub async fn stop(cfg: &Config, project: Uuid, stage_execution: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    handle.engine.stop_terminal(stage_execution).await.context("failed to stop terminal")?;
    Ok(())
}
