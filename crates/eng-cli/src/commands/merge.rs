use anyhow::Context;
use eng_core::Config;
use eng_pipeline::MergeOutcome;
use uuid::Uuid;

use super::project_handle;

pub async fn run(cfg: &Config, project: Uuid, task: Uuid, stage_template: Uuid) -> anyhow::Result<()> {
    let handle = project_handle(cfg, project).await?;
    let outcome = handle
        .engine
        .run_merge_stage(task, stage_template)
        .await
        .context("failed to run merge stage")?;
    match outcome {
        MergeOutcome::Merged { target_branch } => println!("merged into {target_branch}"),
        MergeOutcome::NothingToMerge { target_branch } => println!("nothing to merge into {target_branch}"),
    }
    Ok(())
}
