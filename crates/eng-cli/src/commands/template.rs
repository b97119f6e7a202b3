use anyhow::Context;
use eng_core::types::{OutputFormat, StageTemplate};
use eng_core::Config;
use eng_store::Store;
use uuid::Uuid;

pub async fn add(
    cfg: &Config,
    project_id: Uuid,
    name: &str,
    sort_order: i64,
    prompt_template: &str,
    output_format: &str,
) -> anyhow::Result<()> {
    let output_format = parse_output_format(output_format)?;
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project_db = store.project(project_id).await.context("failed to open project database")?;
    let template = StageTemplate::new(project_id, name, sort_order, prompt_template, output_format);
    project_db.upsert_stage_template(&template).await.context("failed to save stage template")?;
    println!("{}", template.id);
    Ok(())
}

pub async fn list(cfg: &Config, project_id: Uuid) -> anyhow::Result<()> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project_db = store.project(project_id).await.context("failed to open project database")?;
    let mut templates = project_db
        .list_stage_templates(project_id)
        .await
        .context("failed to list stage templates")?;
    templates.sort_by_key(|t| t.sort_order);
    for t in templates {
        println!("{}\t{}\t{}\t{:?}", t.id, t.sort_order, t.name, t.output_format);
    }
    Ok(())
}

fn parse_output_format(s: &str) -> anyhow::Result<OutputFormat> {
    Ok(match s {
        "text" => OutputFormat::Text,
        "research" => OutputFormat::Research,
        "plan" => OutputFormat::Plan,
        "options" => OutputFormat::Options,
        "findings" => OutputFormat::Findings,
        "pr_review" => OutputFormat::PrReview,
        "pr_preparation" => OutputFormat::PrPreparation,
        "merge" => OutputFormat::Merge,
        "interactive_terminal" => OutputFormat::InteractiveTerminal,
        other => anyhow::bail!("unknown output format: {other}"),
    })
}
