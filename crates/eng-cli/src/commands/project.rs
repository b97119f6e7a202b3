use anyhow::Context;
use eng_core::types::Project;
use eng_core::Config;
use eng_store::Store;

pub async fn add(cfg: &Config, name: &str, path: &str) -> anyhow::Result<()> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let project = Project::new(name, path);
    store.app().create_project(&project).await.context("failed to create project")?;
    println!("{}\t{}\t{}", project.id, project.name, project.path);
    Ok(())
}

pub async fn list(cfg: &Config, include_archived: bool) -> anyhow::Result<()> {
    let store = Store::open(cfg).await.context("failed to open store")?;
    let projects = store
        .app()
        .list_projects(include_archived)
        .await
        .context("failed to list projects")?;
    for p in projects {
        println!("{}\t{}\t{}\t{}", p.id, p.name, p.path, if p.archived { "archived" } else { "active" });
    }
    Ok(())
}
