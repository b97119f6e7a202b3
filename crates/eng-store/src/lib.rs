pub mod app_db;
pub mod error;
pub mod migrate;
pub mod project_db;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eng_core::Config;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use app_db::AppDb;
pub use error::{Result, StoreError};
pub use project_db::ProjectDb;

/// Owns the process-wide `AppDb` plus a lazily-populated set of per-project
/// `ProjectDb`s, matching the "one metadata database plus one per-project
/// database, opened lazily per project" persistence layout.
#[derive(Clone)]
pub struct Store {
    app: AppDb,
    project_db_dir: Option<PathBuf>,
    busy_timeout_ms: u64,
    projects: Arc<RwLock<HashMap<Uuid, ProjectDb>>>,
}

impl Store {
    pub async fn open(config: &Config) -> Result<Self> {
        let app_path = expand_home(&config.store.app_db_path);
        if let Some(parent) = app_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let app = AppDb::open(
            app_path.to_string_lossy().to_string(),
            config.store.busy_timeout_ms,
        )
        .await?;
        let project_db_dir = expand_home(&config.store.project_db_dir);
        std::fs::create_dir_all(&project_db_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            app,
            project_db_dir: Some(project_db_dir),
            busy_timeout_ms: config.store.busy_timeout_ms,
            projects: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// An all-in-memory store for tests: the app database and every
    /// per-project database it opens live only for the process lifetime.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self {
            app: AppDb::open_in_memory().await?,
            project_db_dir: None,
            busy_timeout_ms: 5_000,
            projects: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn app(&self) -> &AppDb {
        &self.app
    }

    /// Look up (or open and cache) the per-project database for
    /// `project_id`. Concurrent callers racing to open the same project's
    /// database converge on the first winner; losers drop their own open
    /// connection and reuse the cached one.
    pub async fn project(&self, project_id: Uuid) -> Result<ProjectDb> {
        if let Some(db) = self.projects.read().await.get(&project_id) {
            return Ok(db.clone());
        }
        let db = self.open_project_db(project_id).await?;
        let mut guard = self.projects.write().await;
        Ok(guard.entry(project_id).or_insert(db).clone())
    }

    async fn open_project_db(&self, project_id: Uuid) -> Result<ProjectDb> {
        match &self.project_db_dir {
            Some(dir) => {
                let path = dir.join(format!("{project_id}.db"));
                ProjectDb::open(path.to_string_lossy().to_string(), self.busy_timeout_ms).await
            }
            None => ProjectDb::open_in_memory().await,
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(raw).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eng_core::types::Project;

    #[tokio::test]
    async fn project_db_is_cached_across_calls() {
        let store = Store::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        let first = store.project(project_id).await.unwrap();
        let second = store.project(project_id).await.unwrap();

        first.upsert_stage_template(&eng_core::types::StageTemplate::new(
            project_id,
            "Research",
            0,
            "{{task_description}}",
            eng_core::types::OutputFormat::Research,
        ))
        .await
        .unwrap();

        let templates = second.list_stage_templates(project_id).await.unwrap();
        assert_eq!(templates.len(), 1);
    }

    #[tokio::test]
    async fn app_db_accessible_through_store() {
        let store = Store::open_in_memory().await.unwrap();
        let p = Project::new("demo", "/tmp/demo");
        store.app().create_project(&p).await.unwrap();
        assert_eq!(store.app().list_projects(false).await.unwrap().len(), 1);
    }
}
