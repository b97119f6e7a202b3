use chrono::{DateTime, Utc};
use eng_core::types::Project;
use rusqlite::{params, Row};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::migrate::{apply_pragmas, run_idempotent};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        archived INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Process-wide metadata database: `app.db` — one row per registered
/// project plus process-level settings.
#[derive(Clone)]
pub struct AppDb {
    conn: Connection,
}

impl AppDb {
    pub async fn open(path: impl Into<String>, busy_timeout_ms: u64) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path).await?;
        conn.call(move |c| {
            apply_pragmas(c, busy_timeout_ms)?;
            run_idempotent(c, MIGRATIONS)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|c| {
            apply_pragmas(c, 5_000)?;
            run_idempotent(c, MIGRATIONS)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        let p = project.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO projects (id, name, path, archived, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        path = excluded.path,
                        archived = excluded.archived,
                        updated_at = excluded.updated_at",
                    params![
                        p.id.to_string(),
                        p.name,
                        p.path,
                        p.archived as i64,
                        p.created_at.to_rfc3339(),
                        p.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, name, path, archived, created_at, updated_at
                     FROM projects WHERE id = ?1",
                )?;
                let mut rows = stmt.query(params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn list_projects(&self, include_archived: bool) -> Result<Vec<Project>> {
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, name, path, archived, created_at, updated_at
                     FROM projects ORDER BY created_at ASC",
                )?;
                let iter = stmt.query_map([], row_to_project)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        if include_archived {
            Ok(rows)
        } else {
            Ok(rows.into_iter().filter(|p| !p.archived).collect())
        }
    }

    pub async fn delete_project(&self, id: Uuid) -> Result<()> {
        let id_str = id.to_string();
        let n = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM projects WHERE id = ?1", params![id_str])?))
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("project {id}")));
        }
        Ok(())
    }

    pub async fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: impl Into<String>) -> Result<Option<String>> {
        let key = key.into();
        let value = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare("SELECT value FROM settings WHERE key = ?1")?;
                let mut rows = stmt.query(params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(value)
    }
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Project {
        id: Uuid::parse_str(&id).map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        name: row.get(1)?,
        path: row.get(2)?,
        archived: row.get::<_, i64>(3)? != 0,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

pub(crate) fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_project() {
        let db = AppDb::open_in_memory().await.unwrap();
        let p = Project::new("demo", "/tmp/demo");
        db.create_project(&p).await.unwrap();
        let fetched = db.get_project(p.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn list_excludes_archived_by_default() {
        let db = AppDb::open_in_memory().await.unwrap();
        let mut p = Project::new("archived-one", "/tmp/a");
        p.archived = true;
        db.create_project(&p).await.unwrap();
        let active = Project::new("active-one", "/tmp/b");
        db.create_project(&active).await.unwrap();

        assert_eq!(db.list_projects(false).await.unwrap().len(), 1);
        assert_eq!(db.list_projects(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let db = AppDb::open_in_memory().await.unwrap();
        db.set_setting("theme", "dark").await.unwrap();
        assert_eq!(db.get_setting("theme").await.unwrap(), Some("dark".into()));
        assert_eq!(db.get_setting("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_missing_project_errors() {
        let db = AppDb::open_in_memory().await.unwrap();
        let err = db.delete_project(Uuid::new_v4()).await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }
}
