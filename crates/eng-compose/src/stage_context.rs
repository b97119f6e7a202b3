use std::io::{self, BufRead, Write};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StageContextError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid task id: {0}")]
    InvalidTaskId(#[from] uuid::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no approved execution found for stage '{0}'")]
    StageNotFound(String),
}

pub type Result<T> = std::result::Result<T, StageContextError>;

/// One entry of the approved-stage list exposed to the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStage {
    pub name: String,
    pub summary: String,
}

/// A small, read-only JSON-RPC-over-stdio service giving the running agent
/// process visibility into stages completed earlier in the same task,
/// seeded by `STAGEHAND_DB_PATH` / `STAGEHAND_TASK_ID`.
pub struct StageContextService {
    conn: Connection,
    task_id: Uuid,
}

impl StageContextService {
    pub fn new_from_env() -> Result<Self> {
        let db_path = std::env::var("STAGEHAND_DB_PATH")
            .map_err(|_| StageContextError::MissingEnv("STAGEHAND_DB_PATH"))?;
        let task_id_raw = std::env::var("STAGEHAND_TASK_ID")
            .map_err(|_| StageContextError::MissingEnv("STAGEHAND_TASK_ID"))?;
        let task_id = Uuid::parse_str(&task_id_raw)?;
        Self::new(&db_path, task_id)
    }

    pub fn new(db_path: &str, task_id: Uuid) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self { conn, task_id })
    }

    /// `[{ name, summary }]` for approved stages, ordered by `sort_order`.
    pub fn list_completed_stages(&self) -> Result<Vec<CompletedStage>> {
        let mut stmt = self.conn.prepare(
            "SELECT st.name, se.stage_summary
             FROM stage_executions se
             JOIN stage_templates st ON st.id = se.stage_template_id
             WHERE se.task_id = ?1 AND se.status = 'approved'
             ORDER BY st.sort_order ASC, se.attempt_number DESC",
        )?;
        let rows = stmt.query_map(params![self.task_id.to_string()], |row| {
            Ok(CompletedStage {
                name: row.get(0)?,
                summary: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let stage = row?;
            if seen.insert(stage.name.clone()) {
                out.push(stage);
            }
        }
        Ok(out)
    }

    /// Latest approved `stage_result` for the named stage.
    pub fn get_stage_output(&self, stage_name: &str) -> Result<String> {
        let mut stmt = self.conn.prepare(
            "SELECT se.stage_result
             FROM stage_executions se
             JOIN stage_templates st ON st.id = se.stage_template_id
             WHERE se.task_id = ?1 AND se.status = 'approved' AND st.name = ?2
             ORDER BY se.attempt_number DESC
             LIMIT 1",
        )?;
        let result: Option<Option<String>> = stmt
            .query_row(params![self.task_id.to_string(), stage_name], |row| row.get(0))
            .optional()?;

        match result.flatten() {
            Some(text) => Ok(text),
            None => Err(StageContextError::StageNotFound(stage_name.to_string())),
        }
    }

    pub fn get_task_title(&self) -> Result<String> {
        let title: String = self.conn.query_row(
            "SELECT title FROM tasks WHERE id = ?1",
            params![self.task_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(title)
    }

    fn dispatch(&self, tool: &str, args: Option<&Value>) -> std::result::Result<Value, String> {
        match tool {
            "list_completed_stages" => {
                let stages = self.list_completed_stages().map_err(|e| e.to_string())?;
                Ok(json!(stages))
            }
            "get_stage_output" => {
                let stage_name = args
                    .and_then(|p| p.get("stage_name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing required arg 'stage_name'".to_string())?;
                let output = self.get_stage_output(stage_name).map_err(|e| e.to_string())?;
                Ok(json!({ "stage_result": output }))
            }
            "get_task_title" => {
                let title = self.get_task_title().map_err(|e| e.to_string())?;
                Ok(json!({ "title": title }))
            }
            other => Err(format!("unknown tool: {other}")),
        }
    }

    /// Run the service as a stdio loop: one newline-delimited
    /// `{ "tool": "...", "args": {...} }` request per line, one
    /// `{ "ok": true, "result": ... } | { "ok": false, "error": "..." }`
    /// response per line.
    pub fn run_stdio(&self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<ToolCall>(&line) {
                Ok(call) => match self.dispatch(&call.tool, call.args.as_ref()) {
                    Ok(result) => json!({ "ok": true, "result": result }),
                    Err(message) => {
                        error!(tool = %call.tool, %message, "stage-context call failed");
                        json!({ "ok": false, "error": message })
                    }
                },
                Err(e) => json!({ "ok": false, "error": format!("parse error: {e}") }),
            };

            let text = serde_json::to_string(&response)
                .unwrap_or_else(|_| "{\"ok\":false,\"error\":\"internal error\"}".into());
            writeln!(stdout, "{text}")?;
            stdout.flush()?;
        }

        info!("stage-context service exiting, stdin closed");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> (tempfile::NamedTempFile, Uuid) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE stage_templates (id TEXT PRIMARY KEY, name TEXT, sort_order INTEGER);
             CREATE TABLE tasks (id TEXT PRIMARY KEY, title TEXT);
             CREATE TABLE stage_executions (
                 id TEXT PRIMARY KEY, task_id TEXT, stage_template_id TEXT,
                 attempt_number INTEGER, status TEXT, stage_result TEXT, stage_summary TEXT
             );",
        )
        .unwrap();

        let task_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO tasks (id, title) VALUES (?1, ?2)",
            params![task_id.to_string(), "Fix the login bug"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO stage_templates (id, name, sort_order) VALUES (?1, ?2, ?3)",
            params![template_id.to_string(), "research", 0],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO stage_executions (id, task_id, stage_template_id, attempt_number, status, stage_result, stage_summary)
             VALUES (?1, ?2, ?3, 1, 'approved', 'the research result', 'summary text')",
            params![Uuid::new_v4().to_string(), task_id.to_string(), template_id.to_string()],
        )
        .unwrap();

        (file, task_id)
    }

    #[test]
    fn get_task_title_returns_title() {
        let (file, task_id) = seeded_db();
        let service = StageContextService::new(file.path().to_str().unwrap(), task_id).unwrap();
        assert_eq!(service.get_task_title().unwrap(), "Fix the login bug");
    }

    #[test]
    fn list_completed_stages_returns_approved_only() {
        let (file, task_id) = seeded_db();
        let service = StageContextService::new(file.path().to_str().unwrap(), task_id).unwrap();
        let stages = service.list_completed_stages().unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "research");
        assert_eq!(stages[0].summary, "summary text");
    }

    #[test]
    fn get_stage_output_errors_for_unknown_stage() {
        let (file, task_id) = seeded_db();
        let service = StageContextService::new(file.path().to_str().unwrap(), task_id).unwrap();
        let err = service.get_stage_output("plan").unwrap_err();
        assert!(matches!(err, StageContextError::StageNotFound(_)));
    }

    #[test]
    fn get_stage_output_returns_latest_approved_result() {
        let (file, task_id) = seeded_db();
        let service = StageContextService::new(file.path().to_str().unwrap(), task_id).unwrap();
        assert_eq!(service.get_stage_output("research").unwrap(), "the research result");
    }
}
