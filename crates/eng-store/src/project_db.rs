use eng_core::types::{
    CommentType, CompletionStrategy, ExecutionStatus, FixStatus, GateRule, InputSource,
    OutputFormat, PrReviewFix, ResourceCounters, ResultMode, StageExecution, StageTemplate, Task,
    TaskStage, TaskStatus,
};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::app_db::parse_rfc3339;
use crate::error::Result;
use crate::migrate::{apply_pragmas, run_idempotent};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stage_templates (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        sort_order INTEGER NOT NULL,
        prompt_template TEXT NOT NULL,
        input_source TEXT NOT NULL,
        output_format TEXT NOT NULL,
        output_schema TEXT,
        gate_rules TEXT NOT NULL,
        result_mode TEXT NOT NULL,
        allowed_tools TEXT NOT NULL,
        persona_system_prompt TEXT,
        requires_user_input INTEGER NOT NULL DEFAULT 0,
        creates_pr INTEGER NOT NULL DEFAULT 0,
        triggers_stage_selection INTEGER NOT NULL DEFAULT 0,
        commit_eligible INTEGER NOT NULL DEFAULT 0,
        UNIQUE(project_id, sort_order)
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        current_stage_id TEXT,
        status TEXT NOT NULL,
        branch_name TEXT,
        worktree_path TEXT,
        pr_url TEXT,
        ejected INTEGER NOT NULL DEFAULT 0,
        completion_strategy TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS stage_executions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        stage_template_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        input_prompt TEXT NOT NULL,
        user_input TEXT,
        raw_output TEXT NOT NULL DEFAULT '',
        parsed_output TEXT,
        user_decision TEXT,
        stage_result TEXT,
        stage_summary TEXT,
        thinking_output TEXT,
        error_message TEXT,
        counters TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        UNIQUE(task_id, stage_template_id, attempt_number)
    )",
    "CREATE TABLE IF NOT EXISTS task_stages (
        task_id TEXT NOT NULL,
        stage_template_id TEXT NOT NULL,
        sort_order INTEGER NOT NULL,
        PRIMARY KEY (task_id, stage_template_id)
    )",
    "CREATE TABLE IF NOT EXISTS pr_review_fixes (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        comment_id INTEGER NOT NULL,
        comment_type TEXT NOT NULL,
        author TEXT NOT NULL,
        body TEXT NOT NULL,
        file_path TEXT,
        line INTEGER,
        diff_hunk TEXT,
        state TEXT,
        fix_status TEXT NOT NULL,
        fix_commit_hash TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(execution_id, comment_id, comment_type)
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// A per-project database: `data/<project_id>.db`.
#[derive(Clone)]
pub struct ProjectDb {
    conn: Connection,
}

impl ProjectDb {
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

    // -----------------------------------------------------------------
    // StageTemplate
    // -----------------------------------------------------------------

    pub async fn upsert_stage_template(&self, t: &StageTemplate) -> Result<()> {
        let t = t.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO stage_templates (
                        id, project_id, name, sort_order, prompt_template, input_source,
                        output_format, output_schema, gate_rules, result_mode, allowed_tools,
                        persona_system_prompt, requires_user_input, creates_pr,
                        triggers_stage_selection, commit_eligible
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                    ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, sort_order=excluded.sort_order,
                        prompt_template=excluded.prompt_template, input_source=excluded.input_source,
                        output_format=excluded.output_format, output_schema=excluded.output_schema,
                        gate_rules=excluded.gate_rules, result_mode=excluded.result_mode,
                        allowed_tools=excluded.allowed_tools,
                        persona_system_prompt=excluded.persona_system_prompt,
                        requires_user_input=excluded.requires_user_input,
                        creates_pr=excluded.creates_pr,
                        triggers_stage_selection=excluded.triggers_stage_selection,
                        commit_eligible=excluded.commit_eligible",
                    params![
                        t.id.to_string(),
                        t.project_id.to_string(),
                        t.name,
                        t.sort_order,
                        t.prompt_template,
                        enum_to_sql(&t.input_source)?,
                        enum_to_sql(&t.output_format)?,
                        t.output_schema,
                        enum_to_sql(&t.gate_rules)?,
                        enum_to_sql(&t.result_mode)?,
                        serde_json::to_string(&t.allowed_tools).map_err(to_sqlite_err)?,
                        t.persona_system_prompt,
                        t.requires_user_input as i64,
                        t.creates_pr as i64,
                        t.triggers_stage_selection as i64,
                        t.commit_eligible as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_stage_template(&self, id: Uuid) -> Result<Option<StageTemplate>> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!("{} WHERE id = ?1", STAGE_TEMPLATE_SELECT))?;
                stmt.query_row(params![id_str], row_to_stage_template).optional()
            })
            .await?;
        Ok(row)
    }

    /// All templates for a project, ordered by `sort_order` (the effective
    /// stage list when no TaskStage selection narrows it).
    pub async fn list_stage_templates(&self, project_id: Uuid) -> Result<Vec<StageTemplate>> {
        let pid = project_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE project_id = ?1 ORDER BY sort_order ASC",
                    STAGE_TEMPLATE_SELECT
                ))?;
                let iter = stmt.query_map(params![pid], row_to_stage_template)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let t = task.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO tasks (
                        id, project_id, title, description, current_stage_id, status,
                        branch_name, worktree_path, pr_url, ejected, completion_strategy,
                        created_at, updated_at
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    params![
                        t.id.to_string(),
                        t.project_id.to_string(),
                        t.title,
                        t.description,
                        t.current_stage_id.map(|u| u.to_string()),
                        enum_to_sql(&t.status)?,
                        t.branch_name,
                        t.worktree_path,
                        t.pr_url,
                        t.ejected as i64,
                        enum_to_sql(&t.completion_strategy)?,
                        t.created_at.to_rfc3339(),
                        t.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let t = task.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE tasks SET title=?2, description=?3, current_stage_id=?4, status=?5,
                        branch_name=?6, worktree_path=?7, pr_url=?8, ejected=?9,
                        completion_strategy=?10, updated_at=?11
                     WHERE id=?1",
                    params![
                        t.id.to_string(),
                        t.title,
                        t.description,
                        t.current_stage_id.map(|u| u.to_string()),
                        enum_to_sql(&t.status)?,
                        t.branch_name,
                        t.worktree_path,
                        t.pr_url,
                        t.ejected as i64,
                        enum_to_sql(&t.completion_strategy)?,
                        t.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!("{} WHERE id = ?1", TASK_SELECT))?;
                stmt.query_row(params![id_str], row_to_task).optional()
            })
            .await?;
        Ok(row)
    }

    pub async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let pid = project_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE project_id = ?1 ORDER BY created_at ASC",
                    TASK_SELECT
                ))?;
                let iter = stmt.query_map(params![pid], row_to_task)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// At most one task per project may be ejected; used by the Worktree
    /// Manager to enforce the precondition at eject time.
    pub async fn ejected_task(&self, project_id: Uuid) -> Result<Option<Task>> {
        let pid = project_id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE project_id = ?1 AND ejected = 1",
                    TASK_SELECT
                ))?;
                stmt.query_row(params![pid], row_to_task).optional()
            })
            .await?;
        Ok(row)
    }

    // -----------------------------------------------------------------
    // TaskStage
    // -----------------------------------------------------------------

    pub async fn set_task_stages(&self, task_id: Uuid, stages: &[TaskStage]) -> Result<()> {
        let stages = stages.to_vec();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                tx.execute("DELETE FROM task_stages WHERE task_id = ?1", params![task_id.to_string()])?;
                for s in &stages {
                    tx.execute(
                        "INSERT INTO task_stages (task_id, stage_template_id, sort_order) VALUES (?1,?2,?3)",
                        params![s.task_id.to_string(), s.stage_template_id.to_string(), s.sort_order],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear_task_stages(&self, task_id: Uuid) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute("DELETE FROM task_stages WHERE task_id = ?1", params![task_id.to_string()])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_task_stages(&self, task_id: Uuid) -> Result<Vec<TaskStage>> {
        let id_str = task_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT task_id, stage_template_id, sort_order FROM task_stages
                     WHERE task_id = ?1 ORDER BY sort_order ASC",
                )?;
                let iter = stmt.query_map(params![id_str], |row| {
                    Ok(TaskStage {
                        task_id: parse_uuid(row, 0)?,
                        stage_template_id: parse_uuid(row, 1)?,
                        sort_order: row.get(2)?,
                    })
                })?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------
    // StageExecution
    // -----------------------------------------------------------------

    /// Create an execution row and set the owning task to `in_progress` in
    /// one call. If the task update fails after the execution insert
    /// succeeds, the execution is removed so no orphan `pending`/`running`
    /// row with no corresponding task update is left for the health monitor
    /// to trip over.
    pub async fn create_execution_and_mark_in_progress(
        &self,
        execution: &StageExecution,
        task_id: Uuid,
    ) -> Result<()> {
        let e = execution.clone();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                insert_execution(&tx, &e)?;
                tx.execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![
                        task_id.to_string(),
                        enum_to_sql(&TaskStatus::InProgress)?,
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_execution(&self, execution: &StageExecution) -> Result<()> {
        let e = execution.clone();
        self.conn
            .call(move |c| {
                update_execution_row(c, &e)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Approve an execution and advance the owning task in one call —
    /// either to the next stage or to `completed`.
    pub async fn approve_and_advance(
        &self,
        execution: &StageExecution,
        task_id: Uuid,
        next_stage_id: Option<Uuid>,
        complete_task: bool,
    ) -> Result<()> {
        let e = execution.clone();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                update_execution_row(&tx, &e)?;
                let status = if complete_task {
                    enum_to_sql(&TaskStatus::Completed)?
                } else {
                    enum_to_sql(&TaskStatus::InProgress)?
                };
                tx.execute(
                    "UPDATE tasks SET current_stage_id = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
                    params![
                        task_id.to_string(),
                        next_stage_id.map(|u| u.to_string()),
                        status,
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<StageExecution>> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!("{} WHERE id = ?1", EXECUTION_SELECT))?;
                stmt.query_row(params![id_str], row_to_execution).optional()
            })
            .await?;
        Ok(row)
    }

    /// The "latest" execution for (task, template) — the one with the
    /// highest `attempt_number`.
    pub async fn latest_execution(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
    ) -> Result<Option<StageExecution>> {
        let (tid, sid) = (task_id.to_string(), stage_template_id.to_string());
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE task_id = ?1 AND stage_template_id = ?2
                     ORDER BY attempt_number DESC LIMIT 1",
                    EXECUTION_SELECT
                ))?;
                stmt.query_row(params![tid, sid], row_to_execution).optional()
            })
            .await?;
        Ok(row)
    }

    pub async fn list_executions_for_stage(
        &self,
        task_id: Uuid,
        stage_template_id: Uuid,
    ) -> Result<Vec<StageExecution>> {
        let (tid, sid) = (task_id.to_string(), stage_template_id.to_string());
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE task_id = ?1 AND stage_template_id = ?2 ORDER BY attempt_number ASC",
                    EXECUTION_SELECT
                ))?;
                let iter = stmt.query_map(params![tid, sid], row_to_execution)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// All executions for a task, in id-insertion order — used to
    /// reconstruct the approved-sort_order subsequence for property tests.
    pub async fn list_executions_for_task(&self, task_id: Uuid) -> Result<Vec<StageExecution>> {
        let tid = task_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE task_id = ?1 ORDER BY started_at ASC",
                    EXECUTION_SELECT
                ))?;
                let iter = stmt.query_map(params![tid], row_to_execution)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// All executions with `status = running`, across all tasks — used by
    /// the health monitor's reconciliation sweep.
    pub async fn list_running_executions(&self) -> Result<Vec<StageExecution>> {
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE status = 'running'",
                    EXECUTION_SELECT
                ))?;
                let iter = stmt.query_map([], row_to_execution)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------
    // PrReviewFix
    // -----------------------------------------------------------------

    /// Upsert keyed by (execution_id, comment_id, comment_type); a repeated
    /// poll of the same remote snapshot only touches `updated_at`.
    pub async fn upsert_pr_review_fix(&self, fix: &PrReviewFix) -> Result<()> {
        let f = fix.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO pr_review_fixes (
                        id, execution_id, comment_id, comment_type, author, body, file_path,
                        line, diff_hunk, state, fix_status, fix_commit_hash, created_at, updated_at
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                    ON CONFLICT(execution_id, comment_id, comment_type) DO UPDATE SET
                        author=excluded.author, body=excluded.body, file_path=excluded.file_path,
                        line=excluded.line, diff_hunk=excluded.diff_hunk, state=excluded.state,
                        updated_at=excluded.updated_at",
                    params![
                        f.id.to_string(),
                        f.execution_id.to_string(),
                        f.comment_id,
                        enum_to_sql(&f.comment_type)?,
                        f.author,
                        f.body,
                        f.file_path,
                        f.line,
                        f.diff_hunk,
                        f.state,
                        enum_to_sql(&f.fix_status)?,
                        f.fix_commit_hash,
                        f.created_at.to_rfc3339(),
                        f.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn update_fix_status(
        &self,
        id: Uuid,
        status: FixStatus,
        commit_hash: Option<String>,
    ) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE pr_review_fixes SET fix_status=?2, fix_commit_hash=?3, updated_at=?4 WHERE id=?1",
                    params![
                        id.to_string(),
                        enum_to_sql(&status)?,
                        commit_hash,
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_fixes_for_execution(&self, execution_id: Uuid) -> Result<Vec<PrReviewFix>> {
        let id_str = execution_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "{} WHERE execution_id = ?1 ORDER BY created_at ASC",
                    FIX_SELECT
                ))?;
                let iter = stmt.query_map(params![id_str], row_to_fix)?;
                let mut out = Vec::new();
                for r in iter {
                    out.push(r?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn get_pr_review_fix(&self, id: Uuid) -> Result<Option<PrReviewFix>> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!("{FIX_SELECT} WHERE id = ?1"))?;
                stmt.query_row(params![id_str], row_to_fix).optional()
            })
            .await?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// SQL fragments and row mappers
// ---------------------------------------------------------------------------

const STAGE_TEMPLATE_SELECT: &str = "SELECT id, project_id, name, sort_order, prompt_template,
    input_source, output_format, output_schema, gate_rules, result_mode, allowed_tools,
    persona_system_prompt, requires_user_input, creates_pr, triggers_stage_selection,
    commit_eligible FROM stage_templates";

const TASK_SELECT: &str = "SELECT id, project_id, title, description, current_stage_id, status,
    branch_name, worktree_path, pr_url, ejected, completion_strategy, created_at, updated_at
    FROM tasks";

const EXECUTION_SELECT: &str = "SELECT id, task_id, stage_template_id, attempt_number, status,
    input_prompt, user_input, raw_output, parsed_output, user_decision, stage_result,
    stage_summary, thinking_output, error_message, counters, started_at, completed_at
    FROM stage_executions";

const FIX_SELECT: &str = "SELECT id, execution_id, comment_id, comment_type, author, body,
    file_path, line, diff_hunk, state, fix_status, fix_commit_hash, created_at, updated_at
    FROM pr_review_fixes";

fn insert_execution(tx: &rusqlite::Transaction, e: &StageExecution) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO stage_executions (
            id, task_id, stage_template_id, attempt_number, status, input_prompt, user_input,
            raw_output, parsed_output, user_decision, stage_result, stage_summary,
            thinking_output, error_message, counters, started_at, completed_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        params![
            e.id.to_string(),
            e.task_id.to_string(),
            e.stage_template_id.to_string(),
            e.attempt_number,
            enum_to_sql(&e.status)?,
            e.input_prompt,
            e.user_input,
            e.raw_output,
            opt_json(&e.parsed_output)?,
            opt_json(&e.user_decision)?,
            e.stage_result,
            e.stage_summary,
            e.thinking_output,
            e.error_message,
            serde_json::to_string(&e.counters).map_err(to_sqlite_err)?,
            e.started_at.map(|d| d.to_rfc3339()),
            e.completed_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn update_execution_row(c: &rusqlite::Connection, e: &StageExecution) -> rusqlite::Result<()> {
    c.execute(
        "UPDATE stage_executions SET status=?2, raw_output=?3, parsed_output=?4, user_decision=?5,
            stage_result=?6, stage_summary=?7, thinking_output=?8, error_message=?9, counters=?10,
            started_at=?11, completed_at=?12, user_input=?13
         WHERE id=?1",
        params![
            e.id.to_string(),
            enum_to_sql(&e.status)?,
            e.raw_output,
            opt_json(&e.parsed_output)?,
            opt_json(&e.user_decision)?,
            e.stage_result,
            e.stage_summary,
            e.thinking_output,
            e.error_message,
            serde_json::to_string(&e.counters).map_err(to_sqlite_err)?,
            e.started_at.map(|d| d.to_rfc3339()),
            e.completed_at.map(|d| d.to_rfc3339()),
            e.user_input,
        ],
    )?;
    Ok(())
}

fn row_to_stage_template(row: &Row) -> rusqlite::Result<StageTemplate> {
    Ok(StageTemplate {
        id: parse_uuid(row, 0)?,
        project_id: parse_uuid(row, 1)?,
        name: row.get(2)?,
        sort_order: row.get(3)?,
        prompt_template: row.get(4)?,
        input_source: enum_from_sql::<InputSource>(row, 5)?,
        output_format: enum_from_sql::<OutputFormat>(row, 6)?,
        output_schema: row.get(7)?,
        gate_rules: enum_from_sql::<GateRule>(row, 8)?,
        result_mode: enum_from_sql::<ResultMode>(row, 9)?,
        allowed_tools: serde_json::from_str(&row.get::<_, String>(10)?).map_err(to_rusqlite_err)?,
        persona_system_prompt: row.get(11)?,
        requires_user_input: row.get::<_, i64>(12)? != 0,
        creates_pr: row.get::<_, i64>(13)? != 0,
        triggers_stage_selection: row.get::<_, i64>(14)? != 0,
        commit_eligible: row.get::<_, i64>(15)? != 0,
    })
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_uuid(row, 0)?,
        project_id: parse_uuid(row, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        current_stage_id: opt_uuid(row, 4)?,
        status: enum_from_sql::<TaskStatus>(row, 5)?,
        branch_name: row.get(6)?,
        worktree_path: row.get(7)?,
        pr_url: row.get(8)?,
        ejected: row.get::<_, i64>(9)? != 0,
        completion_strategy: enum_from_sql::<CompletionStrategy>(row, 10)?,
        created_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
    })
}

fn row_to_execution(row: &Row) -> rusqlite::Result<StageExecution> {
    Ok(StageExecution {
        id: parse_uuid(row, 0)?,
        task_id: parse_uuid(row, 1)?,
        stage_template_id: parse_uuid(row, 2)?,
        attempt_number: row.get(3)?,
        status: enum_from_sql::<ExecutionStatus>(row, 4)?,
        input_prompt: row.get(5)?,
        user_input: row.get(6)?,
        raw_output: row.get(7)?,
        parsed_output: opt_json_get(row, 8)?,
        user_decision: opt_json_get(row, 9)?,
        stage_result: row.get(10)?,
        stage_summary: row.get(11)?,
        thinking_output: row.get(12)?,
        error_message: row.get(13)?,
        counters: serde_json::from_str::<ResourceCounters>(&row.get::<_, String>(14)?)
            .map_err(to_rusqlite_err)?,
        started_at: opt_rfc3339(row, 15)?,
        completed_at: opt_rfc3339(row, 16)?,
    })
}

fn row_to_fix(row: &Row) -> rusqlite::Result<PrReviewFix> {
    Ok(PrReviewFix {
        id: parse_uuid(row, 0)?,
        execution_id: parse_uuid(row, 1)?,
        comment_id: row.get(2)?,
        comment_type: enum_from_sql::<CommentType>(row, 3)?,
        author: row.get(4)?,
        body: row.get(5)?,
        file_path: row.get(6)?,
        line: row.get(7)?,
        diff_hunk: row.get(8)?,
        state: row.get(9)?,
        fix_status: enum_from_sql::<FixStatus>(row, 10)?,
        fix_commit_hash: row.get(11)?,
        created_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
    })
}

fn parse_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(to_rusqlite_err)
}

fn opt_uuid(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(to_rusqlite_err)).transpose()
}

fn opt_rfc3339(row: &Row, idx: usize) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_rfc3339(&s)).transpose()
}

fn opt_json(value: &Option<serde_json::Value>) -> rusqlite::Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(to_rusqlite_err)
}

fn opt_json_get(row: &Row, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| serde_json::from_str(&s)).transpose().map_err(to_rusqlite_err)
}

/// Round-trip an enum through its serde JSON representation as a SQL TEXT
/// value (`"pending"` for a plain enum, `{"kind":"require_approval"}` for a
/// tagged one) rather than trying to collapse it to a bare SQL keyword.
fn enum_to_sql<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(to_rusqlite_err)
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(to_rusqlite_err)
}

fn to_rusqlite_err<E: std::fmt::Display>(e: E) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
}

fn to_sqlite_err<E: std::fmt::Display>(e: E) -> rusqlite::Error {
    to_rusqlite_err(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template(project_id: Uuid, sort_order: i64) -> StageTemplate {
        StageTemplate::new(project_id, "Research", sort_order, "{{task_description}}", OutputFormat::Research)
    }

    #[tokio::test]
    async fn stage_template_roundtrip() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();
        let t = sample_template(project_id, 0);
        db.upsert_stage_template(&t).await.unwrap();
        let fetched = db.get_stage_template(t.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Research");
        assert_eq!(fetched.output_format, OutputFormat::Research);
    }

    #[tokio::test]
    async fn list_stage_templates_ordered_by_sort_order() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();
        let t2 = sample_template(project_id, 200);
        let t1 = sample_template(project_id, 0);
        db.upsert_stage_template(&t2).await.unwrap();
        db.upsert_stage_template(&t1).await.unwrap();
        let list = db.list_stage_templates(project_id).await.unwrap();
        assert_eq!(list[0].sort_order, 0);
        assert_eq!(list[1].sort_order, 200);
    }

    #[tokio::test]
    async fn create_execution_marks_task_in_progress() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();
        let task = Task::new(project_id, "add button", "desc");
        db.create_task(&task).await.unwrap();

        let template = sample_template(project_id, 0);
        let exec = StageExecution::new(task.id, template.id, 1, "prompt text");
        db.create_execution_and_mark_in_progress(&exec, task.id).await.unwrap();

        let fetched_task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched_task.status, TaskStatus::InProgress);

        let fetched_exec = db.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(fetched_exec.attempt_number, 1);
    }

    #[tokio::test]
    async fn latest_execution_picks_highest_attempt() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();
        let task = Task::new(project_id, "t", "d");
        db.create_task(&task).await.unwrap();
        let template = sample_template(project_id, 0);

        let e1 = StageExecution::new(task.id, template.id, 1, "p1");
        db.create_execution_and_mark_in_progress(&e1, task.id).await.unwrap();
        let e2 = StageExecution::new(task.id, template.id, 2, "p2");
        db.create_execution_and_mark_in_progress(&e2, task.id).await.unwrap();

        let latest = db.latest_execution(task.id, template.id).await.unwrap().unwrap();
        assert_eq!(latest.attempt_number, 2);
    }

    #[tokio::test]
    async fn pr_review_fix_upsert_is_idempotent_on_identity() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let execution_id = Uuid::new_v4();
        let fix = PrReviewFix::new(execution_id, 42, CommentType::Inline, "reviewer", "please fix this");
        db.upsert_pr_review_fix(&fix).await.unwrap();
        db.upsert_pr_review_fix(&fix).await.unwrap();

        let fixes = db.list_fixes_for_execution(execution_id).await.unwrap();
        assert_eq!(fixes.len(), 1);
    }

    #[tokio::test]
    async fn task_stage_selection_replace() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let task_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.set_task_stages(task_id, &[
            TaskStage { task_id, stage_template_id: a, sort_order: 0 },
            TaskStage { task_id, stage_template_id: b, sort_order: 1 },
        ]).await.unwrap();
        assert_eq!(db.list_task_stages(task_id).await.unwrap().len(), 2);

        db.clear_task_stages(task_id).await.unwrap();
        assert_eq!(db.list_task_stages(task_id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn ejected_task_lookup() {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();
        let mut task = Task::new(project_id, "t", "d");
        task.ejected = true;
        db.create_task(&task).await.unwrap();
        let found = db.ejected_task(project_id).await.unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }
}
