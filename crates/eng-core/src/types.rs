use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A tracked source repository. Owns a project-scoped store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// StageTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    User,
    PreviousStage,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    Research,
    Plan,
    Options,
    Findings,
    PrReview,
    PrPreparation,
    Merge,
    InteractiveTerminal,
}

impl OutputFormat {
    /// Non-deletable special formats per the data model invariant.
    pub fn is_non_deletable(self) -> bool {
        matches!(
            self,
            OutputFormat::Research
                | OutputFormat::PrPreparation
                | OutputFormat::PrReview
                | OutputFormat::Merge
        )
    }

    /// Whether this format participates in the structured-output parsing
    /// path on first attempt (see `eng-pipeline::parsing`).
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            OutputFormat::Research
                | OutputFormat::Plan
                | OutputFormat::Options
                | OutputFormat::Findings
                | OutputFormat::PrPreparation
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    Replace,
    Append,
    Passthrough,
}

/// A declarative predicate on the user's approval decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateRule {
    RequireApproval,
    RequireSelection { min: usize, max: usize },
    RequireAllChecked,
    RequireFields { fields: Vec<String> },
}

/// The declarative definition of one pipeline stage within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTemplate {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub sort_order: i64,
    pub prompt_template: String,
    pub input_source: InputSource,
    pub output_format: OutputFormat,
    pub output_schema: Option<String>,
    pub gate_rules: GateRule,
    pub result_mode: ResultMode,
    pub allowed_tools: Vec<String>,
    pub persona_system_prompt: Option<String>,
    pub requires_user_input: bool,
    pub creates_pr: bool,
    pub triggers_stage_selection: bool,
    /// Whether approving this stage's output implies code changes that must
    /// be committed before advancing. Promoted to an explicit flag rather
    /// than inferred from a hardcoded name list (see open question in
    /// DESIGN.md).
    pub commit_eligible: bool,
}

impl StageTemplate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: Uuid,
        name: impl Into<String>,
        sort_order: i64,
        prompt_template: impl Into<String>,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            sort_order,
            prompt_template: prompt_template.into(),
            input_source: InputSource::Both,
            output_format,
            output_schema: None,
            gate_rules: GateRule::RequireApproval,
            result_mode: ResultMode::Replace,
            allowed_tools: Vec::new(),
            persona_system_prompt: None,
            requires_user_input: false,
            creates_pr: false,
            triggers_stage_selection: false,
            commit_eligible: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStrategy {
    Pr,
    DirectMerge,
    None,
}

/// One unit of work progressing through a project's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub current_stage_id: Option<Uuid>,
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_url: Option<String>,
    pub ejected: bool,
    pub completion_strategy: CompletionStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            description: description.into(),
            current_stage_id: None,
            status: TaskStatus::Pending,
            branch_name: None,
            worktree_path: None,
            pr_url: None,
            ejected: false,
            completion_strategy: CompletionStrategy::Pr,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// TaskStage
// ---------------------------------------------------------------------------

/// One entry of the ordered subset of stage templates selected for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStage {
    pub task_id: Uuid,
    pub stage_template_id: Uuid,
    pub sort_order: i64,
}

// ---------------------------------------------------------------------------
// StageExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    AwaitingUser,
    Approved,
    Failed,
}

impl ExecutionStatus {
    /// `approved` and `failed` are terminal: an execution never regresses
    /// from either back to a non-terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Approved | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
}

/// One attempt at running a stage of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub stage_template_id: Uuid,
    pub attempt_number: i64,
    pub status: ExecutionStatus,
    pub input_prompt: String,
    pub user_input: Option<String>,
    pub raw_output: String,
    pub parsed_output: Option<serde_json::Value>,
    pub user_decision: Option<serde_json::Value>,
    pub stage_result: Option<String>,
    pub stage_summary: Option<String>,
    pub thinking_output: Option<String>,
    pub error_message: Option<String>,
    pub counters: ResourceCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageExecution {
    pub fn new(task_id: Uuid, stage_template_id: Uuid, attempt_number: i64, input_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            stage_template_id,
            attempt_number,
            status: ExecutionStatus::Pending,
            input_prompt: input_prompt.into(),
            user_input: None,
            raw_output: String::new(),
            parsed_output: None,
            user_decision: None,
            stage_result: None,
            stage_summary: None,
            thinking_output: None,
            error_message: None,
            counters: ResourceCounters::default(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether a transition to `next` is legal from the current status.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        matches!(
            (self.status, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Pending, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::AwaitingUser)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::AwaitingUser, ExecutionStatus::Approved)
                | (ExecutionStatus::AwaitingUser, ExecutionStatus::Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// PrReviewFix
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentType {
    Inline,
    Review,
    Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Pending,
    Fixing,
    Fixed,
    Skipped,
}

/// One PR comment tracked for the PR-Review stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReviewFix {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub comment_id: i64,
    pub comment_type: CommentType,
    pub author: String,
    pub body: String,
    pub file_path: Option<String>,
    pub line: Option<i64>,
    pub diff_hunk: Option<String>,
    pub state: Option<String>,
    pub fix_status: FixStatus,
    pub fix_commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrReviewFix {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: Uuid,
        comment_id: i64,
        comment_type: CommentType,
        author: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            execution_id,
            comment_id,
            comment_type,
            author: author.into(),
            body: body.into(),
            file_path: None,
            line: None,
            diff_hunk: None,
            state: None,
            fix_status: FixStatus::Pending,
            fix_commit_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRecord (in-memory, supervisor-owned)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Agent,
    Pty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: Uuid,
    pub kind: ProcessKind,
    pub stage_execution_id: Option<Uuid>,
    pub spawned_at: DateTime<Utc>,
    pub working_directory: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_terminal() {
        assert!(ExecutionStatus::Approved.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn execution_cannot_leave_terminal_state() {
        let mut exec = StageExecution::new(Uuid::new_v4(), Uuid::new_v4(), 1, "prompt");
        exec.status = ExecutionStatus::Approved;
        assert!(!exec.can_transition_to(ExecutionStatus::Running));
        assert!(!exec.can_transition_to(ExecutionStatus::Failed));
    }

    #[test]
    fn execution_happy_path_transitions() {
        let mut exec = StageExecution::new(Uuid::new_v4(), Uuid::new_v4(), 1, "prompt");
        assert!(exec.can_transition_to(ExecutionStatus::Running));
        exec.status = ExecutionStatus::Running;
        assert!(exec.can_transition_to(ExecutionStatus::AwaitingUser));
        exec.status = ExecutionStatus::AwaitingUser;
        assert!(exec.can_transition_to(ExecutionStatus::Approved));
    }

    #[test]
    fn output_format_non_deletable() {
        assert!(OutputFormat::Research.is_non_deletable());
        assert!(OutputFormat::Merge.is_non_deletable());
        assert!(!OutputFormat::Text.is_non_deletable());
    }

    #[test]
    fn gate_rule_serde_roundtrip() {
        let rule = GateRule::RequireFields {
            fields: vec!["title".into(), "description".into()],
        };
        let json = serde_json::to_string(&rule).unwrap();
        let back: GateRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }
}
