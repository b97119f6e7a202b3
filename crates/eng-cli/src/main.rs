#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// stagerunner -- run a Stage Execution Engine pipeline from the command line.
#[derive(Parser)]
#[command(name = "stagerunner", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Project management.
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Stage template management.
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// Task management.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Run, approve, redo, or kill one stage of a task.
    Stage {
        #[command(subcommand)]
        command: StageCommands,
    },

    /// Resolve a commit proposed by a `commit_eligible` stage.
    Commit {
        #[command(subcommand)]
        command: CommitCommands,
    },

    /// The merge sub-stage (§4.8).
    Merge {
        /// Project id.
        #[arg(short, long)]
        project: Uuid,
        /// Task id.
        task: Uuid,
        /// Stage template id for the merge stage.
        stage_template: Uuid,
    },

    /// The interactive-terminal sub-stage (§4.1.6).
    Terminal {
        #[command(subcommand)]
        command: TerminalCommands,
    },

    /// The PR-review sub-loop (§4.7).
    PrReview {
        #[command(subcommand)]
        command: PrReviewCommands,
    },

    /// Environment and connectivity checks.
    Doctor,
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a new project.
    Add {
        /// Display name.
        name: String,
        /// Path to the repository on disk.
        path: String,
    },
    /// List registered projects.
    List {
        /// Include archived projects.
        #[arg(long, default_value_t = false)]
        include_archived: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Add a stage template to a project.
    Add {
        /// Project id.
        project: Uuid,
        /// Display name.
        name: String,
        /// Position in the default sequence.
        sort_order: i64,
        /// Prompt template text (supports `{{task_description}}` etc).
        prompt_template: String,
        /// Output format (text, research, plan, options, findings, pr_review,
        /// pr_preparation, merge, interactive_terminal).
        output_format: String,
    },
    /// List a project's stage templates.
    List {
        /// Project id.
        project: Uuid,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task under a project.
    Add {
        /// Project id.
        project: Uuid,
        /// Title.
        title: String,
        /// Description (becomes `{{task_description}}`).
        description: String,
    },
    /// List a project's tasks.
    List {
        /// Project id.
        project: Uuid,
    },
    /// Check a task's branch out in the project root, pausing its pipeline.
    Eject {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
    },
    /// Re-create a task's worktree and resume its pipeline.
    Inject {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
    },
}

#[derive(Subcommand)]
enum StageCommands {
    /// Run the first attempt of a stage.
    Run {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
        /// Optional user input, when the stage's input source includes it.
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Re-run a stage that is `awaiting_user` or `failed`.
    Redo {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
        /// Optional feedback to fold into the retried prompt.
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Approve the latest attempt's output.
    Approve {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
        /// The user's decision, as a JSON value (e.g. `true`, `["id1","id2"]`).
        #[arg(short, long)]
        decision: Option<String>,
    },
    /// Approve a stage-selection stage, fixing the task's subsequent stages.
    ApproveWithStages {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
        /// Selected stage template ids, in order.
        selected: Vec<Uuid>,
    },
    /// Cancel the in-flight attempt.
    Kill {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
    },
}

#[derive(Subcommand)]
enum CommitCommands {
    /// Show the diff stat and suggested message for a pending commit.
    Show {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
    },
    /// Commit the pending diff, optionally overriding the suggested message.
    Apply {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Skip the pending commit and advance anyway.
    Skip {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
    },
}

#[derive(Subcommand)]
enum TerminalCommands {
    /// Spawn an interactive terminal for a task's worktree.
    Start {
        #[arg(short, long)]
        project: Uuid,
        task: Uuid,
        stage_template: Uuid,
    },
    /// Write bytes to a running terminal's stdin.
    Write {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
        data: String,
    },
    /// Finish a terminal session: summarize and propose a commit if dirty.
    Finish {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
        /// The terminal's captured output tail (last ~8 KB).
        captured_output: String,
    },
    /// Stop a terminal session without summarizing.
    Stop {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
    },
}

#[derive(Subcommand)]
enum PrReviewCommands {
    /// Poll the hosting remote for new review activity.
    Poll {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
    },
    /// Run a fix for one review comment.
    Fix {
        #[arg(short, long)]
        project: Uuid,
        fix_id: Uuid,
        /// Extra context from the user for the fix agent.
        #[arg(short, long)]
        context: Option<String>,
    },
    /// Mark one review comment skipped.
    Skip {
        #[arg(short, long)]
        project: Uuid,
        fix_id: Uuid,
    },
    /// Push, post the triage summary, and advance past the PR-review stage.
    Finalize {
        #[arg(short, long)]
        project: Uuid,
        stage_execution: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = eng_core::Config::load().unwrap_or_default();
    eng_telemetry::init_logging(&cfg.general.log_level);

    let cli = Cli::parse();
    match cli.command {
        Commands::Project { command } => match command {
            ProjectCommands::Add { name, path } => commands::project::add(&cfg, &name, &path).await?,
            ProjectCommands::List { include_archived } => commands::project::list(&cfg, include_archived).await?,
        },
        Commands::Template { command } => match command {
            TemplateCommands::Add {
                project,
                name,
                sort_order,
                prompt_template,
                output_format,
            } => commands::template::add(&cfg, project, &name, sort_order, &prompt_template, &output_format).await?,
            TemplateCommands::List { project } => commands::template::list(&cfg, project).await?,
        },
        Commands::Task { command } => match command {
            TaskCommands::Add {
                project,
                title,
                description,
            } => commands::task::add(&cfg, project, &title, &description).await?,
            TaskCommands::List { project } => commands::task::list(&cfg, project).await?,
            TaskCommands::Eject { project, task } => commands::task::eject(&cfg, project, task).await?,
            TaskCommands::Inject { project, task } => commands::task::inject(&cfg, project, task).await?,
        },
        Commands::Stage { command } => match command {
            StageCommands::Run {
                project,
                task,
                stage_template,
                input,
            } => commands::stage::run(&cfg, project, task, stage_template, input).await?,
            StageCommands::Redo {
                project,
                task,
                stage_template,
                feedback,
            } => commands::stage::redo(&cfg, project, task, stage_template, feedback).await?,
            StageCommands::Approve {
                project,
                task,
                stage_template,
                decision,
            } => commands::stage::approve(&cfg, project, task, stage_template, decision).await?,
            StageCommands::ApproveWithStages {
                project,
                task,
                stage_template,
                selected,
            } => commands::stage::approve_with_stages(&cfg, project, task, stage_template, selected).await?,
            StageCommands::Kill {
                project,
                task,
                stage_template,
            } => commands::stage::kill(&cfg, project, task, stage_template).await?,
        },
        Commands::Commit { command } => match command {
            CommitCommands::Show {
                project,
                stage_execution,
            } => commands::stage::commit_show(&cfg, project, stage_execution).await?,
            CommitCommands::Apply {
                project,
                stage_execution,
                message,
            } => commands::stage::commit_apply(&cfg, project, stage_execution, message).await?,
            CommitCommands::Skip {
                project,
                stage_execution,
            } => commands::stage::commit_skip(&cfg, project, stage_execution).await?,
        },
        Commands::Merge {
            project,
            task,
            stage_template,
        } => commands::merge::run(&cfg, project, task, stage_template).await?,
        Commands::Terminal { command } => match command {
            TerminalCommands::Start {
                project,
                task,
                stage_template,
            } => commands::terminal::start(&cfg, project, task, stage_template).await?,
            TerminalCommands::Write {
                project,
                stage_execution,
                data,
            } => commands::terminal::write(&cfg, project, stage_execution, &data).await?,
            TerminalCommands::Finish {
                project,
                stage_execution,
                captured_output,
            } => commands::terminal::finish(&cfg, project, stage_execution, &captured_output).await?,
            TerminalCommands::Stop {
                project,
                stage_execution,
            } => commands::terminal::stop(&cfg, project, stage_execution).await?,
        },
        Commands::PrReview { command } => match command {
            PrReviewCommands::Poll {
                project,
                stage_execution,
            } => commands::pr_review::poll(&cfg, project, stage_execution).await?,
            PrReviewCommands::Fix {
                project,
                fix_id,
                context,
            } => commands::pr_review::fix(&cfg, project, fix_id, context).await?,
            PrReviewCommands::Skip { project, fix_id } => commands::pr_review::skip(&cfg, project, fix_id).await?,
            PrReviewCommands::Finalize {
                project,
                stage_execution,
            } => commands::pr_review::finalize(&cfg, project, stage_execution).await?,
        },
        Commands::Doctor => commands::doctor::run(&cfg).await?,
    }

    Ok(())
}
