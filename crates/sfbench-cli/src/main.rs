//! SF-Bench - Salesforce benchmark for AI code-generation agents
//!
//! The `sfbench` command drives evaluation runs end to end.
//!
//! ## Commands
//!
//! - `run`: Evaluate a task file against a set of solutions
//! - `report`: Re-render or migrate an evaluation report
//! - `inventory`: Show DevHub scratch-org capacity
//! - `validate-tasks`: Check a task file against the schema

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use sfbench_core::reporting::instance_from_test_result;
use sfbench_core::{
    check_capacity, generate_evaluation_hash, generate_markdown_summary, get_config,
    init_tracing, make_run_report, migrate_v1_to_v2, set_config, EvalConfig, EvaluationReport,
    LogManager, RunOptions, Scheduler, SolutionLoader, TaskValidator,
};

#[derive(Parser)]
#[command(name = "sfbench")]
#[command(author = "SF-Bench Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Salesforce engineering benchmark for AI agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to a JSON config file (defaults to .sfbench_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation over a task file
    Run {
        /// Path to the task file (JSON array or single object)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Solutions: a directory of {id}.patch/.diff files or a JSON map
        #[arg(short, long)]
        solutions: Option<PathBuf>,

        /// Model name recorded in the report
        #[arg(short, long, default_value = "unknown")]
        model: String,

        /// Dataset label recorded in the report
        #[arg(long, default_value = "verified")]
        dataset: String,

        /// Worker pool size (defaults to config)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Workspace directory for task clones
        #[arg(long, default_value = "workspace")]
        workspace_dir: PathBuf,

        /// Results directory
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,

        /// Log directory
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,

        /// Resume from a checkpoint in this directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Evaluation id (defaults to a run-scoped id)
        #[arg(long)]
        evaluation_id: Option<String>,

        /// Externally created scratch-org alias (single-task runs only;
        /// never deleted on teardown)
        #[arg(long)]
        scratch_org_alias: Option<String>,

        /// Skip the DevHub capacity check
        #[arg(long)]
        skip_capacity_check: bool,
    },

    /// Render a report.json to Markdown, migrating v1 input when needed
    Report {
        /// Path to report.json (v1 or v2)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for the rendered artifacts
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Show DevHub scratch-org capacity
    Inventory {
        /// Number of orgs the planned run needs
        #[arg(long, default_value = "0")]
        required: u64,
    },

    /// Validate a task file against the schema
    ValidateTasks {
        /// Path to the task file
        #[arg(short, long)]
        tasks: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    if let Some(path) = &cli.config {
        set_config(EvalConfig::load(Some(path)));
    }

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            tasks,
            solutions,
            model,
            dataset,
            workers,
            workspace_dir,
            results_dir,
            log_dir,
            checkpoint_dir,
            evaluation_id,
            scratch_org_alias,
            skip_capacity_check,
        } => {
            run_evaluation(RunArgs {
                tasks,
                solutions,
                model,
                dataset,
                workers,
                workspace_dir,
                results_dir,
                log_dir,
                checkpoint_dir,
                evaluation_id,
                scratch_org_alias,
                skip_capacity_check,
            })
            .await
        }
        Commands::Report { input, output } => render_report(&input, &output),
        Commands::Inventory { required } => show_inventory(required).await,
        Commands::ValidateTasks { tasks } => {
            let loaded =
                TaskValidator::validate_and_load(&tasks).context("task validation failed")?;
            info!(tasks = loaded.len(), "task file is valid");
            Ok(())
        }
    }
}

struct RunArgs {
    tasks: PathBuf,
    solutions: Option<PathBuf>,
    model: String,
    dataset: String,
    workers: Option<usize>,
    workspace_dir: PathBuf,
    results_dir: PathBuf,
    log_dir: PathBuf,
    checkpoint_dir: Option<PathBuf>,
    evaluation_id: Option<String>,
    scratch_org_alias: Option<String>,
    skip_capacity_check: bool,
}

async fn run_evaluation(args: RunArgs) -> Result<()> {
    let config = get_config();

    // Input failures are the only way out with a non-zero exit code.
    let tasks = TaskValidator::validate_and_load(&args.tasks).context("failed to load tasks")?;
    let solutions = SolutionLoader::load_solutions(args.solutions.as_deref());
    info!(
        tasks = tasks.len(),
        solutions = solutions.len(),
        model = %args.model,
        "loaded evaluation inputs"
    );

    if !args.skip_capacity_check {
        let needs_orgs = tasks
            .iter()
            .filter(|t| !matches!(t.task_type, sfbench_core::TaskType::Lwc))
            .count() as u64;
        if needs_orgs > 0 {
            let capacity = check_capacity(needs_orgs).await;
            if !capacity.sufficient && !capacity.hubs.is_empty() {
                anyhow::bail!(
                    "insufficient scratch-org capacity: need {needs_orgs}, {} remaining today",
                    capacity.daily_remaining
                );
            }
        }
    }

    let mut report = EvaluationReport::new(args.model.clone(), args.dataset);
    let evaluation_id = args
        .evaluation_id
        .unwrap_or_else(|| format!("{}_{}", args.model.replace('/', "_"), report.run_id));

    let config_snapshot = serde_json::to_value(config.snapshot())?;
    report.config = config.snapshot();
    report.environment.insert(
        "evaluation_hash".into(),
        serde_json::Value::String(generate_evaluation_hash(
            &args.model,
            &args.tasks,
            &config_snapshot,
        )?),
    );
    report.environment.insert(
        "sfbench_version".into(),
        serde_json::Value::String(sfbench_core::VERSION.into()),
    );

    // One directory tree per evaluation: instance logs and the audit
    // trail live under logs/<evaluation_id>/.
    let logs = LogManager::new(&args.log_dir);
    let workers = args.workers.unwrap_or_else(|| config.max_workers());
    let scheduler = Scheduler::new(&args.workspace_dir, &args.results_dir, workers);
    let options = RunOptions {
        evaluation_id: evaluation_id.clone(),
        model_name: args.model.clone(),
        checkpoint_dir: args.checkpoint_dir,
        audit_dir: Some(logs.audit_dir(&evaluation_id)),
        log_dir: Some(args.log_dir.clone()),
        scratch_org_alias: args.scratch_org_alias,
    };

    let results = scheduler
        .run_all(tasks, &solutions, &options)
        .await
        .context("scheduler could not start")?;

    for result in &results {
        let mut instance = instance_from_test_result(result, &args.model, None);
        instance.solution_patch = solutions.get(&result.task_id).cloned();
        report.add_instance(instance);
    }

    let files = make_run_report(&mut report, &args.results_dir, true, true)?;
    for (format, path) in files {
        info!(format, path = %path.display(), "report artifact written");
    }

    Ok(())
}

fn render_report(input: &PathBuf, output: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(input).context("failed to read report")?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("invalid report JSON")?;

    let mut report: EvaluationReport =
        if value.get("schema_version").and_then(|v| v.as_str()) == Some("2.0") {
            serde_json::from_value(value).context("invalid v2 report")?
        } else {
            info!("input is not schema v2; migrating");
            migrate_v1_to_v2(&value)
        };

    report.finalize();
    std::fs::create_dir_all(output)?;
    let md_path = output.join("summary.md");
    std::fs::write(&md_path, generate_markdown_summary(&report))?;
    info!(path = %md_path.display(), "summary rendered");
    Ok(())
}

async fn show_inventory(required: u64) -> Result<()> {
    let capacity = check_capacity(required).await;
    println!("{}", serde_json::to_string_pretty(&capacity)?);
    if !capacity.sufficient {
        info!("capacity below requested threshold");
    }
    Ok(())
}
