//! Deterministic workflow interpreter.
//!
//! Applies a plan document (`steps:` of typed steps) to the git repository in
//! the current directory, one quality-gated commit per step. Step status is
//! written back into the plan so a rerun resumes where the last run stopped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stepwise::core::summary::RunSummary;
use stepwise::exit_codes;
use stepwise::fix::fix_plan;
use stepwise::io::audit::AuditLog;
use stepwise::io::config::{DEFAULT_CONFIG_PATH, RunnerConfig, load_config};
use stepwise::io::git::Git;
use stepwise::io::plan_store::load_plan;
use stepwise::io::prompt::TerminalPrompt;
use stepwise::io::pull_request::GhPullRequestOpener;
use stepwise::io::quality_gate::ShellQualityGate;
use stepwise::io::safety::SafetyMode;
use stepwise::io::signals::{self, CancelToken};
use stepwise::logging;
use stepwise::run::{Collaborators, RunOutcome, RunRequest, run_plan};
use stepwise::validate::validate_plan_file;

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Deterministic workflow interpreter for plan documents"
)]
struct Cli {
    /// Debug-level diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the pending steps of a plan.
    Run {
        plan: PathBuf,
        /// Config file (default `.stepwise/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Never prompt; warn and wait on a dirty working tree.
        #[arg(long)]
        non_interactive: bool,
    },
    /// Check a plan without executing anything.
    Validate {
        plan: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Auto-fix failed steps and requeue them.
    Fix { plan: PathBuf },
    /// Print the run summary of a plan.
    Status { plan: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::GENERAL
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match command {
        Command::Run {
            plan,
            config,
            non_interactive,
        } => cmd_run(&root, &plan, config.as_deref(), non_interactive),
        Command::Validate { plan, config } => cmd_validate(&root, &plan, config.as_deref()),
        Command::Fix { plan } => cmd_fix(&plan),
        Command::Status { plan } => cmd_status(&plan),
    }
}

fn load(root: &Path, config: Option<&Path>) -> Result<RunnerConfig> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_PATH));
    load_config(&path)
}

fn cmd_run(root: &Path, plan: &Path, config: Option<&Path>, non_interactive: bool) -> Result<i32> {
    let config = load(root, config)?;
    let cancel = CancelToken::new();
    signals::install(cancel.clone())?;

    let safety = if non_interactive || !config.commit.interactive_safety {
        SafetyMode::NonInteractive {
            delay: Duration::from_secs(config.safety.non_interactive_delay_secs),
        }
    } else {
        SafetyMode::Interactive
    };
    let gate = ShellQualityGate::from_config(&config);
    let opener = GhPullRequestOpener::new(Git::with_config(root, &config.git));
    let prompt = TerminalPrompt;
    let request = RunRequest {
        root: root.to_path_buf(),
        plan_path: root.join(plan),
        config,
        safety,
        cancel,
    };
    let deps = Collaborators {
        gate: &gate,
        opener: &opener,
        prompt: &prompt,
    };

    let mut audit = AuditLog::for_repo(root);
    let report = run_plan(&request, deps, &mut audit)?;
    match &report.outcome {
        RunOutcome::Completed => println!("run completed"),
        RunOutcome::Failed { step, error } => println!("step '{step}' failed: {error}"),
        RunOutcome::Interrupted { .. } => {
            println!("run interrupted; plan saved, rerun to resume");
        }
    }
    print_summary(&report.summary);
    Ok(report.exit_code())
}

fn cmd_validate(root: &Path, plan: &Path, config: Option<&Path>) -> Result<i32> {
    let config = load(root, config)?;
    let outcome = validate_plan_file(plan, &config.script_validator())?;
    println!(
        "plan ok: {} steps, {} pending",
        outcome.steps, outcome.pending
    );
    Ok(exit_codes::OK)
}

fn cmd_fix(plan: &Path) -> Result<i32> {
    let report = fix_plan(plan)?;
    for line in report.render() {
        println!("{line}");
    }
    Ok(exit_codes::OK)
}

fn cmd_status(plan: &Path) -> Result<i32> {
    let plan = load_plan(plan)?;
    for step in &plan.steps {
        let score = step
            .rlhf_score
            .map(|s| format!(" ({s:+})"))
            .unwrap_or_default();
        println!("[{}] {} {}{score}", step.status, step.id, step.kind);
    }
    print_summary(&RunSummary::from_plan(&plan));
    Ok(exit_codes::OK)
}

fn print_summary(summary: &RunSummary) {
    for line in summary.render() {
        println!("{line}");
    }
}
