//! CLI entry point for unpackr
//!
//! Parses command line arguments, loads the JSON configuration, installs
//! the cancellation handler, resolves the external tools, and runs the
//! orchestrator.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use unpackr_core::orchestrator::{RunOptions, RunSummary};
use unpackr_core::runner::{CancelFlag, RunBudget, Runner};
use unpackr_core::tools::ExternalTools;
use unpackr_core::{Config, Orchestrator};

/// Unattended cleanup of Usenet-style download directories: verify parity,
/// extract archives, validate videos, move the good ones, delete the rest.
#[derive(Parser, Debug)]
#[command(name = "unpackr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source downloads directory to clean up
    source: PathBuf,

    /// Destination directory for validated videos
    destination: PathBuf,

    /// Decide everything, execute nothing
    #[arg(short = 'n', long)]
    preview: bool,

    /// Print the pre-flight plan and exit
    #[arg(long)]
    plan_only: bool,

    /// After the run, verify every moved file exists in the destination
    #[arg(long)]
    audit: bool,

    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Disable progress animations
    #[arg(long)]
    no_animations: bool,

    /// Include raw filesystem paths in audit records
    #[arg(long)]
    log_paths: bool,
}

const EXIT_CONFIG_INVALID: u8 = 3;
const EXIT_MISSING_TOOL: u8 = 4;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    if args.preview {
        config.dry_run = true;
    }
    if args.no_color {
        config.color = false;
    }
    if args.no_animations {
        config.animations = false;
    }
    if args.log_paths {
        config.log_paths = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(config.color)
        .init();

    // First signal cancels gracefully; a second one exits immediately.
    let cancel = CancelFlag::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancellation requested; finishing the current operation...");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Second interrupt; exiting immediately.");
                std::process::exit(i32::from(EXIT_CANCELLED));
            }
        }
    });

    let budget = RunBudget::new(config.global_runtime_budget());
    let runner = Runner::new(cancel.clone(), budget.clone());

    let tools = match ExternalTools::resolve(&config, runner).await {
        Ok(tools) => tools,
        Err(err) => {
            eprintln!("Required external tool missing: {}", err);
            return ExitCode::from(EXIT_MISSING_TOOL);
        }
    };

    if config.dry_run {
        println!("Preview mode: decisions run, nothing is executed.");
    }

    let orchestrator = Orchestrator::new(config.clone(), cancel, budget);
    let options = RunOptions {
        plan_only: args.plan_only,
        post_run_audit: args.audit,
        ..RunOptions::default()
    };

    match orchestrator
        .run(&tools, &args.source, &args.destination, &options)
        .await
    {
        Ok(summary) => {
            if args.plan_only {
                print_plan(&summary);
                return ExitCode::SUCCESS;
            }
            print_summary(&summary);
            if summary.cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Run failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| e.to_string()),
        None => {
            let default_path = std::path::Path::new("config.json");
            if default_path.exists() {
                Config::load(default_path).map_err(|e| e.to_string())
            } else {
                let config = Config::default();
                config.validate().map_err(|e| e.to_string())?;
                Ok(config)
            }
        }
    }
}

fn print_plan(summary: &RunSummary) {
    println!("Pre-flight plan ({} folders):", summary.plan.len());
    for folder in &summary.plan {
        println!(
            "  {:<18} {} (videos: {}, archives: {}, parity: {})",
            folder.classification.to_string(),
            folder.path.display(),
            folder.videos,
            folder.archives,
            folder.parity
        );
    }
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!("\nProcessing complete.");
    println!("Folders cleaned:    {}", stats.folders_cleaned);
    println!("Folders preserved:  {}", stats.folders_preserved);
    println!("Folders skipped:    {}", stats.folders_skipped);
    println!("Folders errored:    {}", stats.folders_errored);
    println!("Videos moved:       {}", stats.videos_moved);
    println!("Videos rejected:    {}", stats.videos_rejected);
    println!("Bytes moved:        {}", stats.bytes_moved);
    println!("Archives extracted: {}", stats.archives_extracted);
    println!("Junk files removed: {}", stats.junk_files_removed);

    if stats.operations_refused > 0 {
        println!("\nRefused operations by invariant:");
        for (invariant, count) in &stats.refusals_by_invariant {
            println!("  {:<20} {}", invariant, count);
        }
    }

    if !summary.abandoned_folders.is_empty() {
        println!(
            "\n{} folder(s) could not be deleted after retries:",
            summary.abandoned_folders.len()
        );
        for folder in &summary.abandoned_folders {
            println!("  {}", folder.display());
        }
    }

    if !summary.audit_missing.is_empty() {
        println!(
            "\nPost-run audit: {} moved file(s) missing from the destination:",
            summary.audit_missing.len()
        );
        for file in &summary.audit_missing {
            println!("  {}", file.display());
        }
    }

    if summary.budget_exhausted {
        println!("\nStopped early: global runtime budget exhausted.");
    }
    if summary.cancelled {
        println!("\nCancelled by user; statistics reflect completed work only.");
    }
}
