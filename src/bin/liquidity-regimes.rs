//! liquidity-regimes CLI - run and inspect the liquidity regime pipeline
//!
//! ## Example Usage
//!
//! ```bash
//! # First run: backfill every series from its start date
//! liquidity-regimes cold-start --config liquidity.toml
//!
//! # Weekly incremental cycle
//! liquidity-regimes update
//!
//! # Ledger cursors and recent cycles
//! liquidity-regimes status --cycles 5
//!
//! # Re-export committed composites, labels and the transition matrix
//! liquidity-regimes export --output ./out
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use liquidity_regimes::config::PipelineConfig;
use liquidity_regimes::data::{IngestStatus, SeriesStore, SourceRegistry};
use liquidity_regimes::error::LiquidityError;
use liquidity_regimes::export;
use liquidity_regimes::pipeline::{CycleMode, CycleReport, UpdateOrchestrator};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

/// liquidity-regimes: central-bank liquidity composites and regime labels
#[derive(Parser)]
#[command(name = "liquidity-regimes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental liquidity pipeline with GMM/HMM regime inference", long_about = None)]
struct Cli {
    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (default: ~/.liquidity-regimes/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full pipeline run: ignore ledger cursors and backfill every series
    ColdStart {
        /// Skip the export after a successful commit
        #[arg(long)]
        no_export: bool,
    },

    /// Incremental cycle: fetch only observations after each ledger cursor
    Update {
        /// Skip the export after a successful commit
        #[arg(long)]
        no_export: bool,
    },

    /// Show ledger cursors and recent cycles
    Status {
        /// Number of recent cycles to show
        #[arg(short = 'n', long, default_value = "10")]
        cycles: usize,
    },

    /// Export committed composites, labels and the transition matrix
    Export {
        /// Output directory (default: <data_dir>/exports)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".liquidity-regimes")
        .join("config.toml")
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let result = PipelineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))
        .and_then(|config| match cli.command {
            Commands::ColdStart { no_export } => run_cycle(config, CycleMode::ColdStart, !no_export),
            Commands::Update { no_export } => run_cycle(config, CycleMode::Incremental, !no_export),
            Commands::Status { cycles } => show_status(&config, cycles),
            Commands::Export { output } => run_export(&config, output.as_deref()),
        });

    if let Err(e) = result {
        let code = report_error(&e);
        process::exit(code);
    }
}

/// Print the failure with its stage and series; returns the exit code
fn report_error(err: &anyhow::Error) -> i32 {
    eprintln!("{} {:#}", "Error:".red().bold(), err);
    match err.downcast_ref::<LiquidityError>() {
        Some(e) => {
            if let Some(stage) = e.stage() {
                eprintln!("  {} {}", "Stage:".bold(), stage);
            }
            if let Some(series) = e.series() {
                eprintln!("  {} {}", "Series:".bold(), series);
            }
            e.exit_code()
        }
        None => 1,
    }
}

fn run_cycle(config: PipelineConfig, mode: CycleMode, export_after: bool) -> anyhow::Result<()> {
    let export_dir = config.export_dir();
    let sources = SourceRegistry::from_config(&config)?;
    let mut orchestrator = UpdateOrchestrator::open(config, sources)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("Running {} cycle...", mode));

    let start = Instant::now();
    let outcome = orchestrator.run_cycle(mode);
    pb.finish_and_clear();
    let report = outcome?;
    print_report(&report, start.elapsed());

    if export_after {
        // The cycle is already committed; a failed export is reported on its own
        match export::export_all(orchestrator.store(), &export_dir) {
            Ok(summary) => println!(
                "{} {} files written to {}",
                "Exported:".bold(),
                summary.files.len(),
                export_dir.display()
            ),
            Err(e) => {
                eprintln!("{} export failed: {}", "Warning:".yellow(), e);
            }
        }
    }
    Ok(())
}

fn print_report(report: &CycleReport, elapsed: Duration) {
    println!(
        "{} cycle {} ({}) in {:.2}s",
        "✓".green().bold(),
        report.cycle_id,
        report.mode,
        elapsed.as_secs_f64()
    );
    println!();
    println!("{}", "Series".cyan().bold());
    for series in &report.series {
        let status = match series.status {
            IngestStatus::Ok => series.status.as_str().green(),
            IngestStatus::NoNewData => series.status.as_str().dimmed(),
            IngestStatus::Degraded | IngestStatus::Failed => series.status.as_str().yellow(),
        };
        println!(
            "  {:<24} {:<12} +{:<6} total {:<6} cursor {}",
            series.series_id,
            status,
            series.rows_added,
            series.rows_total,
            series
                .cursor
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
        if let Some(detail) = &series.detail {
            println!("    {}", detail.dimmed());
        }
    }

    println!();
    println!("{}", "Composites".cyan().bold());
    for (name, points) in &report.composites {
        println!("  {:<24} {} points", name, points);
    }
    println!();
    println!(
        "  {} {} observations, {} labels written",
        "Regimes:".bold(),
        report.observations_fitted,
        report.commit.labels_written
    );

    let degraded = report.degraded();
    if !degraded.is_empty() {
        println!("  {} {}", "Degraded:".yellow().bold(), degraded.join(", "));
    }
}

fn open_store(config: &PipelineConfig) -> anyhow::Result<SeriesStore> {
    let path = config.store_path();
    if !path.exists() {
        anyhow::bail!("no store at {}; run cold-start first", path.display());
    }
    Ok(SeriesStore::open(&path)?)
}

fn show_status(config: &PipelineConfig, cycles: usize) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let ledger = store.ledger();

    println!("{}", "Ledger".cyan().bold());
    let entries = ledger.entries()?;
    if entries.is_empty() {
        println!("  {}", "No series ingested yet".dimmed());
    }
    for entry in entries {
        println!(
            "  {:<24} cursor {}  ingested {}",
            entry.series_id.bright_green(),
            entry.last_ingested,
            entry.ingested_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    println!();
    println!("{}", "Recent cycles".cyan().bold());
    for cycle in ledger.recent_cycles(cycles)? {
        let outcome = match cycle.outcome.as_str() {
            "committed" => cycle.outcome.green(),
            "running" => cycle.outcome.yellow(),
            _ => cycle.outcome.red(),
        };
        println!(
            "  {} {:<12} {:<10} {}",
            cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
            cycle.mode,
            outcome,
            cycle.failed_stage.unwrap_or_default()
        );
        if let Some(detail) = cycle.detail {
            println!("    {}", detail.dimmed());
        }
    }
    Ok(())
}

fn run_export(config: &PipelineConfig, output: Option<&Path>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let dir = output.map_or_else(|| config.export_dir(), Path::to_path_buf);
    let summary = export::export_all(&store, &dir)?;
    for file in &summary.files {
        println!("  {} {}", "✓".green(), file.display());
    }
    Ok(())
}
