//! plotbench - plotting-code benchmark CLI
//!
//! ## Commands
//!
//! - `run`: generate, execute and judge every row of a test set
//! - `summarize`: aggregate a persisted batch into an evaluation summary
//! - `config`: print the effective runtime configuration

mod layout;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use plotbench_core::{load_test_cases, summarize, Batch, BatchHeader, BatchSummary};
use plotbench_runtime::{
    BatchMode, BatchModeKind, BatchRunner, EvaluatorBuilder, FsUnitStore, ProviderRegistry,
    PythonSandbox, RuntimeConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

use layout::RunLayout;

#[derive(Parser)]
#[command(name = "plotbench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Benchmark LLMs on scientific plotting code", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model over a test set
    Run(RunArgs),

    /// Summarise a persisted batch
    Summarize {
        /// Batch file written by `run`
        #[arg(short, long)]
        input: PathBuf,

        /// Write the summary here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as YAML, keys redacted
    Config {
        /// YAML config file (built-in defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Model to benchmark, e.g. deepseek-v3
    #[arg(short, long)]
    model: String,

    /// Scenario tag used in result file names
    #[arg(long, default_value = "plot-generation")]
    scenario: String,

    /// Test-set release, selects testset/<release>.csv (or .xlsx/.xls)
    #[arg(long = "release-version", default_value = "release_v2")]
    release: String,

    /// Also write the batch-wide evaluation summary
    #[arg(long)]
    evaluate: bool,

    /// YAML config file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding testset/, plots/ and result/
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Units evaluated at once
    #[arg(short, long, conflicts_with = "sequential")]
    parallelism: Option<usize>,

    /// Evaluate one unit at a time
    #[arg(long)]
    sequential: bool,

    /// Ignore unit files from an earlier run
    #[arg(long)]
    fresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Summarize { input, output } => cmd_summarize(&input, output.as_deref()),
        Commands::Config { config } => cmd_config(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if args.sequential {
        config.batch.mode = BatchModeKind::Sequential;
    }
    if let Some(parallelism) = args.parallelism {
        if parallelism == 0 {
            bail!("--parallelism must be at least 1");
        }
        config.batch.mode = BatchModeKind::Concurrent;
        config.batch.max_in_flight = parallelism;
    }
    if args.fresh {
        config.batch.resume = false;
    }

    let layout = RunLayout::new(&args.root, &args.model, &args.scenario, &args.release);
    let testset = layout.testset();
    let rows = load_test_cases(&testset)
        .with_context(|| format!("Failed to read test set {}", testset.display()))?;
    tracing::info!(testset = %testset.display(), rows = rows.len(), "Test set loaded");

    let plot_dir = layout.plot_dir();
    std::fs::create_dir_all(&plot_dir)
        .with_context(|| format!("Failed to create {}", plot_dir.display()))?;

    let registry = ProviderRegistry::with_defaults();
    let evaluator = EvaluatorBuilder::from_config(&config, &registry, &args.model)
        .context("Failed to set up endpoints")?
        .executor(Arc::new(PythonSandbox::new(config.sandbox.clone(), plot_dir)))
        .data_root(layout.testset_dir())
        .build()?;
    let usage = evaluator.usage().clone();

    let store = Arc::new(FsUnitStore::new(layout.unit_dir()));
    if !config.batch.resume {
        store
            .clear()
            .await
            .context("Failed to clear earlier unit files")?;
    }

    let header = BatchHeader::new(&args.model, &args.scenario, &args.release);
    let runner = BatchRunner::new(Arc::new(evaluator), BatchMode::from(&config.batch))
        .with_store(store, config.batch.resume)
        .with_usage(usage.clone());
    let batch = runner.run(header, rows).await;

    let batch_file = layout.batch_file();
    write_json(&batch_file, &batch)?;
    tracing::info!(path = %batch_file.display(), "Batch written");

    let summary = summarize(&batch).with_usage(usage.snapshot());
    if args.evaluate {
        let summary_file = layout.summary_file();
        write_json(&summary_file, &summary)?;
        tracing::info!(path = %summary_file.display(), "Summary written");
    }

    print_report(&summary);
    Ok(())
}

fn cmd_summarize(input: &Path, output: Option<&Path>) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read batch {}", input.display()))?;
    let batch: Batch = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse batch {}", input.display()))?;

    let summary = summarize(&batch);
    match output {
        Some(path) => {
            write_json(path, &summary)?;
            print_report(&summary);
        }
        None => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}

fn cmd_config(path: Option<&Path>) -> Result<()> {
    let mut config = load_config(path)?;

    let redact = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("<redacted>".to_string());
        }
    };
    redact(&mut config.generation.default.api_key);
    config
        .generation
        .profiles
        .values_mut()
        .for_each(|profile| redact(&mut profile.api_key));
    redact(&mut config.judge.endpoint.api_key);

    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

/// Write pretty JSON through a temporary sibling, creating parent dirs.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let staged = path.with_extension("json.partial");
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(&staged, body)
        .with_context(|| format!("Failed to write {}", staged.display()))?;
    std::fs::rename(&staged, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

fn print_report(summary: &BatchSummary) {
    let score = |s: Option<f64>| s.map_or("n/a".to_string(), |v| format!("{:.2}", v));

    println!(
        "{} / {}_{}",
        summary.model, summary.scenario, summary.release
    );
    println!(
        "  runnable:     {}/{} ({:.1}%)",
        summary.succeeded,
        summary.total,
        summary.success_rate * 100.0
    );
    println!(
        "  generate rate: {} tokens/s",
        score(summary.mean_generate_rate)
    );
    println!(
        "  correctness:  {} (mean score, 5 = Excellent)",
        score(summary.mean_correctness_score)
    );
    println!(
        "  aesthetics:   {} (mean score, 5 = Excellent)",
        score(summary.mean_aesthetic_score)
    );
    for (stage, count) in &summary.failures_by_stage {
        println!("  failed at {}: {}", stage, count);
    }
}
