//! Datacard toolkit CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use dc_combine::{CombineRunner, FitReader};

#[derive(Parser)]
#[command(name = "dcard")]
#[command(about = "Datacard building and fit-result extraction")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a card and report its structure
    Validate {
        /// Card file
        #[arg(short, long)]
        card: PathBuf,

        /// Output file for the report (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Asymptotic limits on the signal strength
    Limit {
        /// Card file
        #[arg(short, long)]
        card: PathBuf,

        /// Path of the `combine` binary
        #[arg(long, default_value = "combine")]
        combine: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Observed significance
    Significance {
        /// Card file
        #[arg(short, long)]
        card: PathBuf,

        /// Path of the `combine` binary
        #[arg(long, default_value = "combine")]
        combine: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// NLL at a frozen signal strength
    Nll {
        /// Workspace file
        #[arg(short, long)]
        workspace: PathBuf,

        /// Frozen signal strength
        #[arg(long, default_value = "0.0")]
        r: f64,

        /// Path of the `combine` binary
        #[arg(long, default_value = "combine")]
        combine: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run fit diagnostics and write the document
    Diagnostics {
        /// Workspace file
        #[arg(short, long)]
        workspace: PathBuf,

        /// Output document path
        #[arg(short, long)]
        output: PathBuf,

        /// Freeze all constrained nuisances (statistical-only fit)
        #[arg(long)]
        stat_only: bool,

        /// Path of the `combine` binary
        #[arg(long, default_value = "combine")]
        combine: PathBuf,
    },

    /// Read fitted nuisance parameters from a card's diagnostics
    Pulls {
        /// Card file
        #[arg(short, long)]
        card: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ValidateReport {
    channels: Vec<String>,
    bins: Vec<String>,
    processes: Vec<String>,
    nuisances: Vec<String>,
    observation: std::collections::BTreeMap<String, i64>,
}

fn emit<T: Serialize>(value: &T, output: Option<&PathBuf>) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, text)?,
        None => println!("{}", text),
    }
    Ok(())
}

fn cmd_validate(card: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    let reader = FitReader::open(card)?;
    let report = ValidateReport {
        channels: reader.channels(),
        bins: reader.bin_list()?,
        processes: reader.process_list()?,
        nuisances: reader.card_nuisances(),
        observation: reader.observation()?,
    };
    emit(&report, output)
}

fn cmd_pulls(card: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    let mut reader = FitReader::open(card)?;
    let pulls = reader.pulls()?;
    emit(&pulls, output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the JSON results, logs go to stderr
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { card, output } => cmd_validate(&card, output.as_ref()),
        Commands::Limit { card, combine, output } => {
            let runner = CombineRunner::new().with_combine(combine);
            let limits = runner.asymptotic_limits(&card)?;
            emit(&limits, output.as_ref())
        }
        Commands::Significance { card, combine, output } => {
            let runner = CombineRunner::new().with_combine(combine);
            let significance = runner.significance(&card)?;
            emit(&serde_json::json!({ "significance": significance }), output.as_ref())
        }
        Commands::Nll { workspace, r, combine, output } => {
            let runner = CombineRunner::new().with_combine(combine);
            let record = runner.nll(&workspace, r)?;
            emit(
                &serde_json::json!({
                    "nll0": record.nll0,
                    "nll": record.nll,
                    "nll_abs": record.nll_abs(),
                }),
                output.as_ref(),
            )
        }
        Commands::Diagnostics { workspace, output, stat_only, combine } => {
            let runner = CombineRunner::new().with_combine(combine);
            runner.fit_diagnostics(&workspace, &output, stat_only)?;
            tracing::info!(path = %output.display(), "diagnostics written");
            Ok(())
        }
        Commands::Pulls { card, output } => cmd_pulls(&card, output.as_ref()),
    }
}
