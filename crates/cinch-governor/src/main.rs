//! Inspect conversation histories and governor configs from the command line.
//!
//! Histories are JSON arrays of messages in the governor's wire format.
//!
//! # Examples
//!
//! ```sh
//! # Per-message token estimates
//! governor estimate --history history.json
//!
//! # What would be evicted for a 32k-context model
//! governor trim --history history.json --context 32000
//!
//! # Same, reading the capacity from a model descriptor and printing the
//! # retained history as JSON
//! governor trim --history history.json --model model.json --json
//!
//! # Check tool-call / tool-result pairing
//! governor validate --history history.json
//!
//! # Print a config file with every default filled in
//! governor config --config governor.json
//! ```
//!
//! Set `RUST_LOG=cinch_governor=debug` to see trimming decisions.

use cinch_governor::agent::config::GovernorConfig;
use cinch_governor::context::estimator::estimate_message;
use cinch_governor::context::{
    ContextTrimmer, ContextUsage, DefaultEstimator, ModelBudget, SAFE_LIMIT_RATIO,
};
use cinch_governor::{GovernorError, Message, Result, validate_history};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Inspect conversation histories and governor configs.
#[derive(Parser)]
#[command(name = "governor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate the token cost of every message in a history
    Estimate {
        /// JSON file holding the message array
        #[arg(long)]
        history: PathBuf,
    },

    /// Show how a history would be trimmed for a model
    Trim(TrimArgs),

    /// Check that every tool result answers an earlier tool call
    Validate {
        /// JSON file holding the message array
        #[arg(long)]
        history: PathBuf,
    },

    /// Load, validate, and print a governor config with defaults filled in
    Config {
        /// JSON config file
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct TrimArgs {
    /// JSON file holding the message array
    #[arg(long)]
    history: PathBuf,

    /// Model context capacity in tokens
    #[arg(long, conflicts_with = "model", required_unless_present = "model")]
    context: Option<usize>,

    /// Model descriptor JSON with a `context` or `limit.context` field
    #[arg(long)]
    model: Option<PathBuf>,

    /// Fraction of the context the retained history may occupy
    #[arg(long, default_value_t = SAFE_LIMIT_RATIO)]
    ratio: f64,

    /// Print the retained history as JSON instead of a report
    #[arg(long)]
    json: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|source| GovernorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| GovernorError::Parse {
        what: what.into(),
        source,
    })
}

fn read_history(path: &Path) -> Result<Vec<Message>> {
    read_json(path, "history")
}

fn resolve_budget(args: &TrimArgs) -> Result<ModelBudget> {
    match (&args.model, args.context) {
        (Some(path), _) => {
            let descriptor: Value = read_json(path, "model descriptor")?;
            ModelBudget::from_descriptor(&descriptor)
        }
        (None, Some(0)) => Err(GovernorError::InvalidModel(
            "context capacity must be positive".into(),
        )),
        (None, Some(context)) => Ok(ModelBudget::new(context)),
        (None, None) => Err(GovernorError::InvalidModel(
            "provide --context or --model".into(),
        )),
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|source| GovernorError::Serialize {
        what: what.into(),
        source,
    })
}

// ── Commands ───────────────────────────────────────────────────────

fn estimate(history: &Path) -> Result<()> {
    let history = read_history(history)?;
    let mut total = 0;
    for (index, message) in history.iter().enumerate() {
        let tokens = estimate_message(message);
        total += tokens;
        println!("{index:>4}  {:<9}  {tokens:>7}", message.role.to_string());
    }
    println!("total: {total} tokens across {} messages", history.len());
    Ok(())
}

fn trim(args: &TrimArgs) -> Result<()> {
    let ratio = args.ratio;
    if !(ratio.is_finite() && ratio > 0.0 && ratio <= 1.0) {
        return Err(GovernorError::InvalidConfig(format!(
            "ratio must be in (0, 1], got {ratio}"
        )));
    }
    let budget = resolve_budget(args)?;
    let history = read_history(&args.history)?;

    let trimmer = ContextTrimmer::new().with_safe_limit_ratio(ratio);
    let trimmed = trimmer.trim(&history, &budget);

    if args.json {
        println!("{}", to_pretty_json(&trimmed.messages, "trimmed history")?);
        return Ok(());
    }

    let report = &trimmed.report;
    let usage = ContextUsage::measure(&trimmed.messages, &budget, &DefaultEstimator);
    println!(
        "messages: {} -> {} ({} evicted)",
        report.original_count,
        report.retained_count,
        report.evicted_count()
    );
    println!(
        "tokens:   {} -> {} (safe limit {:.0})",
        report.tokens_before, report.tokens_after, report.safe_limit
    );
    println!("{}", usage.to_log_string());
    if report.over_budget {
        println!("warning: retained history is still over the safe limit");
    }
    Ok(())
}

fn validate(history: &Path) -> Result<()> {
    let history = read_history(history)?;
    validate_history(&history)?;
    println!("ok: {} messages", history.len());
    Ok(())
}

fn show_config(path: &Path) -> Result<()> {
    let config = GovernorConfig::load(path)?;
    println!("{}", to_pretty_json(&config, "governor config")?);
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Estimate { history } => estimate(history),
        Command::Trim(args) => trim(args),
        Command::Validate { history } => validate(history),
        Command::Config { config } => show_config(config),
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
