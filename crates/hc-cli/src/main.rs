//! histcache CLI

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

use hc_yield::{CountMode, Counter, Directory};

use crate::config::{AnalysisConfig, env_base};

#[derive(Parser)]
#[command(name = "histcache")]
#[command(about = "histcache - fingerprinted aggregate cache and yield counting")]
#[command(version)]
struct Cli {
    /// Analysis configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize every booking (and projection) of a sample
    Fill {
        /// Sample name
        sample: String,

        /// Systematic shift (defaults to nominal)
        #[arg(long)]
        shift: Option<String>,
    },

    /// Yield of a process at an aggregate path
    Count {
        /// Process name
        process: String,

        /// Slash-delimited aggregate path
        path: String,

        /// Apply the low-count Poisson error floor
        #[arg(long)]
        poisson: bool,

        /// Systematic shift (defaults to nominal)
        #[arg(long)]
        shift: Option<String>,
    },

    /// Background yield at an aggregate path
    Background {
        /// Slash-delimited aggregate path
        path: String,

        /// Estimate from data in control and sideband regions instead of MC
        #[arg(long)]
        datadriven: bool,

        /// Systematic shift (defaults to nominal)
        #[arg(long)]
        shift: Option<String>,
    },

    /// Remove every stored aggregate of a sample
    Clear {
        /// Sample name
        sample: String,

        /// Systematic shift (defaults to nominal)
        #[arg(long)]
        shift: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = AnalysisConfig::read(&cli.config)?;
    let config_dir = cli.config.parent().map(Path::to_path_buf).unwrap_or_default();
    let roots = cfg.roots(&config_dir, env_base());
    tracing::debug!(data = %roots.data.display(), cache = %roots.cache.display(), "resolved roots");
    let mut session = cfg.session(&roots)?;

    match cli.command {
        Commands::Fill { sample, shift } => {
            let records = session
                .fill(&sample, shift.as_deref())
                .with_context(|| format!("filling sample '{sample}'"))?;
            write_json(json!({
                "sample": sample,
                "shift": shift,
                "aggregates": records,
                "stats": session.stats(&sample, shift.as_deref()),
            }))
        }
        Commands::Count { process, path, poisson, shift } => {
            let mode = if poisson { CountMode::Poisson } else { CountMode::Naive };
            let count = Counter::new(&mut session, &cfg.processes)
                .with_shift(shift.as_deref())
                .get_count(&process, &Directory::Single(path.clone()), mode);
            write_json(json!({
                "process": process,
                "path": path,
                "value": count.value,
                "error": count.error,
                "entries": count.entries,
            }))
        }
        Commands::Background { path, datadriven, shift } => {
            let count = Counter::new(&mut session, &cfg.processes)
                .with_shift(shift.as_deref())
                .get_background_count(&Directory::Single(path.clone()), &cfg.background, datadriven);
            write_json(json!({
                "path": path,
                "datadriven": datadriven,
                "value": count.value,
                "error": count.error,
                "entries": count.entries,
            }))
        }
        Commands::Clear { sample, shift } => {
            session
                .clear(&sample, shift.as_deref())
                .with_context(|| format!("clearing sample '{sample}'"))?;
            write_json(json!({ "cleared": sample, "shift": shift }))
        }
    }
}

fn write_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
