#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use plotbot_harness::config::{self, RunConfig};
use plotbot_harness::lock::{inspect_sidecar, remove_if_stale, LOCK_EXTENSION};
use plotbot_harness::pipeline::{run_pipeline, RunContext};
use plotbot_harness::store::ResultStore;
use plotbot_harness::MetricsAggregator;

#[derive(Parser)]
#[command(name = "plotbot", version, about = "Headline batch dispatcher and result store")]
struct Cli {
    /// Config files layered in order (replaces the default search list)
    #[arg(long = "config", global = true)]
    configs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch every pending item to every resolved model
    Run {
        /// Override GENERATED_DIR
        #[arg(long)]
        generated_dir: Option<PathBuf>,
        /// Also write the run summary JSON here
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
    /// Print the stored result file for one item
    Inspect {
        #[arg(long)]
        item: String,
    },
    /// List lock sidecars in the generated directory
    Locks {
        /// Remove sidecars older than FILE_LOCK_STALE_SECONDS
        #[arg(long)]
        clear_stale: bool,
    },
}

fn load_config(paths: &[PathBuf]) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let loaded = if paths.is_empty() {
        config::discover(&std::env::current_dir()?)?
    } else {
        config::load(paths)?
    };
    Ok(loaded.config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.trim().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut cfg = load_config(&cli.configs)?;
    init_logging(&cfg.log_level);

    match cli.command {
        Commands::Run {
            generated_dir,
            summary_out,
        } => {
            if let Some(dir) = generated_dir {
                cfg.generated_dir = dir;
            }
            cfg.validate()?;
            let ctx = RunContext::new(cfg);

            let cancel = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing in-flight batches");
                    cancel.cancel();
                }
            });

            let outcome = run_pipeline(&ctx).await?;
            println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
            if let Some(path) = summary_out {
                write_json(&path, &outcome.summary)?;
                tracing::info!(path = %path.display(), "summary written");
            }
        }
        Commands::Inspect { item } => {
            let store = ResultStore::new(
                &cfg.generated_dir,
                cfg.lock_config(),
                std::sync::Arc::new(MetricsAggregator::new()),
            )?;
            match store.load(&item)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => return Err(format!("no result file for item {item}").into()),
            }
        }
        Commands::Locks { clear_stale } => {
            let stale_after = cfg.lock_config().stale_after;
            let mut entries: Vec<PathBuf> = match std::fs::read_dir(&cfg.generated_dir) {
                Ok(dir) => dir
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().is_some_and(|ext| ext == LOCK_EXTENSION))
                    .collect(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            entries.sort();

            let mut cleared = 0;
            for path in &entries {
                let Some(status) = inspect_sidecar(path, stale_after)? else {
                    continue;
                };
                let holder = status
                    .record
                    .as_ref()
                    .map(|r| r.holder_id.as_str())
                    .unwrap_or("unknown");
                println!(
                    "{}\t{}\t{:.1}s\t{}",
                    path.display(),
                    holder,
                    status.age.as_secs_f64(),
                    if status.stale { "stale" } else { "live" }
                );
                if clear_stale && status.stale && remove_if_stale(path, stale_after)? {
                    cleared += 1;
                }
            }
            if entries.is_empty() {
                println!("no locks in {}", cfg.generated_dir.display());
            }
            if clear_stale {
                println!("cleared {cleared} stale lock(s)");
            }
        }
    }

    Ok(())
}
