use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use specimen_cache::dispatch::Dispatcher;
use specimen_cache::locator::{LocalLocator, RemoteLocator};
use specimen_cache::{
    BackendKind, CachingLocator, ContentHash, ImageRef, OcrResultCache, ProcessEngine, RunLedger, SpecimenCacheConfig,
    hash_file,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "specimen-cache")]
#[command(about = "Content-addressed OCR caching for specimen digitisation batches", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON). Defaults to the nearest specimen-cache.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process images through the cache-aware dispatcher
    Run {
        /// Run identifier (defaults to a UTC timestamp)
        #[arg(long)]
        run_id: Option<String>,

        /// Operator recorded with the run
        #[arg(long)]
        operator: Option<String>,

        /// Process every image the storage backend lists
        #[arg(long, conflicts_with = "references")]
        all: bool,

        /// Image references relative to the storage root
        references: Vec<String>,
    },

    /// Print content hashes of local files
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the cached OCR result for a content hash as JSON
    Show {
        hash: String,

        /// Engine name (defaults to the configured engine)
        #[arg(long)]
        engine: Option<String>,

        /// Engine version (defaults to the configured engine version)
        #[arg(long)]
        engine_version: Option<String>,
    },

    /// Print every cached OCR result as JSON lines
    Export,

    /// List processing runs
    Runs,

    /// Print lineage entries as JSON lines
    Lineage {
        /// Run to print
        #[arg(required_unless_present = "specimen", conflicts_with = "specimen")]
        run_id: Option<String>,

        /// Print the history of one specimen across runs instead
        #[arg(long)]
        specimen: Option<String>,
    },

    /// Inspect or clear the local copy cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show local copy and OCR result cache statistics
    Stats,
    /// Remove every local copy not currently in use
    Clear,
}

fn load_config(path: Option<&PathBuf>) -> Result<SpecimenCacheConfig> {
    match path {
        Some(path) => SpecimenCacheConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(SpecimenCacheConfig::discover()?.unwrap_or_default()),
    }
}

fn default_run_id() -> String {
    chrono::Utc::now().format("run-%Y%m%dT%H%M%S%.3fZ").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "specimen_cache=info",
        1 => "specimen_cache=debug",
        _ => "specimen_cache=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Run {
            run_id,
            operator,
            all,
            references,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let engine = Arc::new(ProcessEngine::from_config(&config.engine).context("Invalid engine configuration")?);
            let dispatcher = Dispatcher::from_config(&config, engine)?;

            let references = if all {
                dispatcher.locator().list().await?
            } else {
                if references.is_empty() {
                    bail!("Pass image references or --all");
                }
                references
                    .into_iter()
                    .map(ImageRef::new)
                    .collect::<specimen_cache::Result<Vec<_>>>()?
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, finishing in-flight specimens");
                    on_signal.cancel();
                }
            });

            let run_id = run_id.unwrap_or_else(default_run_id);
            let report = dispatcher
                .run_batch(&run_id, references, config.snapshot(), operator, &cancel)
                .await?;
            println!("{}", report.summary());
        }

        Commands::Hash { files } => {
            for file in files {
                let hash = hash_file(&file)
                    .await
                    .with_context(|| format!("Failed to hash {}", file.display()))?;
                println!("{}  {}", hash, file.display());
            }
        }

        Commands::Show {
            hash,
            engine,
            engine_version,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let hash = ContentHash::parse(&hash)?;
            let engine = engine.unwrap_or_else(|| config.engine.name.clone());
            let engine_version = engine_version.unwrap_or_else(|| config.engine.version.clone());

            let cache = OcrResultCache::open(config.ocr_cache_dir())?;
            match cache.get(&hash, &engine, &engine_version)? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => bail!("No cached result for {} ({} {})", hash, engine, engine_version),
            }
        }

        Commands::Export => {
            let config = load_config(cli.config.as_ref())?;
            let cache = OcrResultCache::open(config.ocr_cache_dir())?;
            for result in cache.entries()? {
                println!("{}", serde_json::to_string(&result)?);
            }
        }

        Commands::Runs => {
            let config = load_config(cli.config.as_ref())?;
            let ledger = RunLedger::open(config.ledger_dir())?;
            for run in ledger.list_runs()? {
                let counts = ledger.run_stats(&run.run_id)?;
                let state = match run.completed_at {
                    Some(completed_at) => format!("completed {}", completed_at.to_rfc3339()),
                    None => "incomplete".to_string(),
                };
                println!(
                    "{}\tstarted {}\t{}\t{} specimens ({} cache hits, {} failed)\t{}",
                    run.run_id,
                    run.started_at.to_rfc3339(),
                    state,
                    counts.total,
                    counts.cache_hits,
                    counts.failed,
                    run.operator.as_deref().unwrap_or("-")
                );
                if let Some(stats) = run.stats {
                    println!("\t{}", stats);
                }
            }
        }

        Commands::Lineage { run_id, specimen } => {
            let config = load_config(cli.config.as_ref())?;
            let ledger = RunLedger::open(config.ledger_dir())?;
            let entries = match (run_id, specimen) {
                (_, Some(specimen)) => ledger.lineage_for_specimen(&ContentHash::parse(&specimen)?)?,
                (Some(run_id), None) => ledger.lineage(&run_id)?,
                (None, None) => bail!("Pass a run id or --specimen"),
            };
            for entry in entries {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }

        Commands::Cache { action } => {
            let config = load_config(cli.config.as_ref())?;
            match action {
                CacheAction::Stats => {
                    let locator = specimen_cache::build_locator(&config.storage)?;
                    match locator.cache_stats() {
                        Some(stats) => println!(
                            "local copies: {} ({} / {} bytes), hits {}, misses {}, evictions {}, bypasses {}",
                            stats.entries,
                            stats.current_bytes,
                            stats.max_bytes,
                            stats.hits,
                            stats.misses,
                            stats.evictions,
                            stats.bypasses
                        ),
                        None => println!("local copies: cache not configured"),
                    }

                    let results = OcrResultCache::open(config.ocr_cache_dir())?.stats()?;
                    println!(
                        "ocr results: {} rows ({} bytes)",
                        results.total_entries, results.total_bytes
                    );
                }
                CacheAction::Clear => {
                    let Some(cache) = config.storage.cache.as_ref() else {
                        bail!("No local cache configured (storage.cache)");
                    };
                    let (removed, bytes) = match config.storage.kind {
                        BackendKind::Local => {
                            CachingLocator::open(LocalLocator::from_config(&config.storage)?, cache)?.clear()?
                        }
                        BackendKind::Remote => {
                            CachingLocator::open(RemoteLocator::from_config(&config.storage)?, cache)?.clear()?
                        }
                    };
                    println!("Removed {} local copies ({} bytes)", removed, bytes);
                }
            }
        }
    }

    Ok(())
}
