//! tristream CLI - Publish catalog records atomically to three stores.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use tristream::models::StreamName;
use tristream::{
    CheckpointStore, Config, ContentSource, JsonlCatalog, Phase, StagingArea,
    TransactionCoordinator, local_processor_set,
};

#[derive(Parser)]
#[command(name = "tristream")]
#[command(version)]
#[command(about = "Two-phase publishing of records into semantic, vector and document stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "tristream.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish every record of a catalog
    Run {
        /// Path to catalog JSONL file
        #[arg(long)]
        catalog: PathBuf,

        /// Override coordinator.concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Summarize checkpoints by phase
    Status {
        /// List failed records with per-stream errors
        #[arg(long)]
        failed: bool,
    },

    /// Show a record's checkpoint and staged payloads
    Inspect {
        /// Record id
        record_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# tristream configuration file
# Every value may be omitted; environment variables override the file:
#   TRISTREAM_CONCURRENCY, TRISTREAM_CHECKPOINT_DIR,
#   TRISTREAM_STAGING_ROOT, TRISTREAM_STORE_ROOT

[coordinator]
concurrency = 4
checkpoint_dir = "/tmp/tristream/checkpoints"
staging_root = "/tmp/tristream/staging"
stream_timeout_secs = 180
commit_attempts = 1
show_progress = true

[store]
# ${VAR} placeholders are expanded
root = "/tmp/tristream/store"
"#;
    println!("{example}");
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli)?;
            info!("Configuration is valid");
            info!("  Concurrency:    {}", config.coordinator.concurrency);
            info!("  Checkpoints:    {:?}", config.coordinator.checkpoint_dir);
            info!("  Staging:        {:?}", config.coordinator.staging_root);
            info!("  Store:          {:?}", config.store.root);
            info!("  Stream timeout: {}s", config.coordinator.stream_timeout_secs);
            info!("  Commit attempts: {}", config.coordinator.commit_attempts);
        }

        Commands::Run {
            catalog,
            concurrency,
        } => {
            let mut config = load_config(&cli)?;
            if let Some(n) = concurrency {
                config.coordinator.concurrency = *n;
            }
            config.validate().context("Invalid concurrency override")?;

            let catalog = Arc::new(JsonlCatalog::new(catalog));
            let records = catalog
                .load()
                .with_context(|| format!("Failed to load catalog {:?}", catalog))?;

            let processors = local_processor_set(&config.store.root);
            let coordinator = Arc::new(
                TransactionCoordinator::new(config.coordinator.clone(), processors)
                    .context("Failed to initialize coordinator")?,
            );
            let source: Arc<dyn ContentSource> = catalog;
            let summary = coordinator.run(records, source).await;

            println!("\n=== Ingestion Complete ===");
            println!("Total:       {}", summary.total);
            println!("Success:     {}", summary.success);
            println!("Skipped:     {}", summary.skip);
            println!("Failed:      {}", summary.failure);
            println!("Peak:        {} in flight", summary.peak_in_flight);
            println!("Drift:       {}", summary.drift_warnings);
            println!("Runtime:     {:.1}s", summary.runtime_secs);
            println!("Store:       {:?}", config.store.root);

            if summary.has_failures() {
                bail!("{} record(s) failed", summary.failure);
            }
        }

        Commands::Status { failed } => {
            let config = load_config(&cli)?;
            let store = CheckpointStore::new(&config.coordinator.checkpoint_dir)?;
            let records = store.list()?;

            let mut by_phase: BTreeMap<String, usize> = BTreeMap::new();
            for record in &records {
                *by_phase.entry(record.phase.to_string()).or_default() += 1;
            }

            println!("\n=== Checkpoints ({}) ===", records.len());
            for (phase, count) in &by_phase {
                println!("{phase:<14} {count}");
            }

            let orphaned: Vec<_> = records
                .iter()
                .filter(|r| !r.orphaned_streams().is_empty())
                .collect();
            if !orphaned.is_empty() {
                println!("\n{} record(s) have orphaned stream data", orphaned.len());
            }

            if *failed {
                println!();
                for record in records
                    .iter()
                    .filter(|r| matches!(r.phase, Phase::Failed | Phase::RolledBack))
                {
                    println!(
                        "{} [{}] {}",
                        record.record_id,
                        record.phase,
                        record.error.as_deref().unwrap_or("")
                    );
                    for (stream, cp) in &record.per_stream {
                        if let Some(error) = &cp.error {
                            println!("    {stream:<9} {:?}: {error}", cp.status);
                        }
                    }
                }
            }
        }

        Commands::Inspect { record_id } => {
            let config = load_config(&cli)?;
            let store = CheckpointStore::new(&config.coordinator.checkpoint_dir)?;

            match store.load(record_id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("No checkpoint for {record_id}"),
            }

            let staging = StagingArea::new(&config.coordinator.staging_root);
            for stream in StreamName::COMMIT_ORDER {
                if let Some(payload) = staging.read_payload(record_id, stream)? {
                    println!("\n--- staged {stream} payload ---");
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
            }
        }
    }

    Ok(())
}
