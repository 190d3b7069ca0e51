//! rivven-realtime - Real-time replication runner
//!
//! Replicates one job: records are written to stdout as JSON lines, logs go
//! to stderr, and every checkpoint commit is persisted so the next run
//! resumes from it.
//!
//! ```bash
//! # Replicate until Ctrl+C
//! rivven-realtime -c realtime.yaml
//!
//! # Validate configuration
//! rivven-realtime -c realtime.yaml validate
//!
//! # Forget fingerprints and checkpoint, forcing a full re-emit
//! rivven-realtime -c realtime.yaml reset
//!
//! # Print the configuration JSON Schema
//! rivven-realtime schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rivven_realtime::feed::{CometdTransport, LongPollFeedFactory};
use rivven_realtime::{
    ChangeFeedFactory, CheckpointFile, DataVersions, EngineConfig, FeedKind, FingerprintStore,
    HttpTransport, OutputRecord, RealTimeState, RedbFingerprintStore, ReplicationEngine,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Records buffered between the engine and stdout.
const OUTPUT_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "rivven-realtime")]
#[command(version, about = "Real-time CDC replication from SaaS record APIs")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "realtime.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate until interrupted (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Clear the fingerprint store and checkpoint of the job
    Reset,
    /// Show the configuration JSON Schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::Schema { format }) = &cli.command {
        return show_schema(format);
    }

    let config = EngineConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => {
            println!("Configuration is valid");
            println!("  Job:     {} (entity {})", config.job.id, config.job.schema.id);
            println!("  Channel: {}", config.realtime.channel_name);
            println!("  Feed:    {:?}", config.realtime.feed);
            println!("  Window:  {}s", config.realtime.batch_window_seconds);
            Ok(())
        }
        Commands::Reset => reset(config).await,
        Commands::Schema { .. } => Ok(()),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn show_schema(format: &str) -> Result<()> {
    let schema = EngineConfig::json_schema();
    match format {
        "yaml" => print!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }
    Ok(())
}

fn feed_factory(config: &EngineConfig) -> Result<Box<dyn ChangeFeedFactory>> {
    match config.realtime.feed {
        FeedKind::LongPoll => {
            let cometd = CometdTransport::new(
                &config.connection.instance_url,
                config.connection.access_token.clone(),
                &config.connection.api_version,
            )?;
            Ok(Box::new(LongPollFeedFactory::new(Arc::new(cometd))))
        }
        FeedKind::Streaming => anyhow::bail!(
            "feed 'streaming' needs an event subscriber client, which this binary does not ship; use 'long_poll'"
        ),
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    let job = &config.job;
    info!(job_id = %job.id, entity = %job.schema.id, "Starting rivven-realtime");

    let transport = Arc::new(HttpTransport::new(
        &config.connection.instance_url,
        config.connection.access_token.clone(),
        &config.connection.api_version,
        config.connection.request_timeout(),
    )?);
    let feed = feed_factory(&config)?.create(&config.realtime, &job.schema.id)?;
    let store = RedbFingerprintStore::open_for_job(&config.storage.data_dir, &job.id)
        .context("Failed to open fingerprint store")?;

    let checkpoint_file = CheckpointFile::new(config.checkpoint_path());
    let checkpoint = match checkpoint_file.load().await? {
        Some(state) => {
            info!(path = ?checkpoint_file.path(), last_read_time = %state.last_read_time, "Resuming from checkpoint");
            state
        }
        None => RealTimeState::default(),
    };

    let engine = ReplicationEngine::new(transport, feed, Box::new(store))
        .with_batch_window(config.realtime.batch_window());

    let cancel = CancellationToken::new();
    let (mut records, handle) = engine.spawn(
        job.schema.clone(),
        DataVersions::new(job.job_version, job.shape_version),
        checkpoint,
        cancel.clone(),
        OUTPUT_BUFFER,
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            shutdown.cancel();
        }
    });

    let mut stdout = std::io::stdout().lock();
    while let Some(record) = records.recv().await {
        serde_json::to_writer(&mut stdout, &record)?;
        stdout.write_all(b"\n")?;
        if let OutputRecord::CheckpointCommit(state) = &record {
            stdout.flush()?;
            checkpoint_file
                .save(state)
                .await
                .context("Failed to persist checkpoint")?;
        }
    }
    stdout.flush()?;

    let emitted = handle.await.context("Replication task panicked")??;
    info!(job_id = %job.id, emitted, "rivven-realtime stopped");
    Ok(())
}

async fn reset(config: EngineConfig) -> Result<()> {
    let mut store = RedbFingerprintStore::open_for_job(&config.storage.data_dir, &config.job.id)
        .context("Failed to open fingerprint store")?;
    let removed = store.len()?;
    store.clear()?;

    let checkpoint_file = CheckpointFile::new(config.checkpoint_path());
    checkpoint_file.remove().await?;

    if removed == 0 {
        warn!(job_id = %config.job.id, "Fingerprint store was already empty");
    }
    println!(
        "Reset job '{}': {} fingerprints removed, checkpoint {} deleted",
        config.job.id,
        removed,
        checkpoint_file.path().display()
    );
    Ok(())
}
