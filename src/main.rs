//! CLI entry point for the GTFS-RT ingest tool.
//!
//! Provides subcommands for capturing live feeds, replaying captured
//! snapshots through the reconciliation pipeline, and inspecting a single
//! snapshot.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use gtfs_rt_ingest::{
    batch::{BatchJob, CheckpointedBatchRunner, Grouping},
    capture::{LiveCapture, SystemClock},
    config::Config,
    model::TransitSystem,
    fetch::{
        BasicClient, FeedFetcher, HttpFeedFetcher,
        auth::{ApiKey, UrlParam},
    },
    output::{FeedSummary, append_record, print_json, print_pretty},
    parser::decode_feed,
    pipeline::{Pipeline, SnapshotProcessor},
    store::SqliteStore,
};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "gtfs_rt_ingest")]
#[command(about = "Capture, reconcile and persist GTFS-RT feeds", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured feed and store the raw snapshots
    Capture {
        /// Number of capture rounds (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 1)]
        samples: usize,

        /// Seconds between capture rounds
        #[arg(short, long, default_value_t = 60)]
        interval: u64,

        /// Also reconcile and write every captured message
        #[arg(short, long, default_value_t = false)]
        process: bool,
    },
    /// Replay captured snapshots through the pipeline
    Replay {
        /// Name under which progress is checkpointed
        #[arg(short, long)]
        job_name: Option<String>,

        /// Serialized cursor to start after (overrides the stored checkpoint)
        #[arg(long)]
        checkpoint: Option<String>,

        /// Maximum number of snapshots to process
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only snapshots captured at or after this time (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long)]
        chunk_size: Option<usize>,

        /// Process rows in concurrent chunks instead of per-feed order
        #[arg(long, default_value_t = false)]
        ungrouped: bool,
    },
    /// Decode one snapshot from a file or URL and append a summary to a CSV
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Feed id the snapshot belongs to
        #[arg(short, long, default_value = "1")]
        feed_id: String,

        /// CSV file to append results to
        #[arg(short, long, default_value = "inspect.csv")]
        output: String,

        /// Also log the summary as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture {
            samples,
            interval,
            process,
        } => {
            let config = Config::load(&cli.config)?;
            capture(&config, samples, interval, process).await?;
        }
        Commands::Replay {
            job_name,
            checkpoint,
            limit,
            from,
            page_size,
            chunk_size,
            ungrouped,
        } => {
            let config = Config::load(&cli.config)?;
            let job = BatchJob {
                job_name,
                start_cursor: checkpoint,
                from_time: from,
                limit,
                page_size: page_size.unwrap_or(config.batch.page_size),
                chunk_size: chunk_size.unwrap_or(config.batch.chunk_size),
                grouping: if ungrouped {
                    Grouping::Ungrouped
                } else {
                    Grouping::ByFeed
                },
            };
            replay(&config, &job).await?;
        }
        Commands::Inspect {
            source,
            feed_id,
            output,
            json,
        } => {
            let bytes = read_source(&source).await?;
            let message = decode_feed(TransitSystem::NycMta, &feed_id, &bytes)?;
            let summary = FeedSummary::from_message(&message, Utc::now());
            print_pretty(&summary);
            if json {
                print_json(&summary)?;
            }
            append_record(&output, &summary)?;
            info!(
                feed_id = %summary.feed_id,
                trip_updates = summary.trip_updates,
                vehicle_positions = summary.vehicle_positions,
                output,
                "Snapshot inspected"
            );
        }
    }

    Ok(())
}

/// Builds the HTTP fetch stack, attaching the API key the way the config
/// asks for.
fn build_fetcher(config: &Config) -> Result<Arc<dyn FeedFetcher>> {
    let client = BasicClient::with_timeout(HTTP_TIMEOUT)?;
    let fetcher: Arc<dyn FeedFetcher> = match (config.api_key(), &config.api_key_header) {
        (Some(key), Some(header)) => Arc::new(HttpFeedFetcher::new(ApiKey::new(client, header, &key)?)),
        (Some(key), None) => Arc::new(HttpFeedFetcher::new(UrlParam {
            inner: client,
            param_name: config.api_key_param.clone(),
            key,
        })),
        (None, _) => {
            warn!(env = %config.api_key_env, "No API key set, fetching without authentication");
            Arc::new(HttpFeedFetcher::new(client))
        }
    };
    Ok(fetcher)
}

/// Captures all configured feeds, repeating every `interval` seconds.
#[tracing::instrument(skip(config), fields(system = %config.system))]
async fn capture(config: &Config, samples: usize, interval: u64, process: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let mut capture = LiveCapture::new(
        config.system,
        &config.feed_url,
        build_fetcher(config)?,
        store.clone(),
        config.retry.policy(),
        Arc::new(SystemClock),
    );
    if process {
        capture = capture.with_pipeline(Arc::new(Pipeline::new(
            config.system,
            store.clone(),
            store.clone(),
        )));
    }

    if samples == 0 {
        info!(interval, "Capturing indefinitely. Press Ctrl+C to stop.");
    } else {
        info!(samples, interval, "Starting capture");
    }

    let mut round = 0;
    loop {
        round += 1;
        info!(round, feeds = config.feed_ids.len(), "Starting capture round");
        let report = capture.capture_all(&config.feed_ids).await;
        if report.failed() > 0 {
            warn!(round, failed = report.failed(), "Some feeds could not be captured");
        }

        if samples > 0 && round >= samples {
            break;
        }
        info!(interval, "Waiting before next round");
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
    Ok(())
}

#[tracing::instrument(skip_all, fields(system = %config.system))]
async fn replay(config: &Config, job: &BatchJob) -> Result<()> {
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let pipeline = Arc::new(Pipeline::new(config.system, store.clone(), store.clone()));
    let runner = CheckpointedBatchRunner::new(
        config.system,
        store.clone(),
        store.clone(),
        Arc::new(SnapshotProcessor::new(pipeline)),
        Arc::new(SystemClock),
    );

    let summary = runner.run(job).await?;
    info!(
        pages = summary.pages,
        rows = summary.rows,
        checkpoint = summary.last_cursor.as_deref().unwrap_or("-"),
        "Replay complete"
    );
    Ok(())
}

/// Loads snapshot bytes from a local file path or fetches them over HTTP.
#[tracing::instrument(skip_all, fields(source = %source))]
async fn read_source(source: &str) -> Result<Vec<u8>> {
    let bytes = if source.starts_with("http") {
        let fetcher = HttpFeedFetcher::new(BasicClient::with_timeout(HTTP_TIMEOUT)?);
        fetcher.fetch(source, &[]).await?
    } else {
        std::fs::read(source)?
    };
    Ok(bytes)
}
