use clap::Parser;
use env_logger::Env;
use roster_sync::config::{ProcessingMode, SyncConfig};
use roster_sync::report::MemoryErrorSink;
use roster_sync::{HttpBackend, SyncPipeline, read_rows};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "roster-sync",
    about = "Synchronize a participant roster CSV into the remote backend"
)]
struct Args {
    /// Path to the source roster CSV.
    source: PathBuf,

    /// Base URL of the backend API.
    #[arg(long, env = "ROSTER_SYNC_BACKEND_URL")]
    backend_url: String,

    /// Bearer token for the backend, if it requires one.
    #[arg(long, env = "ROSTER_SYNC_API_TOKEN")]
    api_token: Option<String>,

    /// Local site-code reference extract. Without it the reference
    /// cache runs in on-demand mode.
    #[arg(long)]
    reference_extract: Option<PathBuf>,

    /// Process rows one at a time instead of fanning out per batch.
    #[arg(long)]
    sequential: bool,

    /// Rows per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = SyncConfig::from_env();
    if args.sequential {
        config.mode = ProcessingMode::Sequential;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size.max(1);
    }

    let source = match File::open(&args.source) {
        Ok(file) => file,
        Err(e) => {
            log::error!("cannot open source file {}: {}", args.source.display(), e);
            std::process::exit(1);
        }
    };
    let rows = match read_rows(source) {
        Ok(rows) => rows,
        Err(e) => {
            log::error!("cannot read source rows: {}", e);
            std::process::exit(1);
        }
    };

    let backend = match HttpBackend::new(
        &args.backend_url,
        args.api_token,
        Duration::from_secs(args.request_timeout),
    ) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("cannot build backend client: {}", e);
            std::process::exit(1);
        }
    };

    let errors = MemoryErrorSink::new();
    let pipeline = SyncPipeline::new(&backend, &config, &errors);
    let outcome = pipeline
        .run(&rows, args.reference_extract.as_deref())
        .await;

    for error in errors.errors() {
        log::warn!(
            "row {}: {} ({})",
            error.row_number.map_or_else(|| "?".to_string(), |n| n.to_string()),
            error.message,
            error.participant
        );
    }
    log::info!(
        "sync finished: {}/{} rows ok, {} errors, {} ms",
        outcome.success_count,
        outcome.total_records,
        outcome.error_count,
        outcome.processing_time_ms
    );

    if outcome.success_count == 0 && outcome.error_count > 0 {
        std::process::exit(2);
    }
}
