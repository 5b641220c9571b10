//! fieldsync CLI
//!
//! Local diagnostics over the sync stores: queue health, quarantine
//! inspection, media usage and retention purge, conflict log, snapshot
//! control. Works entirely offline; draining requires the host
//! application's remote backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fieldsync::media::MediaStore;
use fieldsync::queue::OperationQueue;
use fieldsync::snapshot::SnapshotCache;
use fieldsync::status::StatusBoard;
use fieldsync::storage::{SqliteStateStore, Storage};
use fieldsync::sync::ConflictLog;
use fieldsync::types::SyncConfig;
use fieldsync::{diagnostics, VERSION};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline sync diagnostics")]
#[command(version = VERSION)]
struct Cli {
    /// Data directory holding state.db and the media store
    #[arg(long, env = "FIELDSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status and overall health
    Status,
    /// List pending operations
    Queue,
    /// Inspect quarantined queue entries
    Quarantine {
        /// Drop all quarantined entries
        #[arg(long)]
        clear: bool,
    },
    /// Show media store usage
    Media {
        /// Purge blobs older than this many days
        #[arg(long)]
        purge_days: Option<u64>,
    },
    /// Show the conflict log
    Conflicts {
        /// Clear the log
        #[arg(long)]
        clear: bool,
    },
    /// Invalidate the bootstrap snapshot
    InvalidateSnapshot,
}

struct Services {
    queue: OperationQueue,
    media: Arc<MediaStore>,
    status: Arc<StatusBoard>,
    conflicts: ConflictLog,
    snapshot: SnapshotCache,
}

fn open_services(data_dir: PathBuf) -> anyhow::Result<Services> {
    let db_path = data_dir.join("state.db");
    let storage = Storage::open(db_path.to_str().context("non-utf8 data dir")?)?;
    let store = Arc::new(SqliteStateStore::new(storage));
    let config = SyncConfig::default();

    let media = Arc::new(MediaStore::new(data_dir.join("media"))?.with_config(&config));
    let status = Arc::new(StatusBoard::open(store.clone()));
    let queue = OperationQueue::open(store.clone(), media.clone(), status.clone())?;
    let conflicts = ConflictLog::new(store.clone());
    let snapshot = SnapshotCache::new(store, &config);

    Ok(Services {
        queue,
        media,
        status,
        conflicts,
        snapshot,
    })
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let services = open_services(data_dir)?;

    match cli.command {
        Commands::Status => {
            let report = diagnostics::collect(
                &services.queue,
                &services.media,
                &services.status,
                &services.conflicts,
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Queue => {
            let ops = services.queue.list_valid()?;
            if ops.is_empty() {
                println!("queue is empty");
            }
            for op in ops {
                println!(
                    "{}  {:<22}  retries={}  enqueued={}",
                    op.id,
                    op.kind.tag(),
                    op.retry_count,
                    op.enqueued_at.to_rfc3339()
                );
            }
        }
        Commands::Quarantine { clear } => {
            let entries = services.queue.quarantined()?;
            println!("{} quarantined entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            if clear {
                services.queue.clear_quarantine()?;
                println!("quarantine cleared");
            }
        }
        Commands::Media { purge_days } => {
            println!(
                "{} blobs, {} bytes",
                services.media.blob_count()?,
                services.media.total_size()?
            );
            if let Some(days) = purge_days {
                let removed = services
                    .media
                    .purge_older_than(Duration::from_secs(days * 24 * 60 * 60))?;
                println!("purged {} blob(s)", removed);
            }
        }
        Commands::Conflicts { clear } => {
            for record in services.conflicts.list() {
                println!(
                    "{}  {}  {}  local={}  remote={}",
                    record.detected_at.to_rfc3339(),
                    record.kind_tag,
                    record.document_id,
                    record.local_timestamp.to_rfc3339(),
                    record
                        .remote_timestamp
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            if clear {
                services.conflicts.clear();
                println!("conflict log cleared");
            }
        }
        Commands::InvalidateSnapshot => {
            services.snapshot.invalidate();
            println!("snapshot invalidated");
        }
    }

    Ok(())
}
