//! slotcache command-line tool
//!
//! Creates, inspects and exercises the cache dirs named in a store config.

use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use crossbeam::channel;
use tracing_subscriber::{fmt, EnvFilter};

use slotcache::{CacheKey, CloseHow, Disks, StoreConfig, StoreEntry, StoreError};

/// slotcache disk cache tool
#[derive(Parser, Debug)]
#[command(name = "slotcache")]
#[command(about = "Slot-mapped disk cache storage engine")]
#[command(version)]
struct Args {
    /// Store configuration (TOML)
    #[arg(short, long, default_value = "slotcache.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database files of every cache dir
    Create,

    /// Print per-dir statistics
    Stats,

    /// Store a value
    Put {
        /// Key as 32 hex digits
        key: String,

        /// Value given inline
        value: Option<String>,

        /// Read the value from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print a stored value
    Get {
        /// Key as 32 hex digits
        key: String,

        /// Write the value to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Rebuild the index from disk and report what was found
    Rebuild,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,slotcache=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!("slotcache v{}", slotcache::VERSION);
    tracing::info!("Store config: {}", args.config.display());

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> slotcache::Result<()> {
    let config = StoreConfig::from_toml_file(&args.config)?;
    let mut disks = Disks::new(config)?;

    match args.command {
        Commands::Create => {
            disks.create()?;
            tracing::info!("created {} cache dirs", disks.len());
        }
        Commands::Stats => {
            open(&mut disks)?;
            print!("{}", disks.stat());
        }
        Commands::Put { key, value, file } => {
            open(&mut disks)?;
            let key: CacheKey = key.parse()?;
            let data = match (value, file) {
                (_, Some(path)) => Bytes::from(std::fs::read(path)?),
                (Some(value), None) => Bytes::from(value.into_bytes()),
                (None, None) => {
                    return Err(StoreError::InvalidState(
                        "put needs a value or --file".to_string(),
                    ))
                }
            };
            put(&disks, key, data)?;
        }
        Commands::Get { key, out } => {
            open(&mut disks)?;
            let key: CacheKey = key.parse()?;
            let data = get(&disks, key)?;
            match out {
                Some(path) => std::fs::write(path, &data)?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Commands::Rebuild => {
            open(&mut disks)?;
            let stats = disks.stats();
            println!(
                "rebuilt {} entries, skipped {} corrupt slots, {} of {} slots in use",
                stats.rebuilt, stats.corrupt, stats.entry_count, stats.entry_limit
            );
        }
    }
    Ok(())
}

fn open(disks: &mut Disks) -> slotcache::Result<()> {
    disks.create()?;
    disks.init()?;
    disks.wait_for_rebuild()
}

fn put(disks: &Disks, key: CacheKey, data: Bytes) -> slotcache::Result<()> {
    let mut entry = StoreEntry::with_size(key, data.len() as u64);
    let Some(mut transfer) = disks.create_store_io(&mut entry)? else {
        return Err(StoreError::Full);
    };
    let size = data.len();
    transfer.write(data, Some(0), None)?;
    let closed = transfer.close(CloseHow::WroteAll)?;
    tracing::info!(
        backend = closed.backend,
        slot = closed.slot,
        size,
        "stored {}",
        key
    );
    Ok(())
}

fn get(disks: &Disks, key: CacheKey) -> slotcache::Result<Bytes> {
    let mut entry = disks.get(&key)?.ok_or(StoreError::NotFound)?;
    let mut transfer = disks.open_store_io(&mut entry)?;

    let (tx, rx) = channel::bounded(1);
    let size = transfer.payload_end() as usize;
    transfer.read(
        0,
        size,
        Box::new(move |result: slotcache::Result<Bytes>| {
            let _ = tx.send(result);
        }),
    )?;
    transfer.wait()?;
    transfer.close(CloseHow::ReaderDone)?;

    rx.recv()
        .map_err(|_| StoreError::InvalidState("read never completed".to_string()))?
}
