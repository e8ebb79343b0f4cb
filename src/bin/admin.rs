//! eventlog Admin Binary
//!
//! Operator commands against a data directory: inspect, append, read,
//! delete, scavenge and verify.

use clap::{Parser, Subcommand};
use eventlog::{
    Config, DeleteMode, Engine, ExpectedVersion, NewEvent, RecordedEvent, SliceStatus,
};
use tracing_subscriber::{fmt, EnvFilter};

/// eventlog administration
#[derive(Parser, Debug)]
#[command(name = "eventlog-admin")]
#[command(about = "Administer an eventlog data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./eventlog_data", global = true)]
    data_dir: String,

    /// Chunk size in MB (must match the existing chunks)
    #[arg(long, default_value = "256", global = true)]
    chunk_mb: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print engine counters
    Stats,

    /// Append one event
    Append {
        stream: String,
        event_type: String,
        /// Event data (stored as UTF-8 bytes)
        data: String,
        /// Expected version: -2 any, -1 no stream, -4 stream exists, or N
        #[arg(short, long, default_value = "-2", allow_hyphen_values = true)]
        expected: i64,
    },

    /// Read events from a stream
    Read {
        stream: String,
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        from: i64,
        #[arg(short, long, default_value = "20")]
        count: usize,
        /// Read from `from` toward the start (-1 = last event)
        #[arg(short, long)]
        backward: bool,
    },

    /// Read committed events across all streams
    ReadAll {
        #[arg(short, long, default_value = "0")]
        from: i64,
        #[arg(short, long, default_value = "20")]
        count: usize,
    },

    /// Delete a stream
    Delete {
        stream: String,
        /// Tombstone the stream instead of truncating it
        #[arg(long)]
        hard: bool,
        #[arg(short, long, default_value = "-2", allow_hyphen_values = true)]
        expected: i64,
    },

    /// Compact sealed chunks
    Scavenge,

    /// Open the store and print what recovery found
    Verify,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,eventlog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("eventlog-admin v{}", eventlog::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .chunk_size(args.chunk_mb.saturating_mul(1024 * 1024))
        .build();

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = run(&engine, args.command);
    let closed = engine.close();
    if let Err(e) = outcome.and(closed) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn expected_version(raw: i64) -> eventlog::Result<ExpectedVersion> {
    ExpectedVersion::from_raw(raw).ok_or_else(|| {
        eventlog::StoreError::InvalidArgument(format!("invalid expected version {}", raw))
    })
}

fn print_event(event: &RecordedEvent) {
    println!(
        "{}@{}  {}  {}  pos={}  {}",
        event.event_number,
        event.stream,
        event.event_type,
        event.event_id,
        event.log_position,
        String::from_utf8_lossy(&event.data)
    );
}

fn run(engine: &Engine, command: Commands) -> eventlog::Result<()> {
    match command {
        Commands::Stats => {
            let stats = engine.stats();
            println!("writer position:   {}", stats.writer_position);
            println!("chaser position:   {}", stats.chaser_position);
            println!("chunks:            {}", stats.chunk_count);
            println!("memtable entries:  {}", stats.memtable_entries);
            println!("frozen memtables:  {}", stats.frozen_memtables);
            println!("tables per level:  {:?}", stats.tables_per_level);
            println!("index generation:  {}", stats.index_generation);
            println!("index checkpoint:  {}", stats.index_commit_checkpoint);
        }
        Commands::Append {
            stream,
            event_type,
            data,
            expected,
        } => {
            let event = NewEvent::new(event_type, data.into_bytes());
            let result = engine.append(&stream, expected_version(expected)?, &[event])?;
            println!(
                "appended: next expected version {}, position {}",
                result.next_expected_version, result.log_position
            );
        }
        Commands::Read {
            stream,
            from,
            count,
            backward,
        } => {
            let slice = if backward {
                engine.read_stream_backward(&stream, from, count)?
            } else {
                engine.read_stream_forward(&stream, from, count)?
            };
            match slice.status {
                SliceStatus::NoStream => println!("stream '{}' does not exist", stream),
                SliceStatus::StreamDeleted => println!("stream '{}' is deleted", stream),
                SliceStatus::Success => {
                    slice.events.iter().for_each(print_event);
                    println!(
                        "next {}  last {}  end {}",
                        slice.next_event_number, slice.last_event_number, slice.is_end_of_stream
                    );
                }
            }
        }
        Commands::ReadAll { from, count } => {
            let slice = engine.read_all_forward(from, count)?;
            slice.events.iter().for_each(print_event);
            println!("next position {}  end {}", slice.next_position, slice.is_end);
        }
        Commands::Delete {
            stream,
            hard,
            expected,
        } => {
            let mode = if hard { DeleteMode::Hard } else { DeleteMode::Soft };
            let position = engine.delete_stream(&stream, expected_version(expected)?, mode)?;
            println!("deleted '{}' ({:?}) at position {}", stream, mode, position);
        }
        Commands::Scavenge => {
            let report = engine.scavenge()?;
            println!(
                "scavenged {} chunks: kept {}, removed {}, reclaimed {} bytes in {:?}",
                report.chunks_scavenged,
                report.records_kept,
                report.records_removed,
                report.bytes_reclaimed,
                report.elapsed
            );
        }
        Commands::Verify => {
            let report = engine.recovery_report();
            println!("chunks:             {}", report.chunks);
            println!("records scanned:    {}", report.records_scanned);
            println!("checkpoint before:  {}", report.checkpoint_before);
            println!("writer position:    {}", report.writer_position);
            println!("truncated bytes:    {}", report.truncated_bytes);
            println!("torn tail:          {}", report.torn_tail);
            println!("checkpoint missing: {}", report.checkpoint_missing);
            for path in &report.removed_files {
                println!("removed:            {}", path.display());
            }

            println!("sealed chunks ok:   {}", engine.verify_chunks()?);

            // Every committed record is decoded and checksummed on the way
            let mut position = 0;
            let mut events = 0usize;
            loop {
                let slice = engine.read_all_forward(position, 1024)?;
                events += slice.events.len();
                position = slice.next_position;
                if slice.is_end {
                    break;
                }
            }
            println!("committed events:   {}", events);
        }
    }
    Ok(())
}
