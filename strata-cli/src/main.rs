//! Strata CLI - load, inspect and query a tick table

mod tick;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use strata_core::chunk::{BincodeSerializer, ChunkMeta, CompressionKind};
use strata_core::kv::StoreBackend;
use strata_core::segment::{CalendarSegmentFinder, CalendarUnit, SegmentFinder, SingleSegmentFinder};
use strata_core::update::{OnFlush, UpdateProgress, WriteStrategy};
use strata_core::{Closeable, LiveSegmentMode, StorageConfig, TimeSeriesDb, Timestamp, MAX_TIME, MIN_TIME};
use tick::{Tick, TickGenerator};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata time-series table tool", version, long_about = None)]
struct Cli {
    /// Data directory holding the tables
    #[arg(short, long, env = "STRATA_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Table name
    #[arg(short, long, default_value = "ticks")]
    table: String,

    /// Segment boundaries
    #[arg(long, value_enum, default_value_t = Segments::Day)]
    segments: Segments,

    /// Journal live values so they survive a restart
    #[arg(long)]
    write_through: bool,

    /// Keep metadata in memory only
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Segments {
    Day,
    Month,
    Year,
    Single,
}

impl Segments {
    fn finder(self) -> Arc<dyn SegmentFinder<String>> {
        match self {
            Segments::Day => Arc::new(CalendarSegmentFinder::new(CalendarUnit::Day)),
            Segments::Month => Arc::new(CalendarSegmentFinder::new(CalendarUnit::Month)),
            Segments::Year => Arc::new(CalendarSegmentFinder::new(CalendarUnit::Year)),
            Segments::Single => Arc::new(SingleSegmentFinder),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Sequential,
    Parallel,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    None,
    Lz4,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk load synthetic ticks, optionally feeding the newest ones live
    Load {
        key: String,
        /// Number of ticks
        #[arg(short, long, default_value_t = 100_000)]
        count: u64,
        /// Time of the first tick (milliseconds or RFC 3339); defaults to
        /// `count` intervals before now
        #[arg(long, value_parser = parse_time)]
        start: Option<Timestamp>,
        /// Spacing of ticks in milliseconds
        #[arg(long, default_value_t = 1_000)]
        interval_ms: i64,
        /// Feed this many of the newest ticks one at a time
        #[arg(long, default_value_t = 0)]
        live: u64,
        #[arg(long, value_enum, default_value_t = Strategy::Parallel)]
        strategy: Strategy,
        /// Encoding threads of the parallel strategy (defaults to the core count)
        #[arg(long)]
        workers: Option<usize>,
        /// Values per chunk
        #[arg(long, default_value_t = strata_core::config::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        #[arg(long, value_enum, default_value_t = Compression::Lz4)]
        compression: Compression,
    },
    /// List keys, or the segments and chunks of one key
    Inspect {
        key: Option<String>,
        /// Also list the chunks of every segment
        #[arg(long)]
        chunks: bool,
    },
    /// Latest tick at or before a time
    Latest {
        key: String,
        #[arg(long, value_parser = parse_time)]
        at: Option<Timestamp>,
    },
    /// The n-th tick before a time, or the first tick
    Prev {
        key: String,
        #[arg(long, value_parser = parse_time)]
        at: Timestamp,
        #[arg(short, default_value_t = 1)]
        n: u64,
    },
    /// The n-th tick after a time, or the last tick
    Next {
        key: String,
        #[arg(long, value_parser = parse_time)]
        at: Timestamp,
        #[arg(short, default_value_t = 1)]
        n: u64,
    },
    /// Ticks whose time lies in [from, to]
    Range {
        key: String,
        #[arg(long, value_parser = parse_time)]
        from: Option<Timestamp>,
        #[arg(long, value_parser = parse_time)]
        to: Option<Timestamp>,
        /// Newest first
        #[arg(long)]
        reverse: bool,
        /// Stop after this many ticks
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete every tick of a key
    Delete { key: String },
}

/// Accepts epoch milliseconds or an RFC 3339 date-time
fn parse_time(s: &str) -> Result<Timestamp, String> {
    if let Ok(millis) = s.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("expected milliseconds or RFC 3339 time: {}", e))
}

fn display_time(t: Timestamp) -> String {
    if t == MIN_TIME || t == MAX_TIME {
        return t.to_string();
    }
    match Utc.timestamp_millis_opt(t).single() {
        Some(dt) => dt.to_rfc3339(),
        None => t.to_string(),
    }
}

#[derive(Serialize)]
struct SegmentView {
    from: String,
    to: String,
    values: u64,
    chunks: u64,
    first: Tick,
    last: Tick,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_index: Option<Vec<ChunkMeta>>,
}

#[derive(Serialize)]
struct LiveView {
    from: String,
    to: String,
    values: usize,
}

#[derive(Serialize)]
struct KeyView {
    key: String,
    inconsistent: bool,
    segments: Vec<SegmentView>,
    live: Option<LiveView>,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so query output stays machine readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let finder = cli.segments.finder();

    let mut config = StorageConfig {
        data_dir: cli.data_dir.clone(),
        backend: if cli.in_memory { StoreBackend::Memory } else { StoreBackend::Log },
        live_mode: if cli.write_through {
            LiveSegmentMode::WriteThrough
        } else {
            LiveSegmentMode::InMemory
        },
        ..Default::default()
    };
    if let Commands::Load {
        strategy,
        workers,
        batch_size,
        compression,
        ..
    } = &cli.command
    {
        config.batch_size = *batch_size;
        config.compression = match compression {
            Compression::None => CompressionKind::None,
            Compression::Lz4 => CompressionKind::Lz4,
        };
        config.write_strategy = match (strategy, workers) {
            (Strategy::Sequential, _) => WriteStrategy::Sequential,
            (Strategy::Parallel, Some(workers)) => WriteStrategy::Parallel { workers: *workers },
            (Strategy::Parallel, None) => WriteStrategy::default(),
        };
    }

    debug!("Data directory: {:?}", config.data_dir);
    let db: Arc<TimeSeriesDb<String, Tick>> = TimeSeriesDb::builder(&cli.table)
        .config(config)
        .serializer(Arc::new(BincodeSerializer::<Tick>::new()))
        .segment_finder(finder.clone())
        .open()
        .with_context(|| format!("failed to open table {}", cli.table))?;

    let result = run(&db, finder.as_ref(), cli.command);
    db.close()?;
    result
}

fn run(db: &TimeSeriesDb<String, Tick>, finder: &dyn SegmentFinder<String>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Load {
            key,
            count,
            start,
            interval_ms,
            live,
            ..
        } => {
            if live > count {
                bail!("--live ({}) exceeds --count ({})", live, count);
            }
            let start = start.unwrap_or_else(|| {
                Utc::now().timestamp_millis() - (count as i64).saturating_mul(interval_ms)
            });
            let ticks: Vec<Tick> = TickGenerator::new(rand::thread_rng(), start, interval_ms, count).collect();

            // Live ticks start a fresh segment; anything before it is bulk loaded
            let split = ticks.len() - live as usize;
            let live_from = ticks
                .get(split)
                .map(|tick| finder.segment_of(&key, tick.time).from)
                .unwrap_or(MAX_TIME);
            let bulk_len = ticks.partition_point(|tick| tick.time < live_from);
            let mut ticks = ticks;
            let live_ticks = ticks.split_off(bulk_len);

            let started = Instant::now();
            let mut listener = OnFlush(|chunk: &ChunkMeta, progress: &UpdateProgress| {
                debug!(
                    "Flushed chunk [{}, {}]: {} values ({} total)",
                    chunk.min_time, chunk.max_time, chunk.value_count, progress.value_count
                );
            });
            let summary = db.update(&key, ticks, &mut listener)?;
            info!(
                "Loaded {} ticks into {} chunks in {:?} ({} already stored)",
                summary.value_count,
                summary.chunk_count,
                started.elapsed(),
                summary.skipped
            );

            let live_count = live_ticks.len();
            for tick in live_ticks {
                db.put_next_live_value(&key, tick)?;
            }
            if live_count > 0 {
                info!("Appended {} live ticks", live_count);
            }
            db.flush()?;
            print_json(&summary_json(&summary, live_count))
        }
        Commands::Inspect { key: None, .. } => {
            let created = db.created()?;
            print_json(&serde_json::json!({
                "table": db.name(),
                "created": created.to_rfc3339(),
                "keys": db.keys()?,
            }))
        }
        Commands::Inspect { key: Some(key), chunks } => {
            let mut segments = Vec::new();
            for summary in db.segments(&key)? {
                let first = match db.get_next_value(&key, summary.first_time, 0)? {
                    Some(tick) => tick,
                    None => continue,
                };
                let last = match db.get_latest_value(&key, summary.last_time)? {
                    Some(tick) => tick,
                    None => continue,
                };
                let chunk_index = if chunks {
                    Some(db.chunks(&key, summary.range.from)?)
                } else {
                    None
                };
                segments.push(SegmentView {
                    from: display_time(summary.range.from),
                    to: display_time(summary.range.to),
                    values: summary.value_count,
                    chunks: summary.chunk_count,
                    first,
                    last,
                    chunk_index,
                });
            }
            let live = db.live_segment(&key)?.map(|(range, values)| LiveView {
                from: display_time(range.from),
                to: display_time(range.to),
                values,
            });
            print_json(&KeyView {
                inconsistent: db.is_empty_or_inconsistent(&key)? && !segments.is_empty(),
                key,
                segments,
                live,
            })
        }
        Commands::Latest { key, at } => {
            let at = at.unwrap_or(MAX_TIME);
            print_json(&db.get_latest_value(&key, at)?)
        }
        Commands::Prev { key, at, n } => print_json(&db.get_previous_value(&key, at, n)?),
        Commands::Next { key, at, n } => print_json(&db.get_next_value(&key, at, n)?),
        Commands::Range {
            key,
            from,
            to,
            reverse,
            limit,
        } => {
            let from = from.unwrap_or(MIN_TIME);
            let to = to.unwrap_or(MAX_TIME);
            let mut range = if reverse {
                db.range_values_reverse(&key, to, from)?
            } else {
                db.range_values(&key, from, to)?
            };
            let mut printed = 0usize;
            for tick in range.by_ref().take(limit.unwrap_or(usize::MAX)) {
                println!("{}", serde_json::to_string(&tick?)?);
                printed += 1;
            }
            range.close();
            debug!("Printed {} ticks", printed);
            Ok(())
        }
        Commands::Delete { key } => {
            db.delete_range(&key)?;
            db.flush()?;
            info!("Deleted key {}", key);
            Ok(())
        }
    }
}

fn summary_json(summary: &strata_core::update::UpdateSummary, live: usize) -> serde_json::Value {
    serde_json::json!({
        "values": summary.value_count,
        "chunks": summary.chunk_count,
        "skipped": summary.skipped,
        "from": summary.min_time.map(display_time),
        "to": summary.max_time.map(display_time),
        "live": live,
    })
}
