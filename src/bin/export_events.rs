//! export_events - export one business type's event stream as JSON or CSV

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use zonewatch::events::{stream_stats, write_csv, write_json, EventKind};
use zonewatch::{BusinessType, EventFilter, EventStore, SqliteEventStore};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the zonewatch database.
    #[arg(long, default_value = "zonewatch.db", env = "ZONEWATCH_DB_PATH")]
    db_path: String,
    /// Business type whose stream is exported.
    #[arg(long)]
    stream: BusinessType,
    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,
    /// Output file (stdout when absent).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Only records of this kind (track_created, zone_changed, track_retired, alert).
    #[arg(long)]
    kind: Option<String>,
    /// Earliest timestamp, epoch milliseconds.
    #[arg(long)]
    since_ms: Option<u64>,
    /// Latest timestamp, epoch milliseconds.
    #[arg(long)]
    until_ms: Option<u64>,
    /// Keep only the most recent N records.
    #[arg(long)]
    limit: Option<usize>,
    /// Print stream statistics for the last N seconds instead of exporting.
    #[arg(long, value_name = "SECS")]
    stats: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(kind) = &args.kind {
        if !EventKind::NAMES.contains(&kind.as_str()) {
            return Err(anyhow!(
                "unknown event kind '{}' (expected one of {})",
                kind,
                EventKind::NAMES.join(", ")
            ));
        }
    }
    let store = SqliteEventStore::open(&args.db_path)?;

    if let Some(window_secs) = args.stats {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let since_ms = now_ms.saturating_sub(window_secs.saturating_mul(1000));
        let stats = stream_stats(&store, args.stream, since_ms, now_ms)?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let filter = EventFilter {
        kind: args.kind.clone(),
        since_ms: args.since_ms,
        until_ms: args.until_ms,
        limit: args.limit,
    };
    // Stored newest first; exports read oldest first.
    let mut events = store.read(args.stream, &filter)?;
    events.reverse();

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    match args.format {
        Format::Json => write_json(&events, &mut out)?,
        Format::Csv => write_csv(&events, &mut out)?,
    }
    out.flush()?;

    match &args.output {
        Some(path) => log::info!(
            "exported {} {} events to {}",
            events.len(),
            args.stream,
            path.display()
        ),
        None => log::debug!("exported {} {} events", events.len(), args.stream),
    }
    Ok(())
}
