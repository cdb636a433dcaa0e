//! log_verify - verify the hash chain of every event stream
//!
//! Each business type has its own chain. A record that was edited, removed
//! or moved breaks the chain at that point and the tool exits non-zero.

use anyhow::{anyhow, Result};
use clap::Parser;

use zonewatch::{BusinessType, EventStore, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(name = "log_verify", about = "Verify zonewatch event log integrity (hash chain)")]
struct Args {
    /// Path to the zonewatch SQLite DB
    #[arg(long, default_value = "zonewatch.db", env = "ZONEWATCH_DB_PATH")]
    db: String,

    /// Only verify this business type's stream
    #[arg(long, value_name = "BUSINESS")]
    stream: Option<BusinessType>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if !std::path::Path::new(&args.db).exists() {
        return Err(anyhow!("database {} does not exist", args.db));
    }
    let store = SqliteEventStore::open(&args.db)?;

    println!("log_verify: checking {}", args.db);
    println!();

    let streams: Vec<BusinessType> = match args.stream {
        Some(stream) => vec![stream],
        None => BusinessType::ALL.to_vec(),
    };

    let mut failures = 0;
    for stream in streams {
        match store.verify_stream(stream) {
            Ok(report) => {
                println!("{:<12} OK   {} entries", stream.as_str(), report.entries);
                if args.verbose && report.entries > 0 {
                    println!("{:<12}      head {}", "", hex::encode(report.head));
                }
            }
            Err(e) => {
                failures += 1;
                println!("{:<12} FAIL {}", stream.as_str(), e);
            }
        }
    }

    println!();
    if failures > 0 {
        return Err(anyhow!("{} stream(s) failed verification", failures));
    }
    println!("all streams verified");
    Ok(())
}
