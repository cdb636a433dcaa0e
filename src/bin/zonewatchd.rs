//! zonewatchd - detection-to-metrics daemon
//!
//! This daemon:
//! 1. Loads business profiles and detector backends from configuration
//! 2. Starts one processing loop per configured source
//! 3. Writes track and alert events to the hash-chained event store
//! 4. Periodically logs the current snapshot and recommendations
//! 5. Stops every source cleanly on Ctrl-C or when all finite sources end

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use zonewatch::config::DaemonConfig;
use zonewatch::Engine;

#[derive(Parser, Debug)]
#[command(name = "zonewatchd", version, about = "Zonewatch detection-to-metrics daemon")]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "ZONEWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between snapshot reports.
    #[arg(long, default_value_t = 10)]
    report_secs: u64,
    /// Print the final snapshots as JSON on exit.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = DaemonConfig::load_from(args.config.as_deref())?;
    let engine = Engine::with_sqlite(cfg.profiles()?, cfg.backends()?, &cfg.db_path);

    for source in &cfg.sources {
        engine.start_source(source)?;
    }
    log::info!(
        "zonewatchd running. {} source(s), writing to {}",
        cfg.sources.len(),
        cfg.db_path
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    let report_every = Duration::from_secs(args.report_secs.max(1));
    let mut last_report = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping sources...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if engine.all_finished() {
            log::info!("all sources finished");
            break;
        }
        if last_report.elapsed() >= report_every {
            report(&engine, &cfg)?;
            last_report = Instant::now();
        }
    }

    engine.stop_all();
    for info in engine.active_sources() {
        log::info!(
            "source '{}' ({}): {:?}, {} frames skipped",
            info.id,
            info.business_type,
            info.status,
            info.frames_skipped
        );
    }
    report(&engine, &cfg)?;
    if args.json {
        for source in &cfg.sources {
            let snapshot = engine.current_snapshot(source.business_type)?;
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        }
    }
    Ok(())
}

fn report(engine: &Engine, cfg: &DaemonConfig) -> Result<()> {
    for source in &cfg.sources {
        let snapshot = engine.current_snapshot(source.business_type)?;
        log::info!(
            "{}: frame={} live={} unzoned={} avg_dwell={:.1}s stale={} zones={:?}",
            snapshot.business_type,
            snapshot.frame_seq,
            snapshot.total_live,
            snapshot.unzoned,
            snapshot.avg_dwell_secs,
            snapshot.stale,
            snapshot.density_by_zone
        );
        for rec in engine.recommendations(source.business_type)? {
            log::warn!(
                "{} [{}] {} ({}={:.2}, threshold {})",
                snapshot.business_type,
                rec.severity,
                rec.message,
                rec.metric_reference,
                rec.value,
                rec.threshold
            );
        }
    }
    Ok(())
}
