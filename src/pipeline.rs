//! Per-source processing.
//!
//! `SourceProcessor` runs the synchronous per-frame chain
//! (tracker, zones, aggregator, logger, alert edges) and owns all state of
//! one source. `spawn_source` wraps it in a capture thread and a processing
//! thread joined by a `FrameSlot`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::{Detection, DetectorBackend};
use crate::error::{ConfigurationError, LogWriteError, SourceError};
use crate::events::{CloseReport, Event, EventLogger};
use crate::frame::{Frame, FrameSlot, SlotTake};
use crate::ingest::FrameSource;
use crate::metrics::{FrameObservation, MetricsAggregator, MetricsSnapshot};
use crate::profile::{BusinessProfile, BusinessType};
use crate::recommend::recommend;
use crate::tracking::{Track, TrackManager};
use crate::zones::ZoneClassifier;

const SLOT_WAIT: Duration = Duration::from_millis(200);
const HEALTH_LOG_EVERY: Duration = Duration::from_secs(5);

pub struct SourceProcessor {
    source_id: String,
    profile: Arc<BusinessProfile>,
    tracker: TrackManager,
    zones: ZoneClassifier,
    aggregator: MetricsAggregator,
    logger: EventLogger,
    /// `(metric, message)` of rules that fired on the last good frame.
    active_alerts: BTreeSet<(String, String)>,
    last_snapshot: Option<Arc<MetricsSnapshot>>,
    last_timestamp_ms: u64,
    frames_processed: u64,
}

impl SourceProcessor {
    pub fn new(
        source_id: &str,
        profile: Arc<BusinessProfile>,
        logger: EventLogger,
    ) -> Result<Self, ConfigurationError> {
        if logger.stream() != profile.business_type {
            return Err(ConfigurationError::InvalidSource(format!(
                "{}: logger stream {} does not match profile {}",
                source_id,
                logger.stream(),
                profile.business_type
            )));
        }
        let zones = profile.zone_classifier()?;
        Ok(Self {
            source_id: source_id.to_string(),
            tracker: TrackManager::new(profile.tracker_config()),
            aggregator: MetricsAggregator::new(Arc::clone(&profile), source_id),
            zones,
            profile,
            logger,
            active_alerts: BTreeSet::new(),
            last_snapshot: None,
            last_timestamp_ms: 0,
            frames_processed: 0,
        })
    }

    pub fn business_type(&self) -> BusinessType {
        self.profile.business_type
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn tracker(&self) -> &TrackManager {
        &self.tracker
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    /// Last published snapshot, or an all-zero one before the first frame.
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        match &self.last_snapshot {
            Some(snapshot) => Arc::clone(snapshot),
            None => Arc::new(self.aggregator.zero_snapshot()),
        }
    }

    /// Run the detector on `frame` and fold the result in.
    ///
    /// A detector failure skips the frame: tracks are not aged and the last
    /// good snapshot is republished with `stale` set.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        backend: &mut dyn DetectorBackend,
    ) -> Arc<MetricsSnapshot> {
        match backend.detect(frame) {
            Ok(detections) => self.process_detections(frame.seq, frame.timestamp_ms, detections),
            Err(e) => {
                log::warn!(
                    "{}: frame {} skipped ({}): {}",
                    self.source_id,
                    frame.seq,
                    backend.name(),
                    e
                );
                self.aggregator.record_failure();
                let mut stale = self.snapshot().as_ref().clone();
                stale.stale = true;
                stale.frames_failed = self.aggregator.frames_failed();
                let stale = Arc::new(stale);
                self.last_snapshot = Some(Arc::clone(&stale));
                stale
            }
        }
    }

    pub fn process_detections(
        &mut self,
        frame_seq: u64,
        timestamp_ms: u64,
        detections: Vec<Detection>,
    ) -> Arc<MetricsSnapshot> {
        let business = self.profile.business_type;
        let detections = self.profile.normalize_detections(detections);
        let update = self.tracker.update(timestamp_ms, &detections);
        let now = timestamp_ms.max(self.last_timestamp_ms);
        self.last_timestamp_ms = now;
        if update.rejected > 0 {
            log::trace!(
                "{}: frame {} rejected {} detections",
                self.source_id,
                frame_seq,
                update.rejected
            );
        }

        let mut transitions = Vec::new();
        for (track, is_new) in &update.tracks {
            let zone = self.zones.classify(&track.last_bbox);
            let transition = self.tracker.assign_zone(track.id, zone, now);
            if *is_new {
                let created = self
                    .tracker
                    .get(track.id)
                    .map(|current| Event::track_created(business, current));
                if let Some(event) = created {
                    self.record(event);
                }
            } else if let Some(t) = &transition {
                self.record(Event::zone_changed(business, t, track.confidence));
            }
            transitions.extend(transition);
        }
        for retired in &update.retired {
            self.record(Event::track_retired(business, retired, now));
        }

        let confidences: Vec<f32> = update.tracks.iter().map(|(t, _)| t.confidence).collect();
        let live: Vec<&Track> = self.tracker.live_tracks().collect();
        let snapshot = self.aggregator.ingest(FrameObservation {
            frame_seq,
            timestamp_ms: now,
            live: &live,
            confidences: &confidences,
            retired: &update.retired,
            transitions: &transitions,
        });
        self.frames_processed += 1;
        self.publish(snapshot)
    }

    /// Retire every live track and close the event stream.
    pub fn finish(&mut self) -> (Arc<MetricsSnapshot>, CloseReport) {
        let business = self.profile.business_type;
        let retired = self.tracker.retire_all();
        let now = self.last_timestamp_ms;
        for r in &retired {
            self.record(Event::track_retired(business, r, now));
        }
        let last = self.snapshot();
        let snapshot = self.aggregator.ingest(FrameObservation {
            frame_seq: last.frame_seq,
            timestamp_ms: self.last_timestamp_ms,
            live: &[],
            confidences: &[],
            retired: &retired,
            transitions: &[],
        });
        let snapshot = self.publish(snapshot);
        let report = self.logger.close();
        log::info!(
            "{}: closed {} stream: {} frames, {} tracks retired, {} events written, {} dropped, {} lost",
            self.source_id,
            business,
            self.frames_processed,
            retired.len(),
            report.written,
            report.dropped,
            report.lost
        );
        (snapshot, report)
    }

    /// Log alert edges and store the snapshot.
    fn publish(&mut self, snapshot: MetricsSnapshot) -> Arc<MetricsSnapshot> {
        let business = self.profile.business_type;
        let recs = recommend(&snapshot, &self.profile.recommendations);
        let mut firing = BTreeSet::new();
        for rec in &recs {
            let key = (rec.metric_reference.clone(), rec.message.clone());
            if !self.active_alerts.contains(&key) {
                log::info!(
                    "{}: {} alert: {} ({}={} threshold {})",
                    self.source_id,
                    rec.severity,
                    rec.message,
                    rec.metric_reference,
                    rec.value,
                    rec.threshold
                );
                self.record(Event::alert(business, snapshot.timestamp_ms, rec));
            }
            firing.insert(key);
        }
        self.active_alerts = firing;

        let snapshot = Arc::new(snapshot);
        self.last_snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn record(&mut self, event: Event) {
        match self.logger.log(event) {
            Ok(()) => {}
            Err(e @ (LogWriteError::Closed(_) | LogWriteError::WrongStream { .. })) => {
                log::warn!("{}: event refused: {}", self.source_id, e);
            }
            Err(e) => log::debug!("{}: event buffered: {}", self.source_id, e),
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot board
// ----------------------------------------------------------------------------

/// Latest snapshot per business type, published by replacement.
#[derive(Clone, Debug, Default)]
pub struct SnapshotBoard {
    inner: Arc<RwLock<HashMap<BusinessType, Arc<MetricsSnapshot>>>>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: Arc<MetricsSnapshot>) {
        let mut board = self.inner.write().unwrap_or_else(|p| p.into_inner());
        board.insert(snapshot.business_type, snapshot);
    }

    pub fn get(&self, business: BusinessType) -> Option<Arc<MetricsSnapshot>> {
        let board = self.inner.read().unwrap_or_else(|p| p.into_inner());
        board.get(&business).cloned()
    }
}

// ----------------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Starting,
    Running,
    /// Finite source reached its end.
    Ended,
    Failed(String),
    Stopped,
}

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_) | Self::Stopped)
    }
}

/// Running source. Dropping the handle stops it.
pub struct SourceHandle {
    id: String,
    business: BusinessType,
    stop: Arc<AtomicBool>,
    slot: Arc<FrameSlot>,
    status: Arc<Mutex<SourceStatus>>,
    worker: Option<JoinHandle<Option<CloseReport>>>,
}

impl SourceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn business_type(&self) -> BusinessType {
        self.business
    }

    pub fn status(&self) -> SourceStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn frames_skipped(&self) -> u64 {
        self.slot.skipped()
    }

    /// Block until the source reaches a terminal state on its own.
    pub fn wait(&mut self) -> Option<CloseReport> {
        self.worker.take().and_then(|w| w.join().ok()).flatten()
    }

    /// Stop before the next pending frame, join both threads, retire tracks
    /// and close the stream.
    pub fn stop(&mut self) -> Option<CloseReport> {
        self.stop.store(true, Ordering::SeqCst);
        self.slot.close();
        self.wait()
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn set_status(status: &Mutex<SourceStatus>, next: SourceStatus) {
    *status.lock().unwrap_or_else(|p| p.into_inner()) = next;
}

/// Start capture and processing threads for one source.
pub fn spawn_source(
    id: &str,
    mut source: Box<dyn FrameSource>,
    mut backend: Box<dyn DetectorBackend>,
    mut processor: SourceProcessor,
    board: SnapshotBoard,
) -> std::io::Result<SourceHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(FrameSlot::new());
    let status = Arc::new(Mutex::new(SourceStatus::Starting));
    let business = processor.business_type();
    board.publish(processor.snapshot());

    let worker = {
        let id = id.to_string();
        let stop = Arc::clone(&stop);
        let slot = Arc::clone(&slot);
        let status = Arc::clone(&status);
        thread::Builder::new()
            .name(format!("zw-proc-{}", id))
            .spawn(move || {
                if let Err(e) = source.connect() {
                    log::error!("{}: connect failed: {}", id, e);
                    set_status(&status, SourceStatus::Failed(e.to_string()));
                    let (snapshot, report) = processor.finish();
                    board.publish(snapshot);
                    return Some(report);
                }
                if let Err(e) = backend.warm_up() {
                    log::warn!("{}: detector warm-up failed: {}", id, e);
                }

                let capture = {
                    let id = id.clone();
                    let stop = Arc::clone(&stop);
                    let slot = Arc::clone(&slot);
                    thread::Builder::new()
                        .name(format!("zw-cap-{}", id))
                        .spawn(move || capture_loop(&id, source.as_mut(), &slot, &stop))
                };
                let capture = match capture {
                    Ok(handle) => handle,
                    Err(e) => {
                        set_status(&status, SourceStatus::Failed(e.to_string()));
                        let (snapshot, report) = processor.finish();
                        board.publish(snapshot);
                        return Some(report);
                    }
                };

                set_status(&status, SourceStatus::Running);
                log::info!("{}: running ({} profile, {} detector)", id, business, backend.name());
                let mut last_health_log = Instant::now();
                loop {
                    if stop.load(Ordering::SeqCst) {
                        slot.discard();
                        break;
                    }
                    match slot.take(SLOT_WAIT) {
                        SlotTake::Frame(frame) => {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            let snapshot = processor.process_frame(&frame, backend.as_mut());
                            board.publish(snapshot);
                        }
                        SlotTake::Empty => {}
                        SlotTake::Closed => break,
                    }
                    if last_health_log.elapsed() >= HEALTH_LOG_EVERY {
                        log::info!(
                            "{}: frames processed={} skipped={} live tracks={}",
                            id,
                            processor.frames_processed(),
                            slot.skipped(),
                            processor.tracker().live_count()
                        );
                        last_health_log = Instant::now();
                    }
                }

                slot.close();
                let outcome = capture
                    .join()
                    .unwrap_or_else(|_| Err(SourceError::Decode("capture thread panicked".into())));
                let (snapshot, report) = processor.finish();
                board.publish(snapshot);

                let next = if stop.load(Ordering::SeqCst) {
                    SourceStatus::Stopped
                } else {
                    match outcome {
                        Ok(()) => SourceStatus::Ended,
                        Err(e) => {
                            log::error!("{}: source failed: {}", id, e);
                            SourceStatus::Failed(e.to_string())
                        }
                    }
                };
                log::info!("{}: {:?}", id, next);
                set_status(&status, next);
                Some(report)
            })?
    };

    Ok(SourceHandle {
        id: id.to_string(),
        business,
        stop,
        slot,
        status,
        worker: Some(worker),
    })
}

/// Pull frames into the slot until end of stream, failure or stop.
fn capture_loop(
    id: &str,
    source: &mut dyn FrameSource,
    slot: &FrameSlot,
    stop: &AtomicBool,
) -> Result<(), SourceError> {
    let mut last_health_log = Instant::now();
    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                if !slot.put(frame) {
                    break Ok(());
                }
            }
            Ok(None) => {
                log::info!("{}: end of stream", id);
                break Ok(());
            }
            Err(e) => break Err(e),
        }
        if last_health_log.elapsed() >= HEALTH_LOG_EVERY {
            let stats = source.stats();
            log::debug!(
                "{}: source health={} frames={} location={}",
                id,
                source.is_healthy(),
                stats.frames_captured,
                stats.location
            );
            last_health_log = Instant::now();
        }
    };
    slot.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, ScriptedBackend};
    use crate::events::EventKind;
    use crate::ingest::{SyntheticConfig, SyntheticSource};
    use crate::storage::InMemoryEventStore;

    fn pharmacy() -> Arc<BusinessProfile> {
        Arc::new(BusinessProfile::builtin(BusinessType::Pharmacy).unwrap())
    }

    fn processor(store: &InMemoryEventStore) -> SourceProcessor {
        let logger = EventLogger::new(BusinessType::Pharmacy, Box::new(store.clone()));
        SourceProcessor::new("counter-cam", pharmacy(), logger).unwrap()
    }

    fn person(x: f32) -> Detection {
        Detection::new("person", 0.9, BBox::new(x, 0.3, x + 0.1, 0.7))
    }

    #[test]
    fn zone_change_is_logged_once() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        // queue spans x 0.2..0.7, counter 0.7..1.0
        proc.process_detections(1, 1_000, vec![person(0.58)]);
        proc.process_detections(2, 1_100, vec![person(0.61)]);
        proc.process_detections(3, 1_200, vec![person(0.64)]);
        let snap = proc.process_detections(4, 1_300, vec![person(0.66)]);
        assert_eq!(snap.density_by_zone["counter"], 1);
        assert_eq!(snap.density_by_zone["queue"], 0);

        let kinds: Vec<EventKind> = store
            .events(BusinessType::Pharmacy)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TrackCreated,
                EventKind::ZoneChanged {
                    from: Some("queue".to_string())
                }
            ]
        );
        assert_eq!(snap.zone_transitions.get("queue->counter"), Some(&1));
    }

    #[test]
    fn detector_failure_republishes_stale_snapshot() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        let mut backend = ScriptedBackend::empty()
            .with_frame(1, vec![person(0.3)])
            .with_failure_at(2);

        let good = proc.process_frame(&Frame::blank(1, 1_000), &mut backend);
        assert!(!good.stale);
        let stale = proc.process_frame(&Frame::blank(2, 1_100), &mut backend);
        assert!(stale.stale);
        assert_eq!(stale.frames_failed, 1);
        assert_eq!(stale.total_live, good.total_live);
        assert_eq!(stale.frame_seq, 1);
        assert_eq!(proc.tracker().live_tracks().next().map(|t| t.missed_frames), Some(0));

        let next = proc.process_frame(&Frame::blank(3, 1_200), &mut backend);
        assert!(!next.stale);
    }

    #[test]
    fn alerts_are_edge_triggered() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        // queue_length > 4 fires a critical rule in the pharmacy profile
        let crowd: Vec<Detection> = (0..5)
            .map(|i| Detection::new("person", 0.9, BBox::new(0.25, 0.1 * i as f32 + 0.01, 0.35, 0.1 * i as f32 + 0.09)))
            .collect();
        proc.process_detections(1, 1_000, crowd.clone());
        proc.process_detections(2, 1_100, crowd.clone());
        proc.process_detections(3, 1_200, Vec::new());
        let alerts = |store: &InMemoryEventStore| {
            store
                .events(BusinessType::Pharmacy)
                .into_iter()
                .filter(|e| matches!(&e.kind, EventKind::Alert { metric, .. } if metric == "queue_length"))
                .count()
        };
        assert_eq!(alerts(&store), 1);

        for seq in 4..12 {
            proc.process_detections(seq, 1_000 + seq * 100, Vec::new());
        }
        proc.process_detections(20, 3_000, crowd);
        assert_eq!(alerts(&store), 2);
    }

    #[test]
    fn finish_retires_everything_and_closes() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        proc.process_detections(1, 1_000, vec![person(0.3), person(0.75)]);
        let (snap, report) = proc.finish();
        assert_eq!(snap.total_live, 0);
        assert_eq!(report.lost, 0);
        let retired = store
            .events(BusinessType::Pharmacy)
            .into_iter()
            .filter(|e| e.kind.name() == "track_retired")
            .count();
        assert_eq!(retired, 2);
    }

    #[test]
    fn events_after_close_are_refused_not_buffered() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        proc.process_detections(1, 1_000, vec![person(0.3)]);
        proc.finish();
        let written = store.len(BusinessType::Pharmacy);

        proc.process_detections(2, 2_000, vec![person(0.8)]);
        assert_eq!(proc.logger().pending(), 0);
        assert_eq!(store.len(BusinessType::Pharmacy), written);
    }

    #[test]
    fn store_outage_buffers_events() {
        let store = InMemoryEventStore::new();
        let mut proc = processor(&store);
        store.set_offline(true);
        proc.process_detections(1, 1_000, vec![person(0.3)]);
        assert_eq!(proc.logger().pending(), 1);

        store.set_offline(false);
        proc.process_detections(2, 1_100, vec![person(0.31)]);
        assert_eq!(proc.logger().pending(), 0);
        assert_eq!(store.len(BusinessType::Pharmacy), 1);
    }

    #[test]
    fn mismatched_logger_stream_is_a_configuration_error() {
        let logger = EventLogger::new(BusinessType::Retail, Box::new(InMemoryEventStore::new()));
        assert!(SourceProcessor::new("cam", pharmacy(), logger).is_err());
    }

    #[test]
    fn finite_source_runs_to_end() {
        let store = InMemoryEventStore::new();
        let proc = processor(&store);
        let config = SyntheticConfig::from_url("stub://cam?frames=20&fps=100", 10).unwrap();
        let source = Box::new(SyntheticSource::new(config));
        let backend = Box::new(ScriptedBackend::repeating(1..=20, vec![person(0.3)]));
        let board = SnapshotBoard::new();

        let mut handle = spawn_source("cam", source, backend, proc, board.clone()).unwrap();
        let report = handle.wait().unwrap();
        assert_eq!(handle.status(), SourceStatus::Ended);
        assert_eq!(report.lost, 0);

        let snap = board.get(BusinessType::Pharmacy).unwrap();
        assert_eq!(snap.total_live, 0);
        let events = store.events(BusinessType::Pharmacy);
        let created = events.iter().filter(|e| e.kind.name() == "track_created").count();
        let retired = events.iter().filter(|e| e.kind.name() == "track_retired").count();
        assert!(created >= 1);
        assert_eq!(created, retired);
    }

    #[test]
    fn stop_halts_an_endless_source() {
        let store = InMemoryEventStore::new();
        let proc = processor(&store);
        let config = SyntheticConfig::from_url("stub://cam?fps=50", 50).unwrap();
        let source = Box::new(SyntheticSource::new(config));
        let board = SnapshotBoard::new();

        let mut handle =
            spawn_source("cam", source, Box::new(ScriptedBackend::empty()), proc, board).unwrap();
        thread::sleep(Duration::from_millis(100));
        let report = handle.stop();
        assert!(report.is_some());
        assert_eq!(handle.status(), SourceStatus::Stopped);
    }
}
