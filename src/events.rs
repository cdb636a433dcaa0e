//! Event records and the per-stream logger.
//!
//! The logger owns one business type's stream. Writes that fail are kept in
//! a bounded pending buffer and retried, oldest first, on every later `log`
//! or `flush`. The processing loop never waits on storage.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};

use crate::error::LogWriteError;
use crate::profile::BusinessType;
use crate::recommend::{Recommendation, Severity};
use crate::storage::EventStore;
use crate::tracking::{RetiredTrack, Track, TrackId, ZoneTransition};

pub const DEFAULT_PENDING_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    TrackCreated,
    ZoneChanged {
        from: Option<String>,
    },
    TrackRetired {
        dwell_secs: f64,
        last_seen_ms: u64,
    },
    Alert {
        severity: Severity,
        message: String,
        metric: String,
        value: f64,
        threshold: f64,
    },
}

impl EventKind {
    pub const NAMES: [&'static str; 4] = ["track_created", "zone_changed", "track_retired", "alert"];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TrackCreated => "track_created",
            Self::ZoneChanged { .. } => "zone_changed",
            Self::TrackRetired { .. } => "track_retired",
            Self::Alert { .. } => "alert",
        }
    }
}

/// One append-only record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_ms: u64,
    pub business_type: BusinessType,
    /// Track label, or `"alert"` for alert records.
    pub object_type: String,
    pub confidence: f32,
    /// Zone at the time of the event (the new zone for `zone_changed`).
    pub zone: Option<String>,
    pub track_id: Option<TrackId>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn track_created(business_type: BusinessType, track: &Track) -> Self {
        Self {
            timestamp_ms: track.first_seen,
            business_type,
            object_type: track.label.clone(),
            confidence: track.confidence,
            zone: track.current_zone.clone(),
            track_id: Some(track.id),
            kind: EventKind::TrackCreated,
        }
    }

    pub fn zone_changed(business_type: BusinessType, transition: &ZoneTransition, confidence: f32) -> Self {
        Self {
            timestamp_ms: transition.timestamp_ms,
            business_type,
            object_type: transition.label.clone(),
            confidence,
            zone: transition.to.clone(),
            track_id: Some(transition.track_id),
            kind: EventKind::ZoneChanged {
                from: transition.from.clone(),
            },
        }
    }

    /// Stamped with the retiring frame's time, which is never earlier than
    /// anything already written to the stream.
    pub fn track_retired(business_type: BusinessType, retired: &RetiredTrack, timestamp_ms: u64) -> Self {
        let track = &retired.track;
        Self {
            timestamp_ms: timestamp_ms.max(track.last_seen),
            business_type,
            object_type: track.label.clone(),
            confidence: track.confidence,
            zone: track.current_zone.clone(),
            track_id: Some(track.id),
            kind: EventKind::TrackRetired {
                dwell_secs: retired.dwell_secs(),
                last_seen_ms: track.last_seen,
            },
        }
    }

    pub fn alert(business_type: BusinessType, timestamp_ms: u64, rec: &Recommendation) -> Self {
        Self {
            timestamp_ms,
            business_type,
            object_type: "alert".to_string(),
            confidence: 1.0,
            zone: None,
            track_id: None,
            kind: EventKind::Alert {
                severity: rec.severity,
                message: rec.message.clone(),
                metric: rec.metric_reference.clone(),
                value: rec.value,
                threshold: rec.threshold,
            },
        }
    }
}

/// Read-side selection. All bounds are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kind: Option<String>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = &self.kind {
            if event.kind.name() != kind {
                return false;
            }
        }
        if self.since_ms.is_some_and(|since| event.timestamp_ms < since) {
            return false;
        }
        if self.until_ms.is_some_and(|until| event.timestamp_ms > until) {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub written: u64,
    /// Records evicted from a full pending buffer.
    pub dropped: u64,
    /// Records still pending when the stream closed.
    pub lost: usize,
}

pub struct EventLogger {
    stream: BusinessType,
    store: Box<dyn EventStore>,
    pending: VecDeque<Event>,
    capacity: usize,
    written: u64,
    dropped: u64,
    closed: bool,
}

impl EventLogger {
    pub fn new(stream: BusinessType, store: Box<dyn EventStore>) -> Self {
        Self::with_capacity(stream, store, DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_capacity(stream: BusinessType, store: Box<dyn EventStore>, capacity: usize) -> Self {
        Self {
            stream,
            store,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            written: 0,
            dropped: 0,
            closed: false,
        }
    }

    pub fn stream(&self) -> BusinessType {
        self.stream
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue `event` behind any pending records and try to write them all.
    ///
    /// An `Err` from the store means the record is buffered, not lost.
    pub fn log(&mut self, event: Event) -> Result<(), LogWriteError> {
        if self.closed {
            return Err(LogWriteError::Closed(self.stream.to_string()));
        }
        if event.business_type != self.stream {
            return Err(LogWriteError::WrongStream {
                stream: self.stream.to_string(),
                event: event.business_type.to_string(),
            });
        }
        if self.pending.len() >= self.capacity {
            if let Some(evicted) = self.pending.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "{} event buffer full; dropping {} at {} ms ({} dropped so far)",
                    self.stream,
                    evicted.kind.name(),
                    evicted.timestamp_ms,
                    self.dropped
                );
            }
        }
        self.pending.push_back(event);
        self.flush().map(|_| ())
    }

    /// Write pending records in order. Stops at the first failure.
    pub fn flush(&mut self) -> Result<usize, LogWriteError> {
        let mut flushed = 0;
        while let Some(event) = self.pending.front() {
            if let Err(err) = self.store.append(event) {
                log::warn!(
                    "{} event write failed ({} pending): {}",
                    self.stream,
                    self.pending.len(),
                    err
                );
                return Err(err);
            }
            self.pending.pop_front();
            self.written += 1;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Final flush. Later `log` calls fail with `LogWriteError::Closed`.
    pub fn close(&mut self) -> CloseReport {
        if !self.closed {
            // A failure here is reported through `lost`.
            let _ = self.flush();
            self.closed = true;
            if !self.pending.is_empty() {
                log::warn!(
                    "{} stream closed with {} unwritten events",
                    self.stream,
                    self.pending.len()
                );
            }
        }
        CloseReport {
            written: self.written,
            dropped: self.dropped,
            lost: self.pending.len(),
        }
    }

    pub fn read(&self, filter: &EventFilter) -> Result<Vec<Event>, LogWriteError> {
        self.store.read(self.stream, filter)
    }

    pub fn stats(&self, since_ms: u64, until_ms: u64) -> Result<StreamStats, LogWriteError> {
        stream_stats(self.store.as_ref(), self.stream, since_ms, until_ms)
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Statistics and export
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamStats {
    pub stream: BusinessType,
    pub since_ms: u64,
    pub until_ms: u64,
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    /// Mean confidence over track records; alerts are excluded.
    pub avg_confidence: f64,
}

pub fn stream_stats(
    store: &dyn EventStore,
    stream: BusinessType,
    since_ms: u64,
    until_ms: u64,
) -> Result<StreamStats, LogWriteError> {
    let events = store.read(
        stream,
        &EventFilter {
            since_ms: Some(since_ms),
            until_ms: Some(until_ms),
            ..EventFilter::default()
        },
    )?;

    let mut by_kind: BTreeMap<String, u64> = EventKind::NAMES
        .iter()
        .map(|name| (name.to_string(), 0))
        .collect();
    let mut confidence_sum = 0.0;
    let mut confidence_n = 0u64;
    for event in &events {
        *by_kind.entry(event.kind.name().to_string()).or_insert(0) += 1;
        if event.track_id.is_some() {
            confidence_sum += f64::from(event.confidence);
            confidence_n += 1;
        }
    }

    Ok(StreamStats {
        stream,
        since_ms,
        until_ms,
        total: events.len() as u64,
        by_kind,
        avg_confidence: if confidence_n == 0 {
            0.0
        } else {
            confidence_sum / confidence_n as f64
        },
    })
}

/// RFC 3339 UTC rendering of an epoch-millisecond timestamp.
pub fn format_timestamp(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[derive(Serialize)]
struct ExportRecord<'a> {
    datetime: String,
    #[serde(flatten)]
    event: &'a Event,
}

pub fn write_json<W: Write>(events: &[Event], mut out: W) -> io::Result<()> {
    let records: Vec<ExportRecord<'_>> = events
        .iter()
        .map(|event| ExportRecord {
            datetime: format_timestamp(event.timestamp_ms),
            event,
        })
        .collect();
    serde_json::to_writer_pretty(&mut out, &records)?;
    writeln!(out)
}

pub const CSV_HEADER: &str =
    "timestamp_ms,datetime,business_type,kind,object_type,confidence,zone,track_id,detail";

pub fn write_csv<W: Write>(events: &[Event], mut out: W) -> io::Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for event in events {
        let detail = match &event.kind {
            EventKind::TrackCreated => String::new(),
            kind => serde_json::to_string(kind)?,
        };
        writeln!(
            out,
            "{},{},{},{},{},{:.3},{},{},{}",
            event.timestamp_ms,
            format_timestamp(event.timestamp_ms),
            event.business_type,
            event.kind.name(),
            csv_field(&event.object_type),
            event.confidence,
            csv_field(event.zone.as_deref().unwrap_or("")),
            event.track_id.map(|id| id.0.to_string()).unwrap_or_default(),
            csv_field(&detail)
        )?;
    }
    Ok(())
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
