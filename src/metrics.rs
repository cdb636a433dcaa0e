//! Rolling aggregation of tracked objects into business metrics.
//!
//! The aggregator keeps three time-ordered sample queues (per-frame live
//! counts, dwell times of retired tracks, zone transitions) and evicts
//! anything older than the profile window. Each `ingest` call produces a fresh
//! `MetricsSnapshot`; snapshots are never updated after they are built.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::profile::{BusinessProfile, BusinessType, MetricFormula};
use crate::tracking::{RetiredTrack, Track, ZoneTransition};

/// Point-in-time aggregate for one business type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub business_type: BusinessType,
    pub source_id: String,
    pub frame_seq: u64,
    /// Epoch milliseconds of the frame the snapshot was computed from.
    pub timestamp_ms: u64,
    /// Distinct live tracks per class. Every profile class is present.
    pub counts_by_class: BTreeMap<String, u64>,
    pub avg_dwell_secs: f64,
    /// Live tracks per zone. Every profile zone is present.
    pub density_by_zone: BTreeMap<String, u64>,
    /// Live tracks outside every zone.
    pub unzoned: u64,
    pub total_live: u64,
    /// Profile formulas by name. Every declared metric is present.
    pub derived: BTreeMap<String, f64>,
    /// `"from->to"` transition counts within the window.
    pub zone_transitions: BTreeMap<String, u64>,
    pub window_avg_confidence: f64,
    /// Accepted detections per second within the window.
    pub detection_rate: f64,
    pub frames_in_window: u64,
    /// Frames the detector failed on since the source started.
    pub frames_failed: u64,
    /// Set when the latest frame failed and this is the last good snapshot.
    pub stale: bool,
}

impl MetricsSnapshot {
    pub fn empty(business_type: BusinessType, source_id: &str) -> Self {
        Self {
            business_type,
            source_id: source_id.to_string(),
            frame_seq: 0,
            timestamp_ms: 0,
            counts_by_class: BTreeMap::new(),
            avg_dwell_secs: 0.0,
            density_by_zone: BTreeMap::new(),
            unzoned: 0,
            total_live: 0,
            derived: BTreeMap::new(),
            zone_transitions: BTreeMap::new(),
            window_avg_confidence: 0.0,
            detection_rate: 0.0,
            frames_in_window: 0,
            frames_failed: 0,
            stale: false,
        }
    }

    /// Resolve a metric reference: a derived metric name, `live_tracks`,
    /// `unzoned`, `avg_dwell_secs`, `count.<label>` or `zone.<id>`.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        if let Some(value) = self.derived.get(name) {
            return Some(*value);
        }
        match name {
            "live_tracks" => return Some(self.total_live as f64),
            "unzoned" => return Some(self.unzoned as f64),
            "avg_dwell_secs" => return Some(self.avg_dwell_secs),
            _ => {}
        }
        if let Some(label) = name.strip_prefix("count.") {
            return self.counts_by_class.get(label).map(|v| *v as f64);
        }
        if let Some(zone) = name.strip_prefix("zone.") {
            return self.density_by_zone.get(zone).map(|v| *v as f64);
        }
        None
    }
}

/// Everything the pipeline learned about one frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameObservation<'a> {
    pub frame_seq: u64,
    pub timestamp_ms: u64,
    /// All live tracks after this frame, zones assigned.
    pub live: &'a [&'a Track],
    /// Confidences of the detections accepted this frame.
    pub confidences: &'a [f32],
    pub retired: &'a [RetiredTrack],
    pub transitions: &'a [ZoneTransition],
}

#[derive(Debug)]
struct FrameSample {
    timestamp_ms: u64,
    counts: BTreeMap<String, u64>,
    detections: u64,
    confidence_sum: f64,
}

#[derive(Debug)]
struct DwellSample {
    timestamp_ms: u64,
    label: String,
    secs: f64,
}

#[derive(Debug)]
struct TransitionSample {
    timestamp_ms: u64,
    from: String,
    to: String,
}

pub struct MetricsAggregator {
    profile: Arc<BusinessProfile>,
    source_id: String,
    zone_ids: Vec<String>,
    window_ms: u64,
    frames: VecDeque<FrameSample>,
    dwell: VecDeque<DwellSample>,
    transitions: VecDeque<TransitionSample>,
    frames_failed: u64,
}

impl MetricsAggregator {
    pub fn new(profile: Arc<BusinessProfile>, source_id: &str) -> Self {
        let window_ms = profile.window_secs.saturating_mul(1000);
        let zone_ids = profile
            .zone_classifier()
            .map(|zones| zones.zone_ids().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            profile,
            source_id: source_id.to_string(),
            zone_ids,
            window_ms,
            frames: VecDeque::new(),
            dwell: VecDeque::new(),
            transitions: VecDeque::new(),
            frames_failed: 0,
        }
    }

    pub fn business_type(&self) -> BusinessType {
        self.profile.business_type
    }

    /// Count a frame the detector could not process.
    pub fn record_failure(&mut self) {
        self.frames_failed += 1;
    }

    pub fn frames_failed(&self) -> u64 {
        self.frames_failed
    }

    /// Snapshot with every configured key at zero.
    pub fn zero_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty(self.profile.business_type, &self.source_id);
        for label in self.profile.class_labels() {
            snapshot.counts_by_class.insert(label.to_string(), 0);
        }
        for zone in &self.zone_ids {
            snapshot.density_by_zone.insert(zone.clone(), 0);
        }
        for metric in &self.profile.metrics {
            snapshot.derived.insert(metric.name.clone(), 0.0);
        }
        snapshot.frames_failed = self.frames_failed;
        snapshot
    }

    /// Fold one frame into the window and compute the snapshot.
    pub fn ingest(&mut self, obs: FrameObservation<'_>) -> MetricsSnapshot {
        let now = obs.timestamp_ms;
        self.record(&obs);
        self.evict(now);

        let mut snapshot = self.zero_snapshot();
        snapshot.frame_seq = obs.frame_seq;
        snapshot.timestamp_ms = now;
        snapshot.total_live = obs.live.len() as u64;

        for track in obs.live {
            *snapshot
                .counts_by_class
                .entry(track.label.clone())
                .or_insert(0) += 1;
            match &track.current_zone {
                Some(zone) => {
                    *snapshot.density_by_zone.entry(zone.clone()).or_insert(0) += 1;
                }
                None => snapshot.unzoned += 1,
            }
        }

        snapshot.avg_dwell_secs = self.average_dwell(obs.live, &self.profile.dwell_classes);

        for sample in &self.transitions {
            *snapshot
                .zone_transitions
                .entry(format!("{}->{}", sample.from, sample.to))
                .or_insert(0) += 1;
        }

        let (detections, confidence_sum) = self
            .frames
            .iter()
            .fold((0u64, 0.0f64), |(n, sum), f| (n + f.detections, sum + f.confidence_sum));
        if detections > 0 {
            snapshot.window_avg_confidence = confidence_sum / detections as f64;
        }
        let span_secs = match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => {
                (last.timestamp_ms.saturating_sub(first.timestamp_ms)) as f64 / 1000.0
            }
            _ => 0.0,
        };
        snapshot.detection_rate = detections as f64 / span_secs.max(1.0);
        snapshot.frames_in_window = self.frames.len() as u64;

        for metric in &self.profile.metrics {
            let value = self.evaluate(&metric.formula, obs.live);
            snapshot.derived.insert(metric.name.clone(), value);
        }
        snapshot
    }

    fn record(&mut self, obs: &FrameObservation<'_>) {
        let mut counts = BTreeMap::new();
        for track in obs.live {
            *counts.entry(track.label.clone()).or_insert(0) += 1;
        }
        self.frames.push_back(FrameSample {
            timestamp_ms: obs.timestamp_ms,
            counts,
            detections: obs.confidences.len() as u64,
            confidence_sum: obs.confidences.iter().map(|c| f64::from(*c)).sum(),
        });

        for retired in obs.retired {
            self.dwell.push_back(DwellSample {
                timestamp_ms: obs.timestamp_ms,
                label: retired.track.label.clone(),
                secs: retired.dwell_secs(),
            });
        }

        for transition in obs.transitions {
            if let (Some(from), Some(to)) = (&transition.from, &transition.to) {
                self.transitions.push_back(TransitionSample {
                    timestamp_ms: transition.timestamp_ms,
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
    }

    fn evict(&mut self, now: u64) {
        let window = self.window_ms;
        let expired = |ts: u64| now.saturating_sub(ts) > window;
        while self.frames.front().map_or(false, |s| expired(s.timestamp_ms)) {
            self.frames.pop_front();
        }
        while self.dwell.front().map_or(false, |s| expired(s.timestamp_ms)) {
            self.dwell.pop_front();
        }
        while self
            .transitions
            .front()
            .map_or(false, |s| expired(s.timestamp_ms))
        {
            self.transitions.pop_front();
        }
    }

    fn average_dwell(&self, live: &[&Track], labels: &[String]) -> f64 {
        let wanted = |label: &str| labels.is_empty() || labels.iter().any(|l| l == label);
        let cap = self.profile.max_dwell_secs.unwrap_or(f64::INFINITY);

        let retired = self
            .dwell
            .iter()
            .filter(|s| wanted(&s.label))
            .map(|s| s.secs);
        let current = live
            .iter()
            .filter(|t| wanted(&t.label))
            .map(|t| t.dwell_secs());

        let (n, sum) = retired
            .chain(current)
            .filter(|secs| *secs <= cap)
            .fold((0u64, 0.0f64), |(n, sum), secs| (n + 1, sum + secs));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    fn evaluate(&self, formula: &MetricFormula, live: &[&Track]) -> f64 {
        let matches = |labels: &[String], label: &str| {
            labels.is_empty() || labels.iter().any(|l| l == label)
        };
        match formula {
            MetricFormula::ClassCount { labels } => {
                live.iter().filter(|t| matches(labels, &t.label)).count() as f64
            }
            MetricFormula::ZoneCount { zone, labels } => live
                .iter()
                .filter(|t| t.current_zone.as_deref() == Some(zone.as_str()))
                .filter(|t| matches(labels, &t.label))
                .count() as f64,
            MetricFormula::Occupancy { labels, capacity } => {
                let count = live.iter().filter(|t| matches(labels, &t.label)).count() as f64;
                match capacity.or(self.profile.capacity) {
                    Some(c) if c > 0 => count / f64::from(c),
                    _ => 0.0,
                }
            }
            MetricFormula::AverageDwell { labels } => self.average_dwell(live, labels),
            MetricFormula::WindowPeak { labels } => self
                .frames
                .iter()
                .map(|f| frame_total(f, labels))
                .max()
                .unwrap_or(0) as f64,
            MetricFormula::WindowAverage { labels } => {
                if self.frames.is_empty() {
                    0.0
                } else {
                    let sum: u64 = self.frames.iter().map(|f| frame_total(f, labels)).sum();
                    sum as f64 / self.frames.len() as f64
                }
            }
            MetricFormula::ZoneTransitions { from, to } => self
                .transitions
                .iter()
                .filter(|s| from.as_deref().map_or(true, |z| z == s.from))
                .filter(|s| to.as_deref().map_or(true, |z| z == s.to))
                .count() as f64,
        }
    }
}

fn frame_total(sample: &FrameSample, labels: &[String]) -> u64 {
    sample
        .counts
        .iter()
        .filter(|(label, _)| labels.is_empty() || labels.iter().any(|l| l == *label))
        .map(|(_, n)| *n)
        .sum()
}
