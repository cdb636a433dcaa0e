//! Short-lived object identity across frames.
//!
//! Tracks live in an arena keyed by a monotonically increasing id. Each frame,
//! detections are matched to live tracks by bbox overlap: every candidate pair
//! above `min_iou` is ranked by score and assigned greedily, highest first.
//! Unmatched detections open new tracks; tracks that go unmatched for more
//! than `max_missed` consecutive frames are retired.
//!
//! Identity is best-effort. An object that is occluded for longer than the
//! miss budget, or that moves further than its own width between frames, comes
//! back as a new track. Under heavy occlusion this over- or undercounts
//! distinct objects, and that is inherent to overlap matching.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::detect::{BBox, Detection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `New -> Tracked -> Retired`. Retired is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Opened this frame.
    New,
    /// Matched on at least one later frame.
    Tracked,
    Retired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub label: String,
    /// Confidence of the latest matched detection.
    pub confidence: f32,
    /// Epoch milliseconds.
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_bbox: BBox,
    pub current_zone: Option<String>,
    /// Zones entered, in order. Timestamps never decrease.
    pub zone_history: Vec<(String, u64)>,
    pub missed_frames: u32,
    pub hits: u32,
    pub state: TrackState,
}

impl Track {
    fn open(id: TrackId, detection: &Detection, timestamp_ms: u64) -> Self {
        Self {
            id,
            label: detection.label.clone(),
            confidence: detection.confidence,
            first_seen: timestamp_ms,
            last_seen: timestamp_ms,
            last_bbox: detection.bbox,
            current_zone: None,
            zone_history: Vec::new(),
            missed_frames: 0,
            hits: 1,
            state: TrackState::New,
        }
    }

    /// Observed lifetime so far, in milliseconds.
    pub fn dwell_ms(&self) -> u64 {
        self.last_seen.saturating_sub(self.first_seen)
    }

    pub fn dwell_secs(&self) -> f64 {
        self.dwell_ms() as f64 / 1000.0
    }

    pub fn is_live(&self) -> bool {
        self.state != TrackState::Retired
    }
}

/// A track removed from the arena, with its final dwell time.
#[derive(Clone, Debug, PartialEq)]
pub struct RetiredTrack {
    pub track: Track,
    /// `last_seen - first_seen` at retirement.
    pub dwell_ms: u64,
}

impl RetiredTrack {
    fn from_track(mut track: Track) -> Self {
        track.state = TrackState::Retired;
        let dwell_ms = track.dwell_ms();
        Self { track, dwell_ms }
    }

    pub fn dwell_secs(&self) -> f64 {
        self.dwell_ms as f64 / 1000.0
    }
}

/// Zone change of a live track.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneTransition {
    pub track_id: TrackId,
    pub label: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Minimum match score for a detection to extend a track.
    pub min_iou: f32,
    /// Detections below this confidence are rejected outright.
    pub min_confidence: f32,
    /// Per-label confidence floors. When non-empty, labels not listed are
    /// rejected.
    pub class_min_confidence: BTreeMap<String, f32>,
    /// A track is retired once it has missed more than this many frames.
    pub max_missed: u32,
    /// Score multiplier for pairs whose labels differ. 0 = labels must match.
    pub label_mismatch_weight: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.3,
            min_confidence: 0.25,
            class_min_confidence: BTreeMap::new(),
            max_missed: 5,
            label_mismatch_weight: 0.0,
        }
    }
}

impl TrackerConfig {
    fn accepts(&self, detection: &Detection) -> bool {
        if !detection.confidence.is_finite() || !detection.bbox.is_valid() {
            return false;
        }
        if detection.confidence < self.min_confidence {
            return false;
        }
        if self.class_min_confidence.is_empty() {
            return true;
        }
        match self.class_min_confidence.get(&detection.label) {
            Some(floor) => detection.confidence >= *floor,
            None => false,
        }
    }
}

/// Result of one `update` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackUpdate {
    /// One entry per accepted detection, in detection order: the track it
    /// extended or opened, and whether it was opened this frame.
    pub tracks: Vec<(Track, bool)>,
    /// Tracks retired this frame.
    pub retired: Vec<RetiredTrack>,
    /// Detections dropped by the confidence, label or bbox filters.
    pub rejected: usize,
}

impl TrackUpdate {
    pub fn created(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|(_, is_new)| *is_new).map(|(t, _)| t)
    }
}

pub struct TrackManager {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    last_timestamp: Option<u64>,
}

impl TrackManager {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_timestamp: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fold one frame of detections into the track set.
    pub fn update(&mut self, frame_timestamp: u64, detections: &[Detection]) -> TrackUpdate {
        let ts = self.clamp_timestamp(frame_timestamp);

        let mut rejected = 0;
        let accepted: Vec<(usize, &Detection)> = detections
            .iter()
            .enumerate()
            .filter(|(_, det)| {
                let ok = self.config.accepts(det);
                if !ok {
                    rejected += 1;
                }
                ok
            })
            .collect();

        // Candidate pairs: (score, track id, index into `accepted`).
        let mut pairs: Vec<(f32, u64, usize)> = Vec::new();
        for (id, track) in &self.tracks {
            for (slot, (_, det)) in accepted.iter().enumerate() {
                let score = self.score(track, det);
                if score > 0.0 && score >= self.config.min_iou {
                    pairs.push((score, *id, slot));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut matched_tracks = BTreeSet::new();
        let mut assignment: Vec<Option<u64>> = vec![None; accepted.len()];
        for (_, track_id, slot) in pairs {
            if assignment[slot].is_some() || matched_tracks.contains(&track_id) {
                continue;
            }
            assignment[slot] = Some(track_id);
            matched_tracks.insert(track_id);
        }

        let mut opened = BTreeSet::new();
        let mut out = Vec::with_capacity(accepted.len());
        for (slot, (_, det)) in accepted.iter().enumerate() {
            match assignment[slot] {
                Some(track_id) => {
                    if let Some(track) = self.tracks.get_mut(&track_id) {
                        track.last_seen = ts;
                        track.last_bbox = det.bbox;
                        track.confidence = det.confidence;
                        track.missed_frames = 0;
                        track.hits = track.hits.saturating_add(1);
                        track.state = TrackState::Tracked;
                        out.push((track.clone(), false));
                    }
                }
                None => {
                    let id = TrackId(self.next_id);
                    self.next_id += 1;
                    let track = Track::open(id, det, ts);
                    log::debug!("track {} opened ({})", id, track.label);
                    out.push((track.clone(), true));
                    opened.insert(id.0);
                    self.tracks.insert(id.0, track);
                }
            }
        }

        let mut retired = Vec::new();
        let missed: Vec<u64> = self
            .tracks
            .keys()
            .filter(|id| !matched_tracks.contains(*id) && !opened.contains(*id))
            .copied()
            .collect();
        for id in missed {
            let over_budget = match self.tracks.get_mut(&id) {
                Some(track) => {
                    track.missed_frames = track.missed_frames.saturating_add(1);
                    track.missed_frames > self.config.max_missed
                }
                None => false,
            };
            if over_budget {
                if let Some(track) = self.tracks.remove(&id) {
                    let gone = RetiredTrack::from_track(track);
                    log::debug!(
                        "track {} retired after {} ms",
                        gone.track.id,
                        gone.dwell_ms
                    );
                    retired.push(gone);
                }
            }
        }

        TrackUpdate {
            tracks: out,
            retired,
            rejected,
        }
    }

    /// Record the zone a live track is in. Returns the transition when the
    /// zone changed.
    pub fn assign_zone(
        &mut self,
        id: TrackId,
        zone: Option<&str>,
        timestamp_ms: u64,
    ) -> Option<ZoneTransition> {
        let track = self.tracks.get_mut(&id.0)?;
        if track.current_zone.as_deref() == zone {
            return None;
        }
        let at = match track.zone_history.last() {
            Some((_, last)) => timestamp_ms.max(*last),
            None => timestamp_ms,
        };
        let from = track.current_zone.take();
        track.current_zone = zone.map(str::to_string);
        if let Some(z) = zone {
            track.zone_history.push((z.to_string(), at));
        }
        Some(ZoneTransition {
            track_id: id,
            label: track.label.clone(),
            from,
            to: track.current_zone.clone(),
            timestamp_ms: at,
        })
    }

    /// Retire every live track (end of stream or stop).
    pub fn retire_all(&mut self) -> Vec<RetiredTrack> {
        std::mem::take(&mut self.tracks)
            .into_values()
            .map(RetiredTrack::from_track)
            .collect()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id.0)
    }

    /// Live tracks in id order.
    pub fn live_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn live_count(&self) -> usize {
        self.tracks.len()
    }

    fn score(&self, track: &Track, det: &Detection) -> f32 {
        let iou = track.last_bbox.iou(&det.bbox);
        if track.label == det.label {
            iou
        } else {
            iou * self.config.label_mismatch_weight
        }
    }

    fn clamp_timestamp(&mut self, ts: u64) -> u64 {
        let ts = match self.last_timestamp {
            Some(prev) if ts < prev => {
                log::warn!(
                    "frame timestamp went backwards ({} < {}); clamping",
                    ts,
                    prev
                );
                prev
            }
            _ => ts,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(x: f32) -> Detection {
        Detection::new("person", 0.9, BBox::new(x, 0.0, x + 10.0, 20.0))
    }

    fn manager(max_missed: u32) -> TrackManager {
        TrackManager::new(TrackerConfig {
            max_missed,
            ..TrackerConfig::default()
        })
    }

    #[test]
    fn empty_frames_create_no_tracks() {
        let mut tm = manager(2);
        for ts in 0..10 {
            let up = tm.update(ts * 100, &[]);
            assert!(up.tracks.is_empty());
            assert!(up.retired.is_empty());
        }
        assert_eq!(tm.live_count(), 0);
    }

    #[test]
    fn overlapping_detection_extends_track() {
        let mut tm = manager(2);
        let first = tm.update(0, &[person(0.0)]);
        let id = first.tracks[0].0.id;
        assert!(first.tracks[0].1);

        let second = tm.update(100, &[person(1.0)]);
        assert_eq!(second.tracks[0].0.id, id);
        assert!(!second.tracks[0].1);
        assert_eq!(second.tracks[0].0.state, TrackState::Tracked);
        assert_eq!(tm.live_count(), 1);
    }

    #[test]
    fn distant_detection_opens_new_track() {
        let mut tm = manager(2);
        let first = tm.update(0, &[person(0.0)]).tracks[0].0.id;
        let second = tm.update(100, &[person(50.0)]);
        assert!(second.tracks[0].1);
        assert_ne!(second.tracks[0].0.id, first);
        assert_eq!(tm.live_count(), 2);
    }

    #[test]
    fn identical_frame_twice_keeps_one_track() {
        let mut tm = manager(2);
        let frame = vec![person(0.0)];
        tm.update(0, &frame);
        let again = tm.update(0, &frame);
        assert!(!again.tracks[0].1);
        assert_eq!(tm.live_count(), 1);
    }

    #[test]
    fn two_overlapping_detections_in_one_frame_make_two_tracks() {
        let mut tm = manager(2);
        let up = tm.update(0, &[person(0.0), person(3.0)]);
        assert_eq!(up.tracks.len(), 2);
        assert!(up.tracks.iter().all(|(_, is_new)| *is_new));
        assert_ne!(up.tracks[0].0.id, up.tracks[1].0.id);
    }

    #[test]
    fn contested_detection_goes_to_higher_score() {
        let mut tm = manager(2);
        let up = tm.update(0, &[person(0.0), person(6.0)]);
        let (a, b) = (up.tracks[0].0.id, up.tracks[1].0.id);

        // Closer to the second track's box.
        let next = tm.update(100, &[person(5.0)]);
        assert_eq!(next.tracks.len(), 1);
        assert_eq!(next.tracks[0].0.id, b);
        assert_eq!(tm.get(a).map(|t| t.missed_frames), Some(1));
    }

    #[test]
    fn retired_once_with_dwell() {
        let mut tm = manager(2);
        tm.update(1_000, &[person(0.0)]);
        tm.update(2_000, &[person(0.0)]);
        tm.update(4_000, &[person(0.0)]);

        let mut retired = Vec::new();
        for step in 1..=6 {
            retired.extend(tm.update(4_000 + step * 100, &[]).retired);
        }
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].dwell_ms, 3_000);
        assert_eq!(retired[0].track.state, TrackState::Retired);
        assert_eq!(tm.live_count(), 0);
    }

    #[test]
    fn low_confidence_and_unknown_labels_rejected() {
        let mut config = TrackerConfig::default();
        config.class_min_confidence.insert("person".to_string(), 0.5);
        let mut tm = TrackManager::new(config);

        let weak = Detection::new("person", 0.4, BBox::new(0.0, 0.0, 1.0, 1.0));
        let dog = Detection::new("dog", 0.9, BBox::new(0.0, 0.0, 1.0, 1.0));
        let bad_box = Detection::new("person", 0.9, BBox::new(1.0, 1.0, 1.0, 2.0));
        let up = tm.update(0, &[weak, dog, bad_box, person(0.0)]);
        assert_eq!(up.rejected, 3);
        assert_eq!(up.tracks.len(), 1);
    }

    #[test]
    fn labels_must_match_by_default() {
        let mut tm = manager(2);
        tm.update(0, &[person(0.0)]);
        let cart = Detection::new("cart", 0.9, BBox::new(0.0, 0.0, 10.0, 20.0));
        let up = tm.update(100, &[cart]);
        assert!(up.tracks[0].1);
        assert_eq!(tm.live_count(), 2);
    }

    #[test]
    fn zone_history_is_monotonic() {
        let mut tm = manager(2);
        let id = tm.update(1_000, &[person(0.0)]).tracks[0].0.id;

        let t1 = tm.assign_zone(id, Some("entrance"), 1_000).unwrap();
        assert_eq!(t1.from, None);
        assert!(tm.assign_zone(id, Some("entrance"), 1_100).is_none());

        let t2 = tm.assign_zone(id, Some("queue"), 900).unwrap();
        assert_eq!(t2.from.as_deref(), Some("entrance"));
        assert_eq!(t2.timestamp_ms, 1_000);

        let track = tm.get(id).unwrap();
        assert_eq!(track.current_zone.as_deref(), Some("queue"));
        let stamps: Vec<u64> = track.zone_history.iter().map(|(_, ts)| *ts).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backwards_timestamps_are_clamped() {
        let mut tm = manager(2);
        tm.update(5_000, &[person(0.0)]);
        let up = tm.update(4_000, &[person(0.0)]);
        assert_eq!(up.tracks[0].0.last_seen, 5_000);
    }

    #[test]
    fn retire_all_drains_arena() {
        let mut tm = manager(10);
        tm.update(0, &[person(0.0), person(50.0)]);
        tm.update(2_000, &[person(0.0), person(50.0)]);
        let retired = tm.retire_all();
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|r| r.dwell_ms == 2_000));
        assert_eq!(tm.live_count(), 0);
        assert!(tm.retire_all().is_empty());
    }
}
