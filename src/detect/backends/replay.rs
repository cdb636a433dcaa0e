//! Recorded-detection replay backend.
//!
//! Reads a JSON-lines file where each line holds the detector output for one
//! frame sequence number:
//!
//! ```text
//! {"seq": 1, "detections": [{"label": "person", "confidence": 0.91,
//!   "bbox": {"x_min": 0.1, "y_min": 0.2, "x_max": 0.3, "y_max": 0.8}}]}
//! {"seq": 2, "error": "backend timeout"}
//! ```
//!
//! This lets a recorded run be re-evaluated against new profiles without
//! loading a model.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::{ConfigurationError, InferenceError};
use crate::frame::Frame;

#[derive(Debug, Deserialize)]
struct ReplayLine {
    seq: u64,
    #[serde(default)]
    detections: Vec<Detection>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
enum ReplayEntry {
    Detections(Vec<Detection>),
    Failure(String),
}

#[derive(Debug, Clone, Default)]
pub struct ReplayBackend {
    entries: BTreeMap<u64, ReplayEntry>,
}

impl ReplayBackend {
    pub fn open(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Parse {
            what: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_jsonl(&raw).map_err(|reason| ConfigurationError::Parse {
            what: path.display().to_string(),
            reason,
        })
    }

    pub fn from_jsonl(raw: &str) -> Result<Self, String> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(line)
                .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
            let entry = match parsed.error {
                Some(reason) => ReplayEntry::Failure(reason),
                None => ReplayEntry::Detections(parsed.detections),
            };
            entries.insert(parsed.seq, entry);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        match self.entries.get(&frame.seq) {
            Some(ReplayEntry::Detections(dets)) => Ok(dets.clone()),
            Some(ReplayEntry::Failure(reason)) => Err(InferenceError::BadFrame {
                seq: frame.seq,
                reason: reason.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"
# recorded at the pharmacy counter
{"seq": 1, "detections": [{"label": "person", "confidence": 0.91, "bbox": {"x_min": 0.1, "y_min": 0.2, "x_max": 0.3, "y_max": 0.8}}]}
{"seq": 2, "error": "backend timeout"}
"#;

    #[test]
    fn replays_recorded_frames() {
        let mut backend = ReplayBackend::from_jsonl(RECORDING).unwrap();
        assert_eq!(backend.len(), 2);

        let dets = backend.detect(&Frame::blank(1, 0)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "person");

        assert!(backend.detect(&Frame::blank(2, 100)).is_err());
        assert!(backend.detect(&Frame::blank(3, 200)).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = ReplayBackend::from_jsonl("{\"seq\": 1}\nnot json").unwrap_err();
        assert!(err.starts_with("line 2"));
    }
}
