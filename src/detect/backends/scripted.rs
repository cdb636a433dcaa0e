use std::collections::{BTreeMap, BTreeSet};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Scripted backend for testing and dry runs.
///
/// Returns a fixed detection list per frame sequence number. Frames without a
/// script entry produce zero detections; frames listed in `failures` produce
/// an `InferenceError`.
#[derive(Debug, Default, Clone)]
pub struct ScriptedBackend {
    script: BTreeMap<u64, Vec<Detection>>,
    failures: BTreeSet<u64>,
    calls: u64,
}

impl ScriptedBackend {
    /// Backend that never detects anything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(script: BTreeMap<u64, Vec<Detection>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Use the same detections for every frame in `seqs`.
    pub fn repeating(seqs: impl IntoIterator<Item = u64>, detections: Vec<Detection>) -> Self {
        let script = seqs
            .into_iter()
            .map(|seq| (seq, detections.clone()))
            .collect();
        Self::new(script)
    }

    pub fn with_frame(mut self, seq: u64, detections: Vec<Detection>) -> Self {
        self.script.insert(seq, detections);
        self
    }

    pub fn with_failure_at(mut self, seq: u64) -> Self {
        self.failures.insert(seq);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        self.calls += 1;
        if self.failures.contains(&frame.seq) {
            return Err(InferenceError::BadFrame {
                seq: frame.seq,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.script.get(&frame.seq).cloned().unwrap_or_default())
    }
}
