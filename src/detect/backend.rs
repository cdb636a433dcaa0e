use crate::error::InferenceError;
use crate::frame::Frame;

use super::result::Detection;

/// Detector backend trait.
///
/// This is the boundary to the external object detector. The model, its
/// runtime and its hardware negotiation live behind it; the pipeline only
/// relies on the returned detections.
///
/// Implementations must treat the frame as read-only and must not keep
/// pixels beyond the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// An `Err` means the frame could not be processed at all. The caller
    /// skips the frame (nothing is counted for it) and keeps running.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }
}
