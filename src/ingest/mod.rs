//! Frame ingestion sources.
//!
//! A source produces a lazy, finite or infinite sequence of frames:
//! - `stub://` URLs produce synthetic frames (testing, dry runs)
//! - Local files, network stream URLs and device indices decode through
//!   FFmpeg (feature: ingest-ffmpeg)
//!
//! `next_frame` returns `Ok(None)` at end of stream. Any `Err` is a
//! `SourceError` and ends the processing loop for that source.
//!
//! The ingestion layer MUST NOT:
//! - Store decoded frames to disk
//! - Retain frames beyond handoff to the frame slot

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
mod synthetic;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, SourceError};
use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Local capture device index (`/dev/video{N}` on Linux).
    Device(u32),
    /// Network stream URL (`rtsp://`, `http://`, ...).
    Network(String),
    /// Local file path, or a `stub://` synthetic source.
    File(String),
}

impl SourceKind {
    /// Parse a source string: a bare integer is a device index, a URL with a
    /// scheme other than `stub://` or `file://` is a network stream, anything
    /// else is a file path.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigurationError::InvalidSource(
                "source must not be empty".to_string(),
            ));
        }
        if let Ok(index) = raw.parse::<u32>() {
            return Ok(Self::Device(index));
        }
        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() {
                return Err(ConfigurationError::InvalidSource(raw.to_string()));
            }
            return Ok(Self::File(path.to_string()));
        }
        if raw.starts_with("stub://") || !raw.contains("://") {
            return Ok(Self::File(raw.to_string()));
        }
        Ok(Self::Network(raw.to_string()))
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::File(path) if path.starts_with("stub://"))
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device:{}", index),
            Self::Network(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "{}", path),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub location: String,
}

/// Producer side of a processing loop.
pub trait FrameSource: Send {
    /// Open the underlying stream.
    fn connect(&mut self) -> Result<(), SourceError>;

    /// Capture the next frame. `Ok(None)` means the stream ended cleanly.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Build the source for `kind`.
pub fn open(kind: &SourceKind, target_fps: u32) -> Result<Box<dyn FrameSource>, SourceError> {
    if kind.is_synthetic() {
        let config = SyntheticConfig::from_url(&kind.to_string(), target_fps)?;
        return Ok(Box::new(SyntheticSource::new(config)));
    }

    #[cfg(feature = "ingest-ffmpeg")]
    {
        Ok(Box::new(ffmpeg::FfmpegSource::open(kind, target_fps)?))
    }
    #[cfg(not(feature = "ingest-ffmpeg"))]
    {
        let _ = target_fps;
        Err(SourceError::Unsupported(format!(
            "{} (decoding requires the ingest-ffmpeg feature)",
            kind
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_kinds() {
        assert_eq!(SourceKind::parse("0").unwrap(), SourceKind::Device(0));
        assert_eq!(
            SourceKind::parse("rtsp://cam.local/stream").unwrap(),
            SourceKind::Network("rtsp://cam.local/stream".to_string())
        );
        assert_eq!(
            SourceKind::parse("/var/lib/zonewatch/store.mp4").unwrap(),
            SourceKind::File("/var/lib/zonewatch/store.mp4".to_string())
        );
        assert_eq!(
            SourceKind::parse("file:///tmp/a.mp4").unwrap(),
            SourceKind::File("/tmp/a.mp4".to_string())
        );
        assert!(SourceKind::parse("stub://lobby").unwrap().is_synthetic());
        assert!(SourceKind::parse("   ").is_err());
    }

    #[test]
    fn synthetic_source_opens_without_ffmpeg() {
        let kind = SourceKind::parse("stub://lobby?frames=3").unwrap();
        let mut source = open(&kind, 10).unwrap();
        source.connect().unwrap();
        let mut seqs = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[cfg(not(feature = "ingest-ffmpeg"))]
    #[test]
    fn real_sources_need_ffmpeg_feature() {
        let kind = SourceKind::parse("/tmp/video.mp4").unwrap();
        assert!(matches!(open(&kind, 10), Err(SourceError::Unsupported(_))));
    }
}
