//! Synthetic frame source (`stub://`).
//!
//! URL form: `stub://<name>[?frames=N&fps=F&width=W&height=H&realtime=0|1]`.
//! Without `frames` the source is infinite and paced in real time.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub url: String,
    /// Stop after this many frames; `None` = infinite.
    pub frames: Option<u64>,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Sleep one frame interval between frames.
    pub realtime: bool,
    /// Timestamp of frame 1. `None` = wall clock at connect.
    pub start_ms: Option<u64>,
}

impl SyntheticConfig {
    pub fn from_url(url: &str, default_fps: u32) -> Result<Self, SourceError> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| SourceError::Unsupported(url.to_string()))?;
        let mut config = Self {
            url: url.to_string(),
            frames: None,
            fps: default_fps.max(1),
            width: 64,
            height: 48,
            realtime: true,
            start_ms: None,
        };
        let mut realtime_set = false;

        if let Some((_, query)) = rest.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let bad = || SourceError::Unreachable(url.to_string(), format!("bad {}", pair));
                match key {
                    "frames" => config.frames = Some(value.parse().map_err(|_| bad())?),
                    "fps" => config.fps = value.parse::<u32>().map_err(|_| bad())?.max(1),
                    "width" => config.width = value.parse().map_err(|_| bad())?,
                    "height" => config.height = value.parse().map_err(|_| bad())?,
                    "start_ms" => config.start_ms = Some(value.parse().map_err(|_| bad())?),
                    "realtime" => {
                        config.realtime = matches!(value, "1" | "true");
                        realtime_set = true;
                    }
                    _ => log::warn!("SyntheticSource: ignoring unknown parameter '{}'", key),
                }
            }
        }
        if !realtime_set && config.frames.is_some() {
            config.realtime = false;
        }
        Ok(config)
    }

    fn interval_ms(&self) -> u64 {
        1000 / u64::from(self.fps.max(1))
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    base_ms: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            base_ms: 0,
            connected: false,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        (0..pixel_count)
            .map(|i| ((i as u64 + self.frame_count) % 256) as u8)
            .collect()
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<(), SourceError> {
        self.base_ms = match self.config.start_ms {
            Some(start) => start,
            None => now_ms(),
        };
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if !self.connected {
            return Err(SourceError::Unreachable(
                self.config.url.clone(),
                "not connected".to_string(),
            ));
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        if self.config.realtime && self.frame_count > 0 {
            thread::sleep(Duration::from_millis(self.config.interval_ms()));
        }

        self.frame_count += 1;
        let timestamp_ms = self.base_ms + (self.frame_count - 1) * self.config.interval_ms();
        Ok(Some(Frame::new(
            self.frame_count,
            timestamp_ms,
            self.config.width,
            self.config.height,
            self.generate_pixels(),
        )))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            location: self.config.url.clone(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
