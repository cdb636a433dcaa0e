//! FFmpeg-backed source for files, network streams and capture devices.
//!
//! Frames are decoded in-memory and converted to RGB24. File timestamps follow
//! the stream's presentation time (so dwell reflects video time); live sources
//! are stamped with the wall clock at capture.

use ffmpeg_next as ffmpeg;
use std::time::{Duration, Instant};

use super::synthetic::now_ms;
use super::{FrameSource, SourceKind, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

pub(crate) struct FfmpegSource {
    location: String,
    live: bool,
    target_fps: u32,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    base_ms: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
    eof_sent: bool,
}

impl FfmpegSource {
    pub(crate) fn open(kind: &SourceKind, target_fps: u32) -> Result<Self, SourceError> {
        let (location, live) = match kind {
            SourceKind::Device(index) => (format!("/dev/video{}", index), true),
            SourceKind::Network(url) => (url.clone(), true),
            SourceKind::File(path) => (path.clone(), false),
        };
        let open_failed = |reason: String| SourceError::Unreachable(location.clone(), reason);

        ffmpeg::init().map_err(|e| open_failed(format!("initialize ffmpeg: {}", e)))?;
        if matches!(kind, SourceKind::Device(_)) {
            ffmpeg::device::register_all();
        }
        let input = ffmpeg::format::input(&location)
            .map_err(|e| open_failed(format!("open input: {}", e)))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| open_failed("no video track".to_string()))?;
        let stream_index = input_stream.index();
        let time_base = input_stream.time_base();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| SourceError::Decode(format!("load decoder parameters: {}", e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| SourceError::Decode(format!("open video decoder: {}", e)))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| SourceError::Decode(format!("create scaler: {}", e)))?;

        Ok(Self {
            location,
            live,
            target_fps,
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            frame_count: 0,
            base_ms: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
            eof_sent: false,
        })
    }

    fn frame_timestamp(&self, decoded: &ffmpeg::frame::Video) -> u64 {
        if self.live {
            return now_ms();
        }
        let offset_ms = match decoded.pts() {
            Some(pts) if self.time_base.denominator() != 0 => {
                let num = i64::from(self.time_base.numerator());
                let den = i64::from(self.time_base.denominator());
                (pts.max(0) * num * 1000 / den) as u64
            }
            _ => self.frame_count.saturating_sub(1) * 1000 / u64::from(self.target_fps.max(1)),
        };
        self.base_ms + offset_ms
    }

    fn emit(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame, SourceError> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|e| SourceError::Decode(format!("scale frame to RGB: {}", e)))?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let timestamp_ms = self.frame_timestamp(decoded);
        Ok(Frame::new(self.frame_count, timestamp_ms, width, height, pixels))
    }

    fn stall_timeout(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            2_000
        } else {
            (1000 / self.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl FrameSource for FfmpegSource {
    fn connect(&mut self) -> Result<(), SourceError> {
        self.connected_at = Some(Instant::now());
        self.base_ms = now_ms();
        log::info!("FfmpegSource: connected to {}", self.location);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.live {
            if let Some(last) = self.last_frame_at {
                let idle = last.elapsed();
                if idle > self.stall_timeout().saturating_mul(10) {
                    self.last_error = Some("stream stalled".to_string());
                    return Err(SourceError::Stalled(
                        self.location.clone(),
                        idle.as_millis() as u64,
                    ));
                }
            }
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.emit(&decoded).map(Some);
        }

        let mut packet = ffmpeg::Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| SourceError::Decode(format!("send packet: {}", e)))?;
                    if self.decoder.receive_frame(&mut decoded).is_ok() {
                        return self.emit(&decoded).map(Some);
                    }
                }
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    self.last_error = Some(e.to_string());
                    return Err(SourceError::Decode(format!("read packet: {}", e)));
                }
            }
        }

        // Drain frames still buffered in the decoder.
        if !self.eof_sent {
            self.eof_sent = true;
            let _ = self.decoder.send_eof();
        }
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.emit(&decoded).map(Some);
        }

        if self.live {
            self.last_error = Some("stream ended".to_string());
            return Err(SourceError::Unreachable(
                self.location.clone(),
                "stream ended".to_string(),
            ));
        }
        log::info!(
            "FfmpegSource: end of {} after {} frames",
            self.location,
            self.frame_count
        );
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            location: self.location.clone(),
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32), SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| SourceError::Decode("frame row out of bounds".to_string()))?,
        );
    }

    Ok((pixels, width, height))
}
