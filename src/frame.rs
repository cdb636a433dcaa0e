//! Frames and the capture-to-processing handoff.
//!
//! - `Frame`: one decoded image. Pixel bytes are private; detectors read them
//!   through `pixels()` for the duration of a `detect` call.
//! - `FrameSlot`: single-slot, latest-wins handoff between a capture thread and
//!   the processing loop. A frame that was not consumed before the next one
//!   arrives is dropped and counted as skipped.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded frame.
///
/// Not `Clone`: a frame moves from the source, through the slot, into the
/// processing loop, and is dropped after detection.
#[derive(Debug)]
pub struct Frame {
    /// Position in the source stream, starting at 1.
    pub seq: u64,
    /// Capture time, epoch milliseconds.
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u64, timestamp_ms: u64, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            seq,
            timestamp_ms,
            width,
            height,
            data: pixels,
        }
    }

    /// Zero-sized frame carrying only sequence and timestamp. Used by scripted
    /// sources whose detector ignores pixels.
    pub fn blank(seq: u64, timestamp_ms: u64) -> Self {
        Self::new(seq, timestamp_ms, 0, 0, Vec::new())
    }

    /// Raw pixel bytes (RGB8, row-major).
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-wins handoff
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<Frame>,
    closed: bool,
    delivered: u64,
    skipped: u64,
}

/// Outcome of waiting on a `FrameSlot`.
#[derive(Debug)]
pub enum SlotTake {
    Frame(Frame),
    /// Nothing arrived before the timeout.
    Empty,
    /// The producer finished (or the slot was closed) and no frame is pending.
    Closed,
}

/// Single-slot frame handoff.
///
/// Backpressure is by skipping: `put` replaces an unconsumed frame instead of
/// queueing it, so a slow detector always sees the newest frame.
#[derive(Debug, Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        // The slot state stays consistent across a panicking holder.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a frame. Returns `false` when the slot is closed.
    pub fn put(&self, frame: Frame) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        if state.frame.replace(frame).is_some() {
            state.skipped += 1;
        }
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for a frame.
    ///
    /// A pending frame is still delivered after `close()`; `Closed` is only
    /// returned once the slot is both closed and empty.
    pub fn take(&self, timeout: Duration) -> SlotTake {
        let mut state = self.state();
        if state.frame.is_none() && !state.closed {
            state = match self.ready.wait_timeout(state, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        match state.frame.take() {
            Some(frame) => {
                state.delivered += 1;
                SlotTake::Frame(frame)
            }
            None if state.closed => SlotTake::Closed,
            None => SlotTake::Empty,
        }
    }

    /// Mark the producer side finished and wake any waiter.
    pub fn close(&self) {
        self.state().closed = true;
        self.ready.notify_all();
    }

    /// Drop a pending frame without processing it (used on stop).
    pub fn discard(&self) -> bool {
        self.state().frame.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn skipped(&self) -> u64 {
        self.state().skipped
    }

    pub fn delivered(&self) -> u64 {
        self.state().delivered
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
