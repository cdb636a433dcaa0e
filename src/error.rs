//! Error taxonomy for the processing pipeline.
//!
//! Each class carries its own recovery policy:
//!
//! - `InferenceError`: the detector failed on one frame. The loop skips the
//!   frame (nothing is counted for it) and continues.
//! - `SourceError`: the stream is unreachable or broke. The loop for that
//!   source stops and its status becomes `Failed`.
//! - `ConfigurationError`: a profile, zone or source definition is invalid.
//!   Fatal at `start_source`, never partially applied.
//! - `LogWriteError`: an event could not be persisted. The logger buffers a
//!   bounded number of records and retries.
//!
//! `StartError` collects what can go wrong while bringing a source up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("detector backend '{backend}' unavailable: {reason}")]
    Unavailable { backend: String, reason: String },
    #[error("frame {seq} rejected by detector: {reason}")]
    BadFrame { seq: u64, reason: String },
    #[error("detector output invalid: {0}")]
    InvalidOutput(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source '{0}' unreachable: {1}")]
    Unreachable(String, String),
    #[error("source '{0}' stalled: no frame for {1} ms")]
    Stalled(String, u64),
    #[error("source kind not supported in this build: {0}")]
    Unsupported(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid zone '{zone}': {reason}")]
    InvalidZone { zone: String, reason: String },
    #[error("duplicate zone id '{0}'")]
    DuplicateZone(String),
    #[error("invalid profile '{profile}': {reason}")]
    InvalidProfile { profile: String, reason: String },
    #[error("unknown business type '{0}'")]
    UnknownBusiness(String),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("business type {business} already bound to source '{source_id}'")]
    BusinessInUse { business: String, source_id: String },
    #[error("detector backend '{0}' not registered")]
    UnknownBackend(String),
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("event store write failed: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("event serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event store corrupt: {0}")]
    Corrupt(String),
    #[error("event stream for {0} is closed")]
    Closed(String),
    #[error("{event} event logged on the {stream} stream")]
    WrongStream { stream: String, event: String },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] LogWriteError),
    #[error("failed to spawn processing thread: {0}")]
    Spawn(#[from] std::io::Error),
}
