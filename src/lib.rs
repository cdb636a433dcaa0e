//! Zonewatch: real-time detection-to-metrics kernel.
//!
//! Frames from a video source go through an external object detector; the
//! kernel turns the per-frame detections into short-lived tracks, places
//! them in named zones, aggregates business metrics over a rolling window,
//! writes an append-only event log and evaluates recommendation rules.
//!
//! # Module Structure
//!
//! - `frame`: frame type and the single-slot capture handoff
//! - `ingest`: frame sources (synthetic, and FFmpeg behind `ingest-ffmpeg`)
//! - `detect`: detector boundary, detections, backend registry
//! - `tracking`: IoU track manager
//! - `zones`: polygon zone classifier
//! - `profile`: business profiles (classes, zones, formulas, rules)
//! - `metrics`: rolling-window aggregator and snapshots
//! - `recommend`: rule evaluation
//! - `events`, `storage`: event records, logger and hash-chained stores
//! - `pipeline`: per-source processing loop
//! - `engine`: source registry and presentation API
//! - `config`: daemon configuration

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod profile;
pub mod recommend;
pub mod storage;
pub mod tracking;
pub mod zones;

pub use detect::{BBox, BackendRegistry, Detection, DetectorBackend, ReplayBackend, ScriptedBackend};
pub use engine::{Engine, SourceConfig, SourceInfo};
pub use error::{ConfigurationError, InferenceError, LogWriteError, SourceError, StartError};
pub use events::{Event, EventFilter, EventKind, EventLogger};
pub use frame::{Frame, FrameSlot};
pub use ingest::{FrameSource, SourceKind};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use pipeline::{SnapshotBoard, SourceProcessor, SourceStatus};
pub use profile::{BusinessProfile, BusinessType, ProfileSet};
pub use recommend::{recommend, Recommendation, RecommendationRule, Severity};
pub use storage::{hash_entry, EventStore, InMemoryEventStore, SqliteEventStore};
pub use tracking::{Track, TrackId, TrackManager, TrackerConfig};
pub use zones::{ZoneClassifier, ZoneDef};
