//! Process-wide registry of running sources.
//!
//! The engine is the presentation-facing surface: it starts and stops
//! sources, and serves the latest snapshot and recommendations per business
//! type. At most one source feeds a business type at a time, so each event
//! stream has a single writer. Nothing here survives a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::detect::{BackendRegistry, DetectorBackend};
use crate::error::{ConfigurationError, LogWriteError, StartError};
use crate::events::{CloseReport, EventLogger};
use crate::ingest::{self, FrameSource, SourceKind};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::pipeline::{spawn_source, SnapshotBoard, SourceHandle, SourceProcessor, SourceStatus};
use crate::profile::{BusinessType, ProfileSet};
use crate::recommend::{recommend, Recommendation};
use crate::storage::{EventStore, SqliteEventStore};

pub const DEFAULT_TARGET_FPS: u32 = 10;

fn default_target_fps() -> u32 {
    DEFAULT_TARGET_FPS
}

/// What `start_source` needs to bring a source up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub business_type: BusinessType,
    /// Device index, stream URL, file path or `stub://` URL.
    pub source: String,
    /// Detector backend name; the registry default when absent.
    #[serde(default)]
    pub detector: Option<String>,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
}

impl SourceConfig {
    pub fn new(id: &str, business_type: BusinessType, source: &str) -> Self {
        Self {
            id: id.to_string(),
            business_type,
            source: source.to_string(),
            detector: None,
            target_fps: DEFAULT_TARGET_FPS,
        }
    }

    pub fn validate(&self) -> Result<SourceKind, ConfigurationError> {
        let id = self.id.trim();
        if id.is_empty() || id.len() > 64 || id.chars().any(char::is_whitespace) {
            return Err(ConfigurationError::InvalidSource(format!(
                "source id '{}' must be 1-64 characters without whitespace",
                self.id
            )));
        }
        if self.target_fps == 0 || self.target_fps > 120 {
            return Err(ConfigurationError::InvalidSource(format!(
                "{}: target_fps must be within 1..=120",
                self.id
            )));
        }
        SourceKind::parse(&self.source)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: String,
    pub business_type: BusinessType,
    pub status: SourceStatus,
    pub frames_skipped: u64,
}

type StoreFactory =
    Arc<dyn Fn(BusinessType) -> Result<Box<dyn EventStore>, LogWriteError> + Send + Sync>;

pub struct Engine {
    profiles: ProfileSet,
    backends: BackendRegistry,
    stores: StoreFactory,
    board: SnapshotBoard,
    sources: Mutex<BTreeMap<String, SourceHandle>>,
}

impl Engine {
    pub fn new<F>(profiles: ProfileSet, backends: BackendRegistry, stores: F) -> Self
    where
        F: Fn(BusinessType) -> Result<Box<dyn EventStore>, LogWriteError> + Send + Sync + 'static,
    {
        Self {
            profiles,
            backends,
            stores: Arc::new(stores),
            board: SnapshotBoard::new(),
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    /// Engine whose sources each open their own connection to `db_path`.
    pub fn with_sqlite(profiles: ProfileSet, backends: BackendRegistry, db_path: &str) -> Self {
        let db_path = db_path.to_string();
        Self::new(profiles, backends, move |_| {
            Ok(Box::new(SqliteEventStore::open(&db_path)?) as Box<dyn EventStore>)
        })
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    fn sources(&self) -> MutexGuard<'_, BTreeMap<String, SourceHandle>> {
        self.sources.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open the configured source and start processing it.
    pub fn start_source(&self, config: &SourceConfig) -> Result<(), StartError> {
        let kind = config.validate()?;
        let source = ingest::open(&kind, config.target_fps)?;
        self.start_with_source(config, source)
    }

    /// Start processing frames from an already-built source.
    ///
    /// Everything is validated before any thread starts; a failure leaves no
    /// trace behind.
    pub fn start_with_source(
        &self,
        config: &SourceConfig,
        source: Box<dyn FrameSource>,
    ) -> Result<(), StartError> {
        config.validate()?;
        let profile = self.profiles.get(config.business_type)?;
        let backend: Box<dyn DetectorBackend> = match &config.detector {
            Some(name) => self.backends.create(name)?,
            None => self.backends.create_default()?,
        };

        let mut sources = self.sources();
        sources.retain(|_, handle| !handle.status().is_terminal());
        if sources.contains_key(&config.id) {
            return Err(ConfigurationError::InvalidSource(format!(
                "source '{}' is already running",
                config.id
            ))
            .into());
        }
        if let Some(busy) = sources
            .values()
            .find(|handle| handle.business_type() == config.business_type)
        {
            return Err(ConfigurationError::BusinessInUse {
                business: config.business_type.to_string(),
                source_id: busy.id().to_string(),
            }
            .into());
        }

        let store = (self.stores)(config.business_type)?;
        let logger = EventLogger::new(config.business_type, store);
        let processor = SourceProcessor::new(&config.id, profile, logger)?;
        let handle = spawn_source(&config.id, source, backend, processor, self.board.clone())?;
        log::info!(
            "started source '{}' ({}) for {}",
            config.id,
            config.source,
            config.business_type
        );
        sources.insert(config.id.clone(), handle);
        Ok(())
    }

    /// Stop a source, retire its tracks and close its stream.
    pub fn stop_source(&self, id: &str) -> Result<CloseReport, ConfigurationError> {
        let mut sources = self.sources();
        let handle = sources
            .get_mut(id)
            .ok_or_else(|| ConfigurationError::InvalidSource(format!("unknown source '{}'", id)))?;
        let report = handle.stop().unwrap_or_default();
        log::info!("stopped source '{}'", id);
        Ok(report)
    }

    pub fn stop_all(&self) {
        let mut sources = self.sources();
        for (id, handle) in sources.iter_mut() {
            if !handle.status().is_terminal() {
                handle.stop();
                log::info!("stopped source '{}'", id);
            }
        }
    }

    pub fn source_status(&self, id: &str) -> Option<SourceStatus> {
        self.sources().get(id).map(SourceHandle::status)
    }

    /// Known sources, including ones that ended or failed since the last start.
    pub fn active_sources(&self) -> Vec<SourceInfo> {
        self.sources()
            .values()
            .map(|handle| SourceInfo {
                id: handle.id().to_string(),
                business_type: handle.business_type(),
                status: handle.status(),
                frames_skipped: handle.frames_skipped(),
            })
            .collect()
    }

    /// True when no source is still starting or running.
    pub fn all_finished(&self) -> bool {
        self.sources()
            .values()
            .all(|handle| handle.status().is_terminal())
    }

    /// Latest snapshot for `business`, all zeros before its first frame.
    pub fn current_snapshot(
        &self,
        business: BusinessType,
    ) -> Result<Arc<MetricsSnapshot>, ConfigurationError> {
        if let Some(snapshot) = self.board.get(business) {
            return Ok(snapshot);
        }
        let profile = self.profiles.get(business)?;
        Ok(Arc::new(MetricsAggregator::new(profile, "").zero_snapshot()))
    }

    pub fn recommendations(
        &self,
        business: BusinessType,
    ) -> Result<Vec<Recommendation>, ConfigurationError> {
        let profile = self.profiles.get(business)?;
        let snapshot = self.current_snapshot(business)?;
        Ok(recommend(&snapshot, &profile.recommendations))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;
    use crate::storage::InMemoryEventStore;

    fn engine() -> Engine {
        let mut backends = BackendRegistry::new();
        backends.register("scripted", || Ok(Box::new(ScriptedBackend::empty())));
        let store = InMemoryEventStore::new();
        Engine::new(ProfileSet::builtin().unwrap(), backends, move |_| {
            Ok(Box::new(store.clone()) as Box<dyn EventStore>)
        })
    }

    #[test]
    fn snapshot_before_start_is_all_zero() {
        let engine = engine();
        let snap = engine.current_snapshot(BusinessType::Retail).unwrap();
        assert_eq!(snap.total_live, 0);
        assert!(snap.counts_by_class.values().all(|v| *v == 0));
        assert!(snap.density_by_zone.contains_key("checkout"));
        assert!(engine
            .recommendations(BusinessType::Retail)
            .unwrap()
            .iter()
            .all(|r| r.value == 0.0));
    }

    #[test]
    fn one_source_per_business_type() {
        let engine = engine();
        engine
            .start_source(&SourceConfig::new("front", BusinessType::Retail, "stub://front?fps=20"))
            .unwrap();
        let err = engine
            .start_source(&SourceConfig::new("back", BusinessType::Retail, "stub://back?fps=20"))
            .unwrap_err();
        assert!(matches!(
            err,
            StartError::Configuration(ConfigurationError::BusinessInUse { .. })
        ));
        engine
            .start_source(&SourceConfig::new("gate", BusinessType::Residential, "stub://gate?fps=20"))
            .unwrap();
        assert_eq!(engine.active_sources().len(), 2);

        engine.stop_source("front").unwrap();
        assert_eq!(engine.source_status("front"), Some(SourceStatus::Stopped));
        engine
            .start_source(&SourceConfig::new("back", BusinessType::Retail, "stub://back?fps=20"))
            .unwrap();
        engine.stop_all();
        assert!(engine.all_finished());
    }

    #[test]
    fn invalid_configs_start_nothing() {
        let engine = engine();
        let mut config = SourceConfig::new("cam one", BusinessType::Pharmacy, "stub://x");
        assert!(engine.start_source(&config).is_err());

        config.id = "cam".to_string();
        config.detector = Some("yolo".to_string());
        assert!(matches!(
            engine.start_source(&config),
            Err(StartError::Configuration(ConfigurationError::UnknownBackend(_)))
        ));

        config.detector = None;
        config.target_fps = 0;
        assert!(engine.start_source(&config).is_err());
        assert!(engine.active_sources().is_empty());
    }

    #[test]
    fn stopping_unknown_source_fails() {
        assert!(engine().stop_source("nope").is_err());
    }

    #[test]
    fn source_config_parses_with_defaults() {
        let config: SourceConfig = serde_json::from_str(
            r#"{"id":"counter","business_type":"pharmacy","source":"rtsp://cam/1"}"#,
        )
        .unwrap();
        assert_eq!(config.target_fps, DEFAULT_TARGET_FPS);
        assert_eq!(
            config.validate().unwrap(),
            SourceKind::Network("rtsp://cam/1".to_string())
        );
    }
}
