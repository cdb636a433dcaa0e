use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::detect::{BackendRegistry, DetectorBackend, ReplayBackend, ScriptedBackend};
use crate::engine::SourceConfig;
use crate::profile::{BusinessType, ProfileSet};

const DEFAULT_DB_PATH: &str = "zonewatch.db";
const DEFAULT_SOURCE_ID: &str = "default";
const DEFAULT_SOURCE_URL: &str = "stub://default";
const DEFAULT_BUSINESS: BusinessType = BusinessType::Retail;

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    db_path: Option<String>,
    profiles_dir: Option<PathBuf>,
    window_secs: Option<u64>,
    detector: Option<DetectorConfigFile>,
    sources: Option<Vec<SourceConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    detections: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: String,
    pub profiles_dir: Option<PathBuf>,
    /// Overrides every profile's rolling window when set.
    pub window_secs: Option<u64>,
    pub detector: DetectorSettings,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Default backend name. `replay` when a detections file is configured,
    /// `scripted` (no detections) otherwise.
    pub backend: String,
    /// JSON-lines file of recorded detections for the `replay` backend.
    pub detections: Option<PathBuf>,
}

impl DaemonConfig {
    /// File named by `ZONEWATCH_CONFIG`, then environment overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ZONEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Same as `load`, reading `path` instead of `ZONEWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let detections = file.detector.as_ref().and_then(|d| d.detections.clone());
        let backend = file
            .detector
            .and_then(|d| d.backend)
            .unwrap_or_else(|| default_backend(detections.as_deref()).to_string());
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            profiles_dir: file.profiles_dir,
            window_secs: file.window_secs,
            detector: DetectorSettings {
                backend,
                detections,
            },
            sources: file.sources.unwrap_or_else(|| {
                vec![SourceConfig::new(
                    DEFAULT_SOURCE_ID,
                    DEFAULT_BUSINESS,
                    DEFAULT_SOURCE_URL,
                )]
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ZONEWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("ZONEWATCH_PROFILES_DIR") {
            if !dir.trim().is_empty() {
                self.profiles_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(window) = std::env::var("ZONEWATCH_WINDOW_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("ZONEWATCH_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.window_secs = Some(seconds);
        }
        if let Ok(path) = std::env::var("ZONEWATCH_DETECTIONS") {
            if !path.trim().is_empty() {
                self.detector.detections = Some(PathBuf::from(path));
                self.detector.backend = "replay".to_string();
            }
        }

        // A source from the environment replaces the configured list.
        let env_source = std::env::var("ZONEWATCH_SOURCE")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let env_business = match std::env::var("ZONEWATCH_BUSINESS") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.parse::<BusinessType>()?),
            _ => None,
        };
        match (env_source, env_business) {
            (Some(url), business) => {
                let business = business
                    .or_else(|| self.sources.first().map(|s| s.business_type))
                    .unwrap_or(DEFAULT_BUSINESS);
                self.sources = vec![SourceConfig::new(DEFAULT_SOURCE_ID, business, &url)];
            }
            (None, Some(business)) => {
                if let [only] = self.sources.as_mut_slice() {
                    only.business_type = business;
                } else {
                    return Err(anyhow!(
                        "ZONEWATCH_BUSINESS needs ZONEWATCH_SOURCE when several sources are configured"
                    ));
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.window_secs == Some(0) {
            return Err(anyhow!("window_secs must be greater than zero"));
        }
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        match self.detector.backend.as_str() {
            "scripted" => {}
            "replay" => {
                if self.detector.detections.is_none() {
                    return Err(anyhow!("replay detector needs a detections file"));
                }
            }
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }

        let mut ids = BTreeSet::new();
        let mut businesses = BTreeSet::new();
        for source in &mut self.sources {
            source.id = source.id.trim().to_string();
            source.validate()?;
            if !ids.insert(source.id.clone()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
            if !businesses.insert(source.business_type) {
                return Err(anyhow!(
                    "business type {} is fed by more than one source",
                    source.business_type
                ));
            }
        }
        Ok(())
    }

    /// Built-in profiles plus directory overrides and the window override.
    pub fn profiles(&self) -> Result<ProfileSet> {
        let mut set = match &self.profiles_dir {
            Some(dir) => ProfileSet::with_overrides(dir)?,
            None => ProfileSet::builtin()?,
        };
        if let Some(window_secs) = self.window_secs {
            let types: Vec<BusinessType> = set.business_types().collect();
            for business in types {
                let mut profile = set.get(business)?.as_ref().clone();
                profile.window_secs = window_secs;
                profile.validate()?;
                set.insert(profile);
            }
        }
        Ok(set)
    }

    /// Detector backends available to sources, default first.
    pub fn backends(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        if let Some(path) = &self.detector.detections {
            let replay = ReplayBackend::open(path)?;
            log::info!(
                "replaying {} recorded frames from {}",
                replay.len(),
                path.display()
            );
            registry.register("replay", move || {
                Ok(Box::new(replay.clone()) as Box<dyn DetectorBackend>)
            });
        }
        registry.register("scripted", || {
            Ok(Box::new(ScriptedBackend::empty()) as Box<dyn DetectorBackend>)
        });
        registry.set_default(&self.detector.backend)?;
        Ok(registry)
    }
}

fn default_backend(detections: Option<&Path>) -> &'static str {
    if detections.is_some() {
        "replay"
    } else {
        "scripted"
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
