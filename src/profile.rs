//! Business profiles: the data that decides what a source measures.
//!
//! A profile lists the classes worth counting (with per-class confidence
//! floors and detector label aliases), the zone polygons, the derived metric
//! formulas and the recommendation rules. Adding a business type means adding
//! a profile file; nothing in the pipeline branches on the business name.
//!
//! Three profiles are built in (`retail`, `pharmacy`, `residential`). A profile
//! directory can override any of them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::detect::Detection;
use crate::error::ConfigurationError;
use crate::recommend::RecommendationRule;
use crate::tracking::TrackerConfig;
use crate::zones::{ZoneClassifier, ZoneDef};

const BUILTIN_RETAIL: &str = include_str!("../profiles/retail.toml");
const BUILTIN_PHARMACY: &str = include_str!("../profiles/pharmacy.toml");
const BUILTIN_RESIDENTIAL: &str = include_str!("../profiles/residential.toml");

/// Metric names the snapshot always provides.
pub const BUILTIN_METRICS: [&str; 3] = ["live_tracks", "unzoned", "avg_dwell_secs"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusinessType {
    #[serde(alias = "supermarket")]
    Retail,
    Pharmacy,
    #[serde(alias = "condominium")]
    Residential,
}

impl BusinessType {
    pub const ALL: [BusinessType; 3] = [Self::Retail, Self::Pharmacy, Self::Residential];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retail => "retail",
            Self::Pharmacy => "pharmacy",
            Self::Residential => "residential",
        }
    }
}

impl fmt::Display for BusinessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retail" | "supermarket" => Ok(Self::Retail),
            "pharmacy" => Ok(Self::Pharmacy),
            "residential" | "condominium" => Ok(Self::Residential),
            other => Err(ConfigurationError::UnknownBusiness(other.to_string())),
        }
    }
}

/// A class the profile counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassRule {
    pub label: String,
    #[serde(default = "default_class_confidence")]
    pub min_confidence: f32,
    /// Detector labels folded into this class (e.g. `bottle` -> `medicine`).
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_class_confidence() -> f32 {
    0.4
}

/// How a derived metric is computed from the window.
///
/// An empty `labels` list means every class of the profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricFormula {
    /// Live tracks of the given labels.
    ClassCount {
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Live tracks of the given labels currently in `zone`.
    ZoneCount {
        zone: String,
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Live tracks divided by capacity. Falls back to the profile capacity.
    Occupancy {
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default)]
        capacity: Option<u32>,
    },
    /// Mean dwell in seconds of the given labels over the window.
    AverageDwell {
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Highest per-frame live count over the window.
    WindowPeak {
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Mean per-frame live count over the window.
    WindowAverage {
        #[serde(default)]
        labels: Vec<String>,
    },
    /// Zone transitions in the window. Missing ends match any zone.
    ZoneTransitions {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
}

impl MetricFormula {
    fn labels(&self) -> &[String] {
        match self {
            Self::ClassCount { labels }
            | Self::ZoneCount { labels, .. }
            | Self::Occupancy { labels, .. }
            | Self::AverageDwell { labels }
            | Self::WindowPeak { labels }
            | Self::WindowAverage { labels } => labels,
            Self::ZoneTransitions { .. } => &[],
        }
    }

    fn zones(&self) -> Vec<&str> {
        match self {
            Self::ZoneCount { zone, .. } => vec![zone.as_str()],
            Self::ZoneTransitions { from, to } => {
                from.iter().chain(to.iter()).map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub name: String,
    #[serde(flatten)]
    pub formula: MetricFormula,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneLayout {
    /// Use the `zones` table as declared.
    #[default]
    Declared,
    /// Split the normalized frame into entrance/middle/exit thirds.
    Thirds,
}

/// Tracker knobs a profile may tune.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub min_iou: f32,
    pub max_missed: u32,
    pub min_confidence: f32,
    pub label_mismatch_weight: f32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        let base = TrackerConfig::default();
        Self {
            min_iou: base.min_iou,
            max_missed: base.max_missed,
            min_confidence: base.min_confidence,
            label_mismatch_weight: base.label_mismatch_weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub business_type: BusinessType,
    #[serde(default)]
    pub display_name: String,
    /// Persons the site is designed for; used by `occupancy`.
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Classes included in `avg_dwell_secs`. Empty = all classes.
    #[serde(default = "default_dwell_classes")]
    pub dwell_classes: Vec<String>,
    /// Dwell samples longer than this are left out of averages.
    #[serde(default)]
    pub max_dwell_secs: Option<f64>,
    #[serde(default)]
    pub tracking: TrackingSettings,
    pub classes: Vec<ClassRule>,
    #[serde(default)]
    pub zone_layout: ZoneLayout,
    #[serde(default)]
    pub zones: Vec<ZoneDef>,
    #[serde(default)]
    pub metrics: Vec<MetricRule>,
    #[serde(default)]
    pub recommendations: Vec<RecommendationRule>,
}

fn default_window_secs() -> u64 {
    60
}

fn default_dwell_classes() -> Vec<String> {
    vec!["person".to_string()]
}

impl BusinessProfile {
    /// Parse and validate a TOML profile.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let profile: Self = toml::from_str(raw).map_err(|e| ConfigurationError::Parse {
            what: "business profile".to_string(),
            reason: e.to_string(),
        })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn builtin(business: BusinessType) -> Result<Self, ConfigurationError> {
        let raw = match business {
            BusinessType::Retail => BUILTIN_RETAIL,
            BusinessType::Pharmacy => BUILTIN_PHARMACY,
            BusinessType::Residential => BUILTIN_RESIDENTIAL,
        };
        let profile = Self::from_toml_str(raw)?;
        if profile.business_type != business {
            return Err(invalid(
                business,
                format!("built-in file declares {}", profile.business_type),
            ));
        }
        Ok(profile)
    }

    /// Zones in declaration order.
    pub fn zone_classifier(&self) -> Result<ZoneClassifier, ConfigurationError> {
        match self.zone_layout {
            ZoneLayout::Declared => ZoneClassifier::new(self.zones.clone()),
            ZoneLayout::Thirds => Ok(ZoneClassifier::thirds(1.0, 1.0)),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            min_iou: self.tracking.min_iou,
            min_confidence: self.tracking.min_confidence,
            class_min_confidence: self
                .classes
                .iter()
                .map(|c| (c.label.clone(), c.min_confidence))
                .collect(),
            max_missed: self.tracking.max_missed,
            label_mismatch_weight: self.tracking.label_mismatch_weight,
        }
    }

    pub fn class_labels(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.label.as_str())
    }

    /// Map a detector label onto the profile class it belongs to.
    pub fn resolve_label(&self, raw: &str) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.label == raw || c.aliases.iter().any(|a| a == raw))
            .map(|c| c.label.as_str())
    }

    /// Rewrite aliased detector labels to profile classes. Labels the profile
    /// does not know are left alone for the tracker to reject.
    pub fn normalize_detections(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .map(|mut det| {
                if let Some(label) = self.resolve_label(&det.label) {
                    if label != det.label {
                        det.label = label.to_string();
                    }
                }
                det
            })
            .collect()
    }

    /// True when `name` can be looked up in a snapshot of this profile.
    pub fn resolves_metric(&self, name: &str) -> bool {
        if BUILTIN_METRICS.contains(&name) || self.metrics.iter().any(|m| m.name == name) {
            return true;
        }
        if let Some(label) = name.strip_prefix("count.") {
            return self.classes.iter().any(|c| c.label == label);
        }
        if let Some(zone) = name.strip_prefix("zone.") {
            return self
                .zone_classifier()
                .map(|zones| zones.contains_zone(zone))
                .unwrap_or(false);
        }
        false
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let bt = self.business_type;
        if self.classes.is_empty() {
            return Err(invalid(bt, "at least one class is required"));
        }
        if self.window_secs == 0 {
            return Err(invalid(bt, "window_secs must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.tracking.min_iou) || self.tracking.min_iou == 0.0 {
            return Err(invalid(bt, "tracking.min_iou must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.tracking.label_mismatch_weight) {
            return Err(invalid(bt, "tracking.label_mismatch_weight must be in [0, 1]"));
        }
        if let Some(max) = self.max_dwell_secs {
            if !max.is_finite() || max <= 0.0 {
                return Err(invalid(bt, "max_dwell_secs must be positive"));
            }
        }

        let mut labels = BTreeSet::new();
        let mut aliases = BTreeMap::new();
        for class in &self.classes {
            if class.label.trim().is_empty() {
                return Err(invalid(bt, "class label must not be empty"));
            }
            if !labels.insert(class.label.as_str()) {
                return Err(invalid(bt, format!("duplicate class '{}'", class.label)));
            }
            if !(0.0..=1.0).contains(&class.min_confidence) {
                return Err(invalid(
                    bt,
                    format!("class '{}' min_confidence must be in [0, 1]", class.label),
                ));
            }
            for alias in &class.aliases {
                if let Some(owner) = aliases.insert(alias.as_str(), class.label.as_str()) {
                    return Err(invalid(
                        bt,
                        format!("alias '{}' claimed by '{}' and '{}'", alias, owner, class.label),
                    ));
                }
            }
        }
        for label in &self.dwell_classes {
            if !labels.contains(label.as_str()) {
                return Err(invalid(bt, format!("dwell class '{}' is not a declared class", label)));
            }
        }

        if self.zone_layout == ZoneLayout::Thirds && !self.zones.is_empty() {
            return Err(invalid(bt, "zone_layout = \"thirds\" cannot be combined with zones"));
        }
        let zones = self.zone_classifier()?;

        let mut names = BTreeSet::new();
        for metric in &self.metrics {
            let name = metric.name.as_str();
            if name.is_empty() || name.contains('.') || BUILTIN_METRICS.contains(&name) {
                return Err(invalid(bt, format!("metric name '{}' is reserved or invalid", name)));
            }
            if !names.insert(name) {
                return Err(invalid(bt, format!("duplicate metric '{}'", name)));
            }
            for label in metric.formula.labels() {
                if !labels.contains(label.as_str()) {
                    return Err(invalid(
                        bt,
                        format!("metric '{}' uses undeclared class '{}'", name, label),
                    ));
                }
            }
            for zone in metric.formula.zones() {
                if !zones.contains_zone(zone) {
                    return Err(invalid(
                        bt,
                        format!("metric '{}' uses undeclared zone '{}'", name, zone),
                    ));
                }
            }
            if let MetricFormula::Occupancy { capacity, .. } = &metric.formula {
                match capacity.or(self.capacity) {
                    Some(c) if c > 0 => {}
                    _ => {
                        return Err(invalid(
                            bt,
                            format!("metric '{}' needs a capacity greater than zero", name),
                        ))
                    }
                }
            }
        }

        for rule in &self.recommendations {
            if !rule.threshold.is_finite() {
                return Err(invalid(bt, format!("rule on '{}' has a non-finite threshold", rule.metric)));
            }
            if !self.resolves_metric(&rule.metric) {
                return Err(invalid(
                    bt,
                    format!("rule references unknown metric '{}'", rule.metric),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(business: BusinessType, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidProfile {
        profile: business.to_string(),
        reason: reason.into(),
    }
}

/// Read-only profile table shared by every processing loop.
#[derive(Clone, Debug, Default)]
pub struct ProfileSet {
    profiles: BTreeMap<BusinessType, Arc<BusinessProfile>>,
}

impl ProfileSet {
    pub fn builtin() -> Result<Self, ConfigurationError> {
        let mut set = Self::default();
        for business in BusinessType::ALL {
            set.insert(BusinessProfile::builtin(business)?);
        }
        Ok(set)
    }

    /// Built-in profiles, overridden by every `*.toml` file in `dir`.
    pub fn with_overrides(dir: &Path) -> Result<Self, ConfigurationError> {
        let mut set = Self::builtin()?;
        let read_err = |e: std::io::Error| ConfigurationError::Parse {
            what: dir.display().to_string(),
            reason: e.to_string(),
        };
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        for path in paths {
            let raw = std::fs::read_to_string(&path).map_err(read_err)?;
            let profile = BusinessProfile::from_toml_str(&raw).map_err(|e| match e {
                ConfigurationError::Parse { reason, .. } => ConfigurationError::Parse {
                    what: path.display().to_string(),
                    reason,
                },
                other => other,
            })?;
            log::info!(
                "profile {} overridden from {}",
                profile.business_type,
                path.display()
            );
            set.insert(profile);
        }
        Ok(set)
    }

    pub fn insert(&mut self, profile: BusinessProfile) {
        self.profiles
            .insert(profile.business_type, Arc::new(profile));
    }

    pub fn get(&self, business: BusinessType) -> Result<Arc<BusinessProfile>, ConfigurationError> {
        self.profiles
            .get(&business)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownBusiness(business.to_string()))
    }

    pub fn business_types(&self) -> impl Iterator<Item = BusinessType> + '_ {
        self.profiles.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    const MINIMAL: &str = r#"
business_type = "pharmacy"
capacity = 10

[[classes]]
label = "person"
min_confidence = 0.5

[[zones]]
id = "queue"
polygon = [[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]]

[[metrics]]
name = "queue_length"
kind = "zone_count"
zone = "queue"
labels = ["person"]

[[recommendations]]
metric = "queue_length"
comparison = "above"
threshold = 3
severity = "critical"
message = "Queue too long"
"#;

    #[test]
    fn builtin_profiles_load_and_validate() {
        let set = ProfileSet::builtin().unwrap();
        for business in BusinessType::ALL {
            let profile = set.get(business).unwrap();
            assert_eq!(profile.business_type, business);
            assert!(!profile.classes.is_empty());
            profile.zone_classifier().unwrap();
        }
    }

    #[test]
    fn parses_minimal_profile() {
        let profile = BusinessProfile::from_toml_str(MINIMAL).unwrap();
        assert_eq!(profile.window_secs, 60);
        assert_eq!(profile.dwell_classes, vec!["person".to_string()]);
        assert_eq!(
            profile.metrics[0].formula,
            MetricFormula::ZoneCount {
                zone: "queue".to_string(),
                labels: vec!["person".to_string()],
            }
        );
        assert!(profile.resolves_metric("zone.queue"));
        assert!(profile.resolves_metric("count.person"));
        assert!(!profile.resolves_metric("count.cart"));
    }

    #[test]
    fn business_type_aliases() {
        assert_eq!("supermarket".parse::<BusinessType>().unwrap(), BusinessType::Retail);
        assert_eq!("Condominium".parse::<BusinessType>().unwrap(), BusinessType::Residential);
        assert!(matches!(
            "bakery".parse::<BusinessType>(),
            Err(ConfigurationError::UnknownBusiness(_))
        ));
    }

    #[test]
    fn rejects_rule_with_unknown_metric() {
        let raw = MINIMAL.replace("metric = \"queue_length\"", "metric = \"queue_len\"");
        assert!(matches!(
            BusinessProfile::from_toml_str(&raw),
            Err(ConfigurationError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn rejects_formula_with_unknown_zone() {
        let raw = MINIMAL.replace("zone = \"queue\"", "zone = \"lobby\"");
        assert!(BusinessProfile::from_toml_str(&raw).is_err());
    }

    #[test]
    fn rejects_bad_polygon() {
        let raw = MINIMAL.replace(
            "polygon = [[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]]",
            "polygon = [[0.0, 0.0], [0.5, 0.0]]",
        );
        assert!(matches!(
            BusinessProfile::from_toml_str(&raw),
            Err(ConfigurationError::InvalidZone { .. })
        ));
    }

    #[test]
    fn occupancy_needs_capacity() {
        let raw = MINIMAL.replace("capacity = 10\n", "").replace(
            "[[recommendations]]",
            "[[metrics]]\nname = \"occupancy_rate\"\nkind = \"occupancy\"\n\n[[recommendations]]",
        );
        assert!(BusinessProfile::from_toml_str(&raw).is_err());
    }

    #[test]
    fn aliases_fold_detector_labels() {
        let profile = BusinessProfile::builtin(BusinessType::Pharmacy).unwrap();
        let dets = profile.normalize_detections(vec![
            Detection::new("bottle", 0.9, BBox::new(0.0, 0.0, 0.1, 0.1)),
            Detection::new("giraffe", 0.9, BBox::new(0.0, 0.0, 0.1, 0.1)),
        ]);
        assert_eq!(dets[0].label, "medicine");
        assert_eq!(dets[1].label, "giraffe");
    }

    #[test]
    fn directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pharmacy.toml"), MINIMAL).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = ProfileSet::with_overrides(dir.path()).unwrap();
        let pharmacy = set.get(BusinessType::Pharmacy).unwrap();
        assert_eq!(pharmacy.capacity, Some(10));
        assert_eq!(pharmacy.classes.len(), 1);
        assert!(set.get(BusinessType::Retail).is_ok());
    }
}
