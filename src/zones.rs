//! Zone classification.
//!
//! A zone is a named polygon in frame coordinates. Classification is a pure
//! function of the bbox centroid: the first declared zone containing the
//! centroid wins, and a centroid outside every zone yields `None`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::detect::BBox;
use crate::error::ConfigurationError;

/// Named polygon. Immutable for the lifetime of a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneDef {
    pub id: String,
    /// Vertices in order; the polygon closes implicitly.
    pub polygon: Vec<(f32, f32)>,
}

impl ZoneDef {
    pub fn new(id: impl Into<String>, polygon: Vec<(f32, f32)>) -> Self {
        Self {
            id: id.into(),
            polygon,
        }
    }

    /// Axis-aligned rectangle zone.
    pub fn rect(id: impl Into<String>, x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self::new(
            id,
            vec![(x_min, y_min), (x_max, y_min), (x_max, y_max), (x_min, y_max)],
        )
    }

    /// Even-odd ray cast. Points on the left/top edges are inside, points on
    /// the right/bottom edges are outside, so adjacent zones never both claim
    /// a shared edge.
    pub fn contains(&self, (px, py): (f32, f32)) -> bool {
        let n = self.polygon.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.polygon[i];
            let (xj, yj) = self.polygon[j];
            if (yi > py) != (yj > py) {
                let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
                if px < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        validate_zone_id(&self.id)?;
        if self.polygon.len() < 3 {
            return Err(ConfigurationError::InvalidZone {
                zone: self.id.clone(),
                reason: format!("polygon needs at least 3 vertices, got {}", self.polygon.len()),
            });
        }
        if self
            .polygon
            .iter()
            .any(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(ConfigurationError::InvalidZone {
                zone: self.id.clone(),
                reason: "polygon has non-finite coordinates".to_string(),
            });
        }
        Ok(())
    }
}

/// Validate a zone identifier: `[a-z0-9_-]{1,64}`.
pub fn validate_zone_id(zone_id: &str) -> Result<(), ConfigurationError> {
    // Compile once for hot paths.
    static ZONE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());

    if !re.is_match(zone_id) {
        return Err(ConfigurationError::InvalidZone {
            zone: zone_id.to_string(),
            reason: "zone id must match ^[a-z0-9_-]{1,64}$".to_string(),
        });
    }
    Ok(())
}

/// Ordered set of validated zones for one profile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ZoneClassifier {
    zones: Vec<ZoneDef>,
}

impl ZoneClassifier {
    /// Validate and take ownership of `zones`. Declaration order is kept and
    /// decides overlaps.
    pub fn new(zones: Vec<ZoneDef>) -> Result<Self, ConfigurationError> {
        let mut seen = BTreeSet::new();
        for zone in &zones {
            zone.validate()?;
            if !seen.insert(zone.id.as_str()) {
                return Err(ConfigurationError::DuplicateZone(zone.id.clone()));
            }
        }
        Ok(Self { zones })
    }

    /// Split a `width` x `height` frame into `entrance`, `middle` and `exit`
    /// vertical thirds, left to right.
    pub fn thirds(width: f32, height: f32) -> Self {
        let third = width / 3.0;
        Self {
            zones: vec![
                ZoneDef::rect("entrance", 0.0, 0.0, third, height),
                ZoneDef::rect("middle", third, 0.0, 2.0 * third, height),
                ZoneDef::rect("exit", 2.0 * third, 0.0, width, height),
            ],
        }
    }

    pub fn classify(&self, bbox: &BBox) -> Option<&str> {
        let centroid = bbox.centroid();
        if !centroid.0.is_finite() || !centroid.1.is_finite() {
            return None;
        }
        self.zones
            .iter()
            .find(|zone| zone.contains(centroid))
            .map(|zone| zone.id.as_str())
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(|z| z.id.as_str())
    }

    pub fn zones(&self) -> &[ZoneDef] {
        &self.zones
    }

    pub fn contains_zone(&self, id: &str) -> bool {
        self.zones.iter().any(|z| z.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn centered(x: f32, y: f32) -> BBox {
        BBox::new(x - 0.01, y - 0.01, x + 0.01, y + 0.01)
    }

    #[test]
    fn thirds_split_left_to_right() {
        let zones = ZoneClassifier::thirds(1.0, 1.0);
        assert_eq!(zones.classify(&centered(0.1, 0.5)), Some("entrance"));
        assert_eq!(zones.classify(&centered(0.5, 0.5)), Some("middle"));
        assert_eq!(zones.classify(&centered(0.9, 0.5)), Some("exit"));
    }

    #[test]
    fn shared_edge_belongs_to_one_zone() {
        let zones = ZoneClassifier::new(vec![
            ZoneDef::rect("left", 0.0, 0.0, 0.5, 1.0),
            ZoneDef::rect("right", 0.5, 0.0, 1.0, 1.0),
        ])
        .unwrap();
        // centroid exactly on x = 0.5
        let on_edge = BBox::new(0.4, 0.4, 0.6, 0.6);
        assert_eq!(zones.classify(&on_edge), Some("right"));
    }

    #[test]
    fn centroid_outside_all_zones_is_unzoned() {
        let zones =
            ZoneClassifier::new(vec![ZoneDef::rect("queue", 0.0, 0.0, 0.3, 0.3)]).unwrap();
        assert_eq!(zones.classify(&centered(0.8, 0.8)), None);
        assert_eq!(ZoneClassifier::default().classify(&centered(0.5, 0.5)), None);
    }

    #[test]
    fn first_declared_zone_wins_overlap() {
        let zones = ZoneClassifier::new(vec![
            ZoneDef::rect("queue", 0.0, 0.0, 0.6, 1.0),
            ZoneDef::rect("counter", 0.4, 0.0, 1.0, 1.0),
        ])
        .unwrap();
        assert_eq!(zones.classify(&centered(0.5, 0.5)), Some("queue"));

        let reversed = ZoneClassifier::new(vec![
            ZoneDef::rect("counter", 0.4, 0.0, 1.0, 1.0),
            ZoneDef::rect("queue", 0.0, 0.0, 0.6, 1.0),
        ])
        .unwrap();
        assert_eq!(reversed.classify(&centered(0.5, 0.5)), Some("counter"));
    }

    #[test]
    fn non_convex_polygon() {
        // L-shape: the notch at the top right is outside.
        let zone = ZoneDef::new(
            "lobby",
            vec![
                (0.0, 0.0),
                (0.5, 0.0),
                (0.5, 0.5),
                (1.0, 0.5),
                (1.0, 1.0),
                (0.0, 1.0),
            ],
        );
        assert!(zone.contains((0.25, 0.25)));
        assert!(zone.contains((0.75, 0.75)));
        assert!(!zone.contains((0.75, 0.25)));
    }

    #[test]
    fn rejects_invalid_definitions() {
        assert!(matches!(
            ZoneClassifier::new(vec![ZoneDef::new("tri", vec![(0.0, 0.0), (1.0, 1.0)])]),
            Err(ConfigurationError::InvalidZone { .. })
        ));
        assert!(matches!(
            ZoneClassifier::new(vec![ZoneDef::rect("Queue Area", 0.0, 0.0, 1.0, 1.0)]),
            Err(ConfigurationError::InvalidZone { .. })
        ));
        assert!(matches!(
            ZoneClassifier::new(vec![ZoneDef::rect("q", 0.0, 0.0, f32::NAN, 1.0)]),
            Err(ConfigurationError::InvalidZone { .. })
        ));
        assert!(matches!(
            ZoneClassifier::new(vec![
                ZoneDef::rect("q", 0.0, 0.0, 1.0, 1.0),
                ZoneDef::rect("q", 0.0, 0.0, 0.5, 0.5),
            ]),
            Err(ConfigurationError::DuplicateZone(_))
        ));
    }
}
