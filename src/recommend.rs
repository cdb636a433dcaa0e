//! Rule-based operational recommendations.
//!
//! `recommend` is a pure function of a snapshot and a rule table. Rules are
//! evaluated independently and the result keeps declaration order, so several
//! recommendations may fire at once.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::metrics::MetricsSnapshot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    #[serde(alias = ">")]
    Above,
    #[serde(alias = ">=")]
    AtLeast,
    #[serde(alias = "<")]
    Below,
    #[serde(alias = "<=")]
    AtMost,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::AtLeast => value >= threshold,
            Self::Below => value < threshold,
            Self::AtMost => value <= threshold,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// `metric <comparison> threshold => message`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRule {
    /// Derived metric name, or one of `live_tracks`, `unzoned`,
    /// `avg_dwell_secs`, `count.<label>`, `zone.<id>`.
    pub metric: String,
    #[serde(default)]
    pub comparison: Comparison,
    pub threshold: f64,
    #[serde(default)]
    pub severity: Severity,
    pub message: String,
}

impl RecommendationRule {
    pub fn fires(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub message: String,
    pub metric_reference: String,
    pub value: f64,
    pub threshold: f64,
}

pub fn recommend(snapshot: &MetricsSnapshot, rules: &[RecommendationRule]) -> Vec<Recommendation> {
    rules
        .iter()
        .filter_map(|rule| {
            let Some(value) = snapshot.metric_value(&rule.metric) else {
                log::debug!("rule references unknown metric '{}'", rule.metric);
                return None;
            };
            rule.fires(value).then(|| Recommendation {
                severity: rule.severity,
                message: rule.message.clone(),
                metric_reference: rule.metric.clone(),
                value,
                threshold: rule.threshold,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::BusinessType;

    fn rule(metric: &str, comparison: Comparison, threshold: f64, severity: Severity) -> RecommendationRule {
        RecommendationRule {
            metric: metric.to_string(),
            comparison,
            threshold,
            severity,
            message: format!("{} tripped", metric),
        }
    }

    fn snapshot() -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::empty(BusinessType::Pharmacy, "counter-cam");
        snap.counts_by_class.insert("person".to_string(), 6);
        snap.density_by_zone.insert("queue".to_string(), 5);
        snap.derived.insert("occupancy_rate".to_string(), 0.4);
        snap.total_live = 6;
        snap
    }

    #[test]
    fn fires_in_declaration_order() {
        let rules = vec![
            rule("zone.queue", Comparison::Above, 4.0, Severity::Info),
            rule("count.person", Comparison::AtLeast, 6.0, Severity::Critical),
            rule("occupancy_rate", Comparison::Below, 0.5, Severity::Warning),
        ];
        let recs = recommend(&snapshot(), &rules);
        let refs: Vec<&str> = recs.iter().map(|r| r.metric_reference.as_str()).collect();
        assert_eq!(refs, vec!["zone.queue", "count.person", "occupancy_rate"]);
        assert_eq!(recs[1].severity, Severity::Critical);
        assert_eq!(recs[0].value, 5.0);
    }

    #[test]
    fn quiet_rules_and_unknown_metrics_produce_nothing() {
        let rules = vec![
            rule("zone.queue", Comparison::AtMost, 1.0, Severity::Info),
            rule("no_such_metric", Comparison::Above, 0.0, Severity::Info),
        ];
        assert!(recommend(&snapshot(), &rules).is_empty());
    }

    #[test]
    fn comparison_boundaries() {
        assert!(!Comparison::Above.holds(4.0, 4.0));
        assert!(Comparison::AtLeast.holds(4.0, 4.0));
        assert!(!Comparison::Below.holds(4.0, 4.0));
        assert!(Comparison::AtMost.holds(4.0, 4.0));
    }

    #[test]
    fn rule_parses_with_defaults() {
        let rule: RecommendationRule =
            toml::from_str("metric = \"zone.queue\"\nthreshold = 4\nmessage = \"open a second till\"")
                .unwrap();
        assert_eq!(rule.comparison, Comparison::Above);
        assert_eq!(rule.severity, Severity::Warning);
    }
}
