pub mod alerts;
pub mod api;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod monitors;
pub mod node;
pub mod notify;
pub mod protocol;
pub mod util;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single observed measurement
///
/// Metrics are facts: once observed they are never mutated, only appended to a
/// monitor's log and eventually evicted by its retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Dotted name, e.g. `cpu.percent`
    pub name: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            observed_at: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Whether every `(key, value)` pair in `tags` is present on this metric
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.iter()
            .all(|(key, value)| self.tags.get(key).is_some_and(|v| v == value))
    }
}

/// One snapshot produced by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub collected_at: DateTime<Utc>,
    pub metrics: Vec<Metric>,
}

impl MetricBatch {
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Filter for metric queries; absent fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl MetricQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            tags: None,
        }
    }

    pub fn matches(&self, metric: &Metric) -> bool {
        let name_matches = self.name.as_ref().is_none_or(|name| &metric.name == name);
        let tags_match = self
            .tags
            .as_ref()
            .is_none_or(|tags| metric.matches_tags(tags));
        name_matches && tags_match
    }
}
