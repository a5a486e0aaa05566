use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigurationError, monitors::threshold::Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl FromStr for AlertLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(AlertLevel::Info),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            _ => Err(ConfigurationError::UnknownLevel(s.to_string())),
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold violation, either fresh from a monitor or aggregated by a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub metric: String,
    pub observed_value: f64,
    pub threshold_value: f64,
    pub operator: Operator,
    pub level: AlertLevel,
    pub source_node: String,
    pub raised_at: DateTime<Utc>,
    /// Every node that contributed to this alert
    pub nodes: BTreeSet<String>,
}

impl Alert {
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {} on {}",
            self.metric, self.observed_value, self.operator, self.threshold_value, self.source_node
        )
    }

    /// Comma separated list of contributing nodes
    pub fn node_list(&self) -> String {
        self.nodes.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Collapse alerts sharing `(metric, level)` into one alert per group
///
/// Groups keep the order in which they were first seen. The representative of
/// a group is the member with the latest `raised_at`; on equal timestamps the
/// one later in `alerts` wins. Its `nodes` becomes the union of all members'
/// `nodes`, so aggregating an already aggregated list changes nothing.
pub fn aggregate_alerts(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut groups: Vec<Alert> = Vec::new();
    let mut index: HashMap<(String, AlertLevel), usize> = HashMap::new();

    for alert in alerts {
        let key = (alert.metric.clone(), alert.level);
        match index.get(&key).copied() {
            Some(position) => {
                let current = &mut groups[position];
                let mut nodes = std::mem::take(&mut current.nodes);
                nodes.extend(alert.nodes.iter().cloned());
                if alert.raised_at >= current.raised_at {
                    *current = alert;
                }
                current.nodes = nodes;
            }
            None => {
                index.insert(key, groups.len());
                groups.push(alert);
            }
        }
    }

    groups
}
