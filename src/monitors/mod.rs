//! Metric storage and threshold evaluation
//!
//! A [`Monitor`] is used on both sides of the wire: the coordinator keeps one for
//! the whole fleet, and every node keeps a local one for its own samples.

pub mod threshold;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info, instrument, trace};

use crate::{
    Metric, MetricQuery,
    alerts::{Alert, AlertLevel},
    error::ConfigurationError,
};

use self::threshold::{AlertThreshold, Streak, ThresholdConfig, ThresholdEvaluation};

/// Samples kept per metric name unless configured otherwise
pub const DEFAULT_RETENTION: usize = 1000;

/// A metric together with the node that reported it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMetric {
    /// Global insertion sequence, used to restore arrival order across names
    pub seq: u64,
    pub source: String,
    #[serde(flatten)]
    pub metric: Metric,
}

#[derive(Debug)]
pub struct Monitor {
    thresholds: Vec<AlertThreshold>,
    metrics: HashMap<String, VecDeque<StoredMetric>>,
    retention: usize,
    next_seq: u64,
    next_rule: u64,
    alerts: Vec<Alert>,
    streaks: HashMap<(String, String), Streak>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl Monitor {
    pub fn new(retention: usize) -> Self {
        Self {
            thresholds: Vec::new(),
            metrics: HashMap::new(),
            retention: retention.max(1),
            next_seq: 0,
            next_rule: 0,
            alerts: Vec::new(),
            streaks: HashMap::new(),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn thresholds(&self) -> &[AlertThreshold] {
        &self.thresholds
    }

    /// Register a validated rule
    pub fn add_threshold(&mut self, threshold: AlertThreshold) -> Result<(), ConfigurationError> {
        threshold.validate()?;
        if self.thresholds.iter().any(|t| t.id == threshold.id) {
            return Err(ConfigurationError::DuplicateRule(threshold.id));
        }

        debug!(
            "registered rule {}: {} {} {} ({})",
            threshold.id,
            threshold.metric,
            threshold.operator,
            threshold.threshold_value,
            threshold.level
        );
        self.thresholds.push(threshold);
        Ok(())
    }

    /// Register a rule from its raw form, generating an id when none is given
    pub fn add_threshold_config(
        &mut self,
        config: &ThresholdConfig,
    ) -> Result<String, ConfigurationError> {
        let threshold = AlertThreshold::from_config(config, || self.generate_rule_id())?;
        let id = threshold.id.clone();
        self.add_threshold(threshold)?;
        Ok(id)
    }

    pub fn remove_threshold(&mut self, id: &str) -> bool {
        let before = self.thresholds.len();
        self.thresholds.retain(|t| t.id != id);
        self.streaks.retain(|(rule, _), _| rule != id);
        before != self.thresholds.len()
    }

    /// Swap the whole rule set
    ///
    /// Either every rule is accepted or the current set stays untouched.
    /// Violation streaks are reset because rule ids may now mean something else.
    pub fn replace_thresholds(
        &mut self,
        configs: &[ThresholdConfig],
    ) -> Result<(), ConfigurationError> {
        let mut seen = HashSet::new();
        let mut next_rule = self.next_rule;
        let mut replacement = Vec::with_capacity(configs.len());

        for config in configs {
            let threshold = AlertThreshold::from_config(config, || {
                next_rule += 1;
                format!("rule-{next_rule}")
            })?;
            if !seen.insert(threshold.id.clone()) {
                return Err(ConfigurationError::DuplicateRule(threshold.id));
            }
            replacement.push(threshold);
        }

        info!("replacing {} rules with {}", self.thresholds.len(), replacement.len());
        self.next_rule = next_rule;
        self.thresholds = replacement;
        self.streaks.clear();
        Ok(())
    }

    /// Store `metric` as reported by `source` and evaluate every matching rule
    ///
    /// Returns the number of alerts raised by this sample.
    #[instrument(skip(self, metric), fields(metric = %metric.name))]
    pub fn ingest(&mut self, source: &str, metric: Metric) -> usize {
        let mut raised = 0;

        for index in 0..self.thresholds.len() {
            let threshold = &self.thresholds[index];
            if threshold.metric != metric.name {
                continue;
            }

            let violating = threshold.check(&metric);
            let streak = self
                .streaks
                .entry((threshold.id.clone(), source.to_string()))
                .or_default();
            let evaluation = streak.observe(violating, metric.observed_at, threshold.sustained_for);

            match evaluation {
                ThresholdEvaluation::Firing => {
                    let alert = Self::build_alert(threshold, source, &metric);
                    self.create_alert(alert);
                    raised += 1;
                }
                ThresholdEvaluation::Pending => {
                    trace!("rule {} violated by {source}, not sustained yet", threshold.id);
                }
                ThresholdEvaluation::Recovered => {
                    info!("rule {} back to normal on {source}", threshold.id);
                }
                ThresholdEvaluation::Ok => {}
            }
        }

        self.store(source, metric);
        raised
    }

    /// Stored metrics matching `query`, oldest first
    pub fn get_metrics(&self, query: &MetricQuery) -> Vec<Metric> {
        self.get_stored(query)
            .into_iter()
            .map(|stored| stored.metric)
            .collect()
    }

    /// Like [`Monitor::get_metrics`] but keeps the reporting node
    pub fn get_stored(&self, query: &MetricQuery) -> Vec<StoredMetric> {
        let mut matching: Vec<StoredMetric> = match &query.name {
            Some(name) => self
                .metrics
                .get(name)
                .into_iter()
                .flatten()
                .filter(|stored| query.matches(&stored.metric))
                .cloned()
                .collect(),
            None => self
                .metrics
                .values()
                .flatten()
                .filter(|stored| query.matches(&stored.metric))
                .cloned()
                .collect(),
        };

        if query.name.is_none() {
            matching.sort_by_key(|stored| stored.seq);
        }
        matching
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pending alerts, optionally restricted to one level; the buffer is left as is
    pub fn get_alerts(&self, level: Option<AlertLevel>) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|alert| level.is_none_or(|level| alert.level == level))
            .cloned()
            .collect()
    }

    /// Take every pending alert, leaving the buffer empty
    pub fn drain_alerts(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.alerts)
    }

    fn build_alert(threshold: &AlertThreshold, source: &str, metric: &Metric) -> Alert {
        Alert {
            metric: metric.name.clone(),
            observed_value: metric.value,
            threshold_value: threshold.threshold_value,
            operator: threshold.operator,
            level: threshold.level,
            source_node: source.to_string(),
            raised_at: metric.observed_at,
            nodes: [source.to_string()].into(),
        }
    }

    fn create_alert(&mut self, alert: Alert) {
        info!("{} alert: {}", alert.level, alert.summary());
        self.alerts.push(alert);
    }

    fn store(&mut self, source: &str, metric: Metric) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let buffer = self.metrics.entry(metric.name.clone()).or_default();
        if buffer.len() >= self.retention {
            buffer.pop_front();
        }
        buffer.push_back(StoredMetric {
            seq,
            source: source.to_string(),
            metric,
        });
    }

    fn generate_rule_id(&mut self) -> String {
        self.next_rule += 1;
        format!("rule-{}", self.next_rule)
    }
}
