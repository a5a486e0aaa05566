use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Metric, alerts::AlertLevel, error::ConfigurationError};

/// Comparison applied between a metric value and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "==")]
    Equal,
}

impl Operator {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::LessThan => value < threshold,
            Operator::GreaterThan => value > threshold,
            Operator::Equal => value == threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::GreaterThan => ">",
            Operator::Equal => "==",
        }
    }
}

impl FromStr for Operator {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Operator::LessThan),
            ">" => Ok(Operator::GreaterThan),
            "==" => Ok(Operator::Equal),
            other => Err(ConfigurationError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold rule as it appears in configuration files and CONFIG messages
///
/// Operator and level stay plain strings here so that an invalid rule is
/// rejected with a [`ConfigurationError`] at registration instead of failing
/// somewhere inside deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub metric: String,
    pub operator: String,
    pub value: f64,
    #[serde(default)]
    pub sustained_for_secs: u64,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    AlertLevel::Warning.to_string()
}

impl From<&AlertThreshold> for ThresholdConfig {
    fn from(threshold: &AlertThreshold) -> Self {
        Self {
            id: Some(threshold.id.clone()),
            metric: threshold.metric.clone(),
            operator: threshold.operator.to_string(),
            value: threshold.threshold_value,
            sustained_for_secs: threshold.sustained_for.as_secs(),
            level: threshold.level.to_string(),
        }
    }
}

/// A validated standing rule
#[derive(Debug, Clone, PartialEq)]
pub struct AlertThreshold {
    pub id: String,
    pub metric: String,
    pub operator: Operator,
    pub threshold_value: f64,
    /// How long a violation must persist before the rule fires
    pub sustained_for: Duration,
    pub level: AlertLevel,
}

impl AlertThreshold {
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        operator: &str,
        threshold_value: f64,
        sustained_for: Duration,
        level: &str,
    ) -> Result<Self, ConfigurationError> {
        let threshold = Self {
            id: id.into(),
            metric: metric.into(),
            operator: operator.parse()?,
            threshold_value,
            sustained_for,
            level: level.parse()?,
        };
        threshold.validate()?;
        Ok(threshold)
    }

    pub fn from_config(
        config: &ThresholdConfig,
        fallback_id: impl FnOnce() -> String,
    ) -> Result<Self, ConfigurationError> {
        let id = config.id.clone().unwrap_or_else(fallback_id);
        Self::new(
            id,
            config.metric.clone(),
            &config.operator,
            config.value,
            Duration::from_secs(config.sustained_for_secs),
            &config.level,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::InvalidRule(
                "rule id must not be empty".to_string(),
            ));
        }
        if self.metric.trim().is_empty() {
            return Err(ConfigurationError::InvalidRule(format!(
                "rule '{}' has an empty metric name",
                self.id
            )));
        }
        if !self.threshold_value.is_finite() {
            return Err(ConfigurationError::InvalidRule(format!(
                "rule '{}' has a non-finite threshold value",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether `metric` violates this rule on its own
    ///
    /// Pure function of the rule and the sample; the sustained duration is
    /// tracked separately by [`Streak`].
    pub fn check(&self, metric: &Metric) -> bool {
        self.metric == metric.name && self.operator.apply(metric.value, self.threshold_value)
    }
}

/// Outcome of feeding one sample into a violation streak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdEvaluation {
    /// No violation and nothing fired before
    Ok,
    /// Violating, but not yet for the required duration
    Pending,
    /// Violating for at least the required duration
    Firing,
    /// First favorable sample after the rule fired
    Recovered,
}

impl ThresholdEvaluation {
    pub fn evaluate(
        violating: bool,
        violating_for: Duration,
        sustained_for: Duration,
        fired: bool,
    ) -> ThresholdEvaluation {
        if !violating {
            if fired {
                return ThresholdEvaluation::Recovered;
            }
            return ThresholdEvaluation::Ok;
        }

        if violating_for >= sustained_for {
            return ThresholdEvaluation::Firing;
        }

        ThresholdEvaluation::Pending
    }
}

/// Consecutive-violation state for one `(rule, node)` pair
#[derive(Debug, Clone, Copy, Default)]
pub struct Streak {
    started_at: Option<DateTime<Utc>>,
    fired: bool,
}

impl Streak {
    pub fn observe(
        &mut self,
        violating: bool,
        observed_at: DateTime<Utc>,
        sustained_for: Duration,
    ) -> ThresholdEvaluation {
        let violating_for = match (violating, self.started_at) {
            (true, Some(started_at)) => (observed_at - started_at).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let evaluation =
            ThresholdEvaluation::evaluate(violating, violating_for, sustained_for, self.fired);

        match evaluation {
            ThresholdEvaluation::Ok | ThresholdEvaluation::Recovered => {
                self.started_at = None;
                self.fired = false;
            }
            ThresholdEvaluation::Pending => {
                self.started_at.get_or_insert(observed_at);
            }
            ThresholdEvaluation::Firing => {
                self.started_at.get_or_insert(observed_at);
                self.fired = true;
            }
        }

        evaluation
    }

    pub fn is_violating(&self) -> bool {
        self.started_at.is_some()
    }
}
