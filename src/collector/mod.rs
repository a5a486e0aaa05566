//! Host metric sampling on the node side
//!
//! Each [`Family`] gathers one category of counters through `sysinfo`. A
//! [`MetricCollector`] runs the enabled families in order and turns their output
//! into a [`MetricBatch`]. A family that fails is logged and left out of the
//! batch; the other families are unaffected.

mod cpu;
mod disk;
mod memory;
mod network;

use std::{fmt, path::PathBuf, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, instrument, warn};

use crate::{Metric, MetricBatch, error::ConfigurationError, protocol::ConfigUpdate};

pub use self::{
    cpu::CpuFamily, disk::DiskFamily, memory::MemoryFamily, network::NetworkFamily,
};

/// One category of host metrics
pub trait Family: Send {
    fn name(&self) -> &str;

    fn collect(&mut self) -> anyhow::Result<Vec<Metric>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 4] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::Disk,
        MetricFamily::Network,
    ];
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricFamily::Cpu => "cpu",
            MetricFamily::Memory => "memory",
            MetricFamily::Disk => "disk",
            MetricFamily::Network => "network",
        };
        f.write_str(name)
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_families() -> Vec<MetricFamily> {
    MetricFamily::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub interval: Duration,
    pub disk_path: PathBuf,
    pub families: Vec<MetricFamily>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            disk_path: default_disk_path(),
            families: default_families(),
        }
    }
}

impl CollectorConfig {
    /// Apply `update` to a copy of this config, validating every changed field
    pub fn updated(&self, update: &ConfigUpdate) -> Result<CollectorConfig, ConfigurationError> {
        let mut config = self.clone();

        if let Some(secs) = update.interval_secs {
            if secs == 0 {
                return Err(ConfigurationError::Invalid(
                    "collection interval must be at least one second".to_string(),
                ));
            }
            config.interval = Duration::from_secs(secs);
        }

        if let Some(path) = &update.disk_path {
            if path.trim().is_empty() {
                return Err(ConfigurationError::Invalid(
                    "disk path must not be empty".to_string(),
                ));
            }
            config.disk_path = PathBuf::from(path);
        }

        if let Some(families) = &update.families {
            let mut deduped = Vec::with_capacity(families.len());
            for family in families {
                if !deduped.contains(family) {
                    deduped.push(*family);
                }
            }
            config.families = deduped;
        }

        Ok(config)
    }
}

pub struct MetricCollector {
    config: CollectorConfig,
    families: Vec<Box<dyn Family>>,
}

impl fmt::Debug for MetricCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricCollector")
            .field("config", &self.config)
            .field(
                "families",
                &self.families.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl MetricCollector {
    pub fn new(config: CollectorConfig) -> Self {
        let families = build_families(&config);
        Self { config, families }
    }

    /// Collector running caller supplied families, mostly useful for tests
    pub fn with_families(config: CollectorConfig, families: Vec<Box<dyn Family>>) -> Self {
        Self { config, families }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Take one snapshot of every enabled family
    #[instrument(skip(self))]
    pub fn collect_all(&mut self) -> MetricBatch {
        let collected_at = Utc::now();
        let mut metrics = Vec::new();

        for family in &mut self.families {
            match family.collect() {
                Ok(mut collected) => {
                    for metric in &mut collected {
                        metric.observed_at = collected_at;
                    }
                    metrics.append(&mut collected);
                }
                Err(e) => warn!("{} collection failed, skipping: {e:#}", family.name()),
            }
        }

        debug!("collected {} metrics", metrics.len());
        MetricBatch {
            collected_at,
            metrics,
        }
    }

    /// Collect batches every interval until `stop` fires or `duration` elapses
    ///
    /// Without a duration the loop only ends through `stop`. The first batch is
    /// taken immediately.
    pub async fn start_collection(
        &mut self,
        duration: Option<Duration>,
        mut stop: watch::Receiver<bool>,
    ) -> Vec<MetricBatch> {
        let deadline = duration.map(|duration| Instant::now() + duration);
        let mut batches = Vec::new();

        loop {
            if *stop.borrow() {
                break;
            }

            batches.push(self.collect_all());

            let mut next = Instant::now() + self.config.interval;
            if let Some(deadline) = deadline {
                if next > deadline {
                    next = deadline;
                }
                if Instant::now() >= deadline {
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }

        batches
    }

    /// Validate and apply a CONFIG update
    pub fn update_config(&mut self, update: &ConfigUpdate) -> Result<(), ConfigurationError> {
        let config = self.config.updated(update)?;
        self.reconfigure(config);
        Ok(())
    }

    /// Install an already validated config, rebuilding families when they changed
    pub fn reconfigure(&mut self, config: CollectorConfig) {
        if config.families != self.config.families || config.disk_path != self.config.disk_path {
            self.families = build_families(&config);
        }
        debug!(?config, "collector reconfigured");
        self.config = config;
    }
}

fn build_families(config: &CollectorConfig) -> Vec<Box<dyn Family>> {
    config
        .families
        .iter()
        .map(|family| -> Box<dyn Family> {
            match family {
                MetricFamily::Cpu => Box::new(CpuFamily::new()),
                MetricFamily::Memory => Box::new(MemoryFamily::new()),
                MetricFamily::Disk => Box::new(DiskFamily::new(config.disk_path.clone())),
                MetricFamily::Network => Box::new(NetworkFamily::new()),
            }
        })
        .collect()
}
