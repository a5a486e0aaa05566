//! Persistent record of aggregated alerts
//!
//! The coordinator appends every alert a sweep produces. Entries can later be
//! marked resolved, filtered, and summarized for dashboards.
//!
//! ## Backends
//!
//! - **Memory**: bounded, lost on restart
//! - **SQLite** (feature `storage-sqlite`): embedded database with migrations

pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{Alert, AlertLevel};

pub use self::{
    error::{HistoryError, HistoryResult},
    memory::MemoryHistory,
};

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// A stored alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    #[serde(flatten)]
    pub alert: Alert,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub level: Option<AlertLevel>,
    #[serde(default)]
    pub metric: Option<String>,
    /// Matches the alert's `source_node`
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            level: None,
            metric: None,
            source: None,
            resolved: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl HistoryFilter {
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.level.is_none_or(|level| entry.alert.level == level)
            && self
                .metric
                .as_ref()
                .is_none_or(|metric| &entry.alert.metric == metric)
            && self
                .source
                .as_ref()
                .is_none_or(|source| &entry.alert.source_node == source)
            && self.resolved.is_none_or(|resolved| entry.resolved == resolved)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub resolved: u64,
    pub by_level: BTreeMap<String, u64>,
    pub by_metric: BTreeMap<String, u64>,
}

/// Storage for alerts produced by the coordinator
///
/// Implementations must be `Send + Sync`; they are shared between the sweep
/// task and the read API.
#[async_trait]
pub trait AlertHistory: Send + Sync {
    /// Store an alert and return its id
    async fn append(&self, alert: &Alert) -> HistoryResult<i64>;

    /// Mark an entry resolved
    ///
    /// Returns `false` when no unresolved entry with that id exists.
    async fn resolve(&self, id: i64) -> HistoryResult<bool>;

    /// Matching entries, newest first, at most `filter.limit`
    async fn query(&self, filter: &HistoryFilter) -> HistoryResult<Vec<HistoryEntry>>;

    async fn stats(&self) -> HistoryResult<HistoryStats>;
}

/// Alert history backend selection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum HistoryConfig {
    Memory {
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
    },
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig::Memory {
            capacity: default_memory_capacity(),
        }
    }
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./alerts.db")
}

impl HistoryConfig {
    pub async fn open(&self) -> HistoryResult<Arc<dyn AlertHistory>> {
        match self {
            HistoryConfig::Memory { capacity } => Ok(Arc::new(MemoryHistory::new(*capacity))),
            #[cfg(feature = "storage-sqlite")]
            HistoryConfig::Sqlite { path } => Ok(Arc::new(sqlite::SqliteHistory::new(path).await?)),
            #[cfg(not(feature = "storage-sqlite"))]
            HistoryConfig::Sqlite { .. } => Err(HistoryError::ConnectionFailed(
                "built without the storage-sqlite feature".to_string(),
            )),
        }
    }
}
