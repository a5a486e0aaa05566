use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AlertHistory, HistoryEntry, HistoryFilter, HistoryResult, HistoryStats};
use crate::alerts::Alert;

#[derive(Debug)]
struct Inner {
    entries: VecDeque<HistoryEntry>,
    next_id: i64,
}

/// Bounded in-memory history; the oldest entries fall out once `capacity` is reached
#[derive(Debug)]
pub struct MemoryHistory {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl AlertHistory for MemoryHistory {
    async fn append(&self, alert: &Alert) -> HistoryResult<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(HistoryEntry {
            id,
            alert: alert.clone(),
            resolved: false,
            resolved_at: None,
        });

        debug!("stored alert {id} in memory history");
        Ok(id)
    }

    async fn resolve(&self, id: i64) -> HistoryResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|entry| entry.id == id && !entry.resolved)
        else {
            return Ok(false);
        };

        entry.resolved = true;
        entry.resolved_at = Some(Utc::now());
        Ok(true)
    }

    async fn query(&self, filter: &HistoryFilter) -> HistoryResult<Vec<HistoryEntry>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<HistoryEntry> = inner
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.alert
                .raised_at
                .cmp(&a.alert.raised_at)
                .then(b.id.cmp(&a.id))
        });
        matching.truncate(filter.limit);
        Ok(matching)
    }

    async fn stats(&self) -> HistoryResult<HistoryStats> {
        let inner = self.inner.lock().await;
        let mut stats = HistoryStats::default();

        for entry in &inner.entries {
            stats.total += 1;
            if entry.resolved {
                stats.resolved += 1;
            }
            *stats
                .by_level
                .entry(entry.alert.level.to_string())
                .or_default() += 1;
            *stats
                .by_metric
                .entry(entry.alert.metric.clone())
                .or_default() += 1;
        }

        Ok(stats)
    }
}
