//! Connected nodes as seen by the coordinator

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use super::connection::Outbound;
use crate::protocol::StatusReport;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub peer: SocketAddr,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_status: Option<StatusReport>,
    /// Connection that registered this record
    pub(crate) connection_id: u64,
    /// Channel into the connection task, which owns the socket
    pub(crate) outbound: mpsc::Sender<Outbound>,
}

impl NodeRecord {
    pub(crate) fn new(
        node_id: String,
        peer: SocketAddr,
        connection_id: u64,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            peer,
            joined_at: now,
            last_heartbeat_at: now,
            last_status: None,
            connection_id,
            outbound,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        (now - self.last_heartbeat_at)
            .to_std()
            .is_ok_and(|silent_for| silent_for > threshold)
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id.clone(),
            peer: self.peer.to_string(),
            joined_at: self.joined_at,
            last_heartbeat_at: self.last_heartbeat_at,
            last_status: self.last_status.clone(),
        }
    }
}

/// Serializable view of a [`NodeRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub peer: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_status: Option<StatusReport>,
}

/// Node records keyed by node id
///
/// Every operation takes the lock exactly once, so read-then-write sequences
/// such as stale eviction cannot interleave with a concurrent JOIN.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<Mutex<HashMap<String, NodeRecord>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record`, returning the record it replaced
    pub async fn register(&self, record: NodeRecord) -> Option<NodeRecord> {
        let mut nodes = self.nodes.lock().await;
        let node_id = record.node_id.clone();
        let previous = nodes.insert(node_id.clone(), record);
        match &previous {
            Some(previous) => info!(
                "node {node_id} re-joined, replacing registration from {}",
                previous.peer
            ),
            None => info!("node {node_id} joined"),
        }
        previous
    }

    pub async fn remove(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.lock().await.remove(node_id)
    }

    /// Remove `node_id` only while it is still registered by `connection_id`
    pub(crate) async fn remove_if_owned(&self, node_id: &str, connection_id: u64) -> bool {
        let mut nodes = self.nodes.lock().await;
        let owned = nodes
            .get(node_id)
            .is_some_and(|record| record.connection_id == connection_id);
        if owned {
            nodes.remove(node_id);
        }
        owned
    }

    pub async fn touch(&self, node_id: &str, at: DateTime<Utc>) -> bool {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.last_heartbeat_at = at;
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, node_id: &str, status: StatusReport) -> bool {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.last_status = Some(status);
                true
            }
            None => false,
        }
    }

    /// Refresh the heartbeat of `node_id` only while `connection_id` owns it
    pub(crate) async fn touch_if_owned(
        &self,
        node_id: &str,
        connection_id: u64,
        at: DateTime<Utc>,
    ) -> bool {
        self.update_owned(node_id, connection_id, |record| record.last_heartbeat_at = at)
            .await
    }

    pub(crate) async fn set_status_if_owned(
        &self,
        node_id: &str,
        connection_id: u64,
        status: StatusReport,
    ) -> bool {
        self.update_owned(node_id, connection_id, |record| {
            record.last_status = Some(status)
        })
        .await
    }

    async fn update_owned(
        &self,
        node_id: &str,
        connection_id: u64,
        update: impl FnOnce(&mut NodeRecord),
    ) -> bool {
        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(node_id) {
            Some(record) if record.connection_id == connection_id => {
                update(record);
                true
            }
            Some(_) => {
                debug!("{node_id} is owned by another connection");
                false
            }
            None => false,
        }
    }

    pub(crate) async fn sender(&self, node_id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.nodes
            .lock()
            .await
            .get(node_id)
            .map(|record| record.outbound.clone())
    }

    pub(crate) async fn senders(&self) -> Vec<(String, mpsc::Sender<Outbound>)> {
        self.nodes
            .lock()
            .await
            .values()
            .map(|record| (record.node_id.clone(), record.outbound.clone()))
            .collect()
    }

    /// Drop every node whose last heartbeat is older than `threshold`
    pub async fn evict_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut nodes = self.nodes.lock().await;
        let stale: Vec<String> = nodes
            .values()
            .filter(|record| record.is_stale(now, threshold))
            .map(|record| record.node_id.clone())
            .collect();

        for node_id in &stale {
            nodes.remove(node_id);
            info!("evicted stale node {node_id}");
        }
        if stale.is_empty() {
            debug!("no stale nodes");
        }
        stale
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeSummary> {
        self.nodes.lock().await.get(node_id).map(NodeRecord::summary)
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.nodes.lock().await.contains_key(node_id)
    }

    /// All nodes sorted by id
    pub async fn snapshot(&self) -> Vec<NodeSummary> {
        let mut summaries: Vec<_> = self
            .nodes
            .lock()
            .await
            .values()
            .map(NodeRecord::summary)
            .collect();
        summaries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }
}
