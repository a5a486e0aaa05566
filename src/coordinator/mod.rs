//! Central coordinator
//!
//! Accepts node connections, keeps the node registry and the shared
//! [`Monitor`], and runs the periodic alert sweep.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Metric, MetricQuery,
    config::CoordinatorConfig,
    error::CoordinatorError,
    history::AlertHistory,
    monitors::Monitor,
    notify::Notifier,
    protocol::{COORDINATOR_ID, ConfigUpdate, Message, Payload},
};

mod connection;
mod registry;
mod sweep;

use connection::{Connection, Outbound};

/// Pause after a failed `accept`, e.g. when the process ran out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
pub use registry::{NodeRecord, NodeRegistry, NodeSummary};
pub use sweep::{SweepHandle, SweepReport};

/// State every connection task and the sweep share
pub(crate) struct Shared {
    pub(crate) registry: NodeRegistry,
    pub(crate) monitor: Arc<Mutex<Monitor>>,
    pub(crate) notifier: Notifier,
    pub(crate) history: Option<Arc<dyn AlertHistory>>,
    pub(crate) config: CoordinatorConfig,
    next_request_id: AtomicU64,
    next_connection_id: AtomicU64,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_stop: watch::Sender<bool>,
    connection_stop: watch::Sender<bool>,
    accept_task: JoinHandle<JoinSet<()>>,
    sweep: SweepHandle,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Bind the listener and spawn the accept loop and the sweep task
    ///
    /// Thresholds from the configuration are registered before the first
    /// connection is accepted.
    #[instrument(skip_all, fields(addr = %config.bind_addr()))]
    pub async fn start(
        config: CoordinatorConfig,
        notifier: Notifier,
        history: Option<Arc<dyn AlertHistory>>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let mut monitor = Monitor::new(config.retention);
        for threshold in &config.thresholds {
            let id = monitor.add_threshold_config(threshold)?;
            debug!("registered threshold {id}");
        }

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CoordinatorError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| CoordinatorError::Bind { addr, source })?;

        let sweep_interval = config.sweep_interval;
        let shared = Arc::new(Shared {
            registry: NodeRegistry::new(),
            monitor: Arc::new(Mutex::new(monitor)),
            notifier,
            history,
            config,
            next_request_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
        });

        let (accept_stop, accept_stop_rx) = watch::channel(false);
        let (connection_stop, connection_stop_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            accept_stop_rx.clone(),
            connection_stop_rx,
        ));
        let sweep = SweepHandle::spawn(shared.clone(), sweep_interval, accept_stop_rx);

        info!("coordinator listening on {local_addr}");

        Ok(Self {
            shared,
            local_addr,
            accept_stop,
            connection_stop,
            accept_task,
            sweep,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.shared.registry
    }

    pub fn monitor(&self) -> Arc<Mutex<Monitor>> {
        self.shared.monitor.clone()
    }

    pub fn history(&self) -> Option<Arc<dyn AlertHistory>> {
        self.shared.history.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub async fn nodes(&self) -> Vec<NodeSummary> {
        self.shared.registry.snapshot().await
    }

    /// Run a sweep right away and report what it did
    pub async fn sweep_now(&self) -> Result<SweepReport, CoordinatorError> {
        self.sweep.sweep_now().await
    }

    /// Send a CONFIG message to one node
    pub async fn send_config(
        &self,
        node_id: &str,
        update: ConfigUpdate,
    ) -> Result<(), CoordinatorError> {
        let sender = self
            .shared
            .registry
            .sender(node_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownNode(node_id.to_string()))?;

        let message = Message::new(COORDINATOR_ID, node_id, Payload::Config { config: update });
        sender
            .send(Outbound::message(message))
            .await
            .map_err(|_| CoordinatorError::ConnectionClosed(node_id.to_string()))
    }

    /// Send a CONFIG message to every registered node
    ///
    /// Returns the number of nodes the message was queued for.
    pub async fn broadcast_config(&self, update: ConfigUpdate) -> usize {
        let mut queued = 0;
        for (node_id, sender) in self.shared.registry.senders().await {
            let message = Message::new(
                COORDINATOR_ID,
                node_id.clone(),
                Payload::Config {
                    config: update.clone(),
                },
            );
            match sender.send(Outbound::message(message)).await {
                Ok(()) => queued += 1,
                Err(_) => warn!("could not send config to {node_id}: connection closed"),
            }
        }
        queued
    }

    /// Ask a node for its locally stored metrics and wait for the answer
    #[instrument(skip(self, query))]
    pub async fn query_node(
        &self,
        node_id: &str,
        query: MetricQuery,
    ) -> Result<Vec<Metric>, CoordinatorError> {
        let sender = self
            .shared
            .registry
            .sender(node_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownNode(node_id.to_string()))?;

        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let outbound = Outbound {
            message: Message::new(
                COORDINATOR_ID,
                node_id,
                Payload::Query { request_id, query },
            ),
            reply: Some((request_id, tx)),
        };

        sender
            .send(outbound)
            .await
            .map_err(|_| CoordinatorError::ConnectionClosed(node_id.to_string()))?;

        let query_timeout = self.shared.config.query_timeout;
        match timeout(query_timeout, rx).await {
            Ok(Ok(metrics)) => Ok(metrics),
            Ok(Err(_)) => Err(CoordinatorError::ConnectionClosed(node_id.to_string())),
            Err(_) => Err(CoordinatorError::QueryTimeout {
                node: node_id.to_string(),
                timeout: query_timeout,
            }),
        }
    }

    /// Stop accepting, stop the sweep and wind down every connection
    ///
    /// Connections get `drain_timeout` to finish on their own before they are
    /// told to stop.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        info!("shutting down coordinator");
        let _ = self.accept_stop.send(true);

        let mut connections = match self.accept_task.await {
            Ok(connections) => connections,
            Err(e) => {
                error!("accept task ended abnormally: {e}");
                JoinSet::new()
            }
        };

        self.sweep.shutdown().await;

        let drain_timeout = self.shared.config.drain_timeout;
        let drained = timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            debug!(
                "{} connections still open after {drain_timeout:?}, stopping them",
                connections.len()
            );
            let _ = self.connection_stop.send(true);
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    error!("connection task ended abnormally: {e}");
                }
            }
        }

        info!("coordinator stopped");
    }
}

#[instrument(skip_all)]
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
    connection_stop: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("no longer accepting connections");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        debug!("accepted connection {id} from {peer}");
                        let connection = Connection::new(id, stream, peer, shared.clone());
                        connections.spawn(connection.run(connection_stop.clone()));
                    }
                    Err(e) => {
                        warn!("failed to accept connection, pausing for {ACCEPT_ERROR_BACKOFF:?}: {e}");
                        if !pause_unless_stopped(ACCEPT_ERROR_BACKOFF, &mut stop).await {
                            debug!("no longer accepting connections");
                            break;
                        }
                    }
                }
            }

            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    error!("connection task ended abnormally: {e}");
                }
            }
        }
    }

    connections
}

/// Sleep for `delay`; `false` if `stop` fired first
async fn pause_unless_stopped(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.wait_for(|stopped| *stopped) => false,
    }
}
