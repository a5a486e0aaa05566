//! Per-connection task on the coordinator side
//!
//! The task owns both halves of the socket. Everything else that wants to
//! talk to the node goes through the [`Outbound`] channel stored in the node's
//! registry record.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use chrono::Utc;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, instrument, trace, warn};

use super::{Shared, registry::NodeRecord};
use crate::{
    Metric,
    error::ConnectionError,
    protocol::{
        COORDINATOR_ID, Message, Payload,
        frame::{MessageReader, MessageWriter, Received},
    },
};

const OUTBOUND_CAPACITY: usize = 64;

/// A message queued for delivery to the node behind a connection
#[derive(Debug)]
pub struct Outbound {
    pub(crate) message: Message,
    /// Set for QUERY messages; completed when the matching RESPONSE arrives
    pub(crate) reply: Option<(u64, oneshot::Sender<Vec<Metric>>)>,
}

impl Outbound {
    pub(crate) fn message(message: Message) -> Self {
        Self {
            message,
            reply: None,
        }
    }
}

enum Flow {
    Continue,
    Close,
}

pub(crate) struct Connection {
    id: u64,
    peer: SocketAddr,
    shared: Arc<Shared>,
    reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    node_id: Option<String>,
    pending: HashMap<u64, oneshot::Sender<Vec<Metric>>>,
    protocol_errors: u32,
}

impl Connection {
    pub(crate) fn new(id: u64, stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        Self {
            id,
            peer,
            shared,
            reader: MessageReader::new(read_half),
            writer: MessageWriter::new(write_half),
            outbound_tx,
            outbound_rx,
            node_id: None,
            pending: HashMap::new(),
            protocol_errors: 0,
        }
    }

    #[instrument(skip_all, fields(peer = %self.peer, connection = self.id))]
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        debug!("connection opened");

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = stop.changed() => {
                    debug!("stop signal received");
                    break;
                }

                Some(outbound) = self.outbound_rx.recv() => {
                    if let Err(e) = self.write(outbound, &mut stop).await {
                        warn!("failed to write to node: {e}");
                        break;
                    }
                }

                received = self.reader.recv() => {
                    match received {
                        Ok(Received::Message(message)) => {
                            self.protocol_errors = 0;
                            if let Flow::Close = self.dispatch(message, &mut stop).await {
                                break;
                            }
                        }
                        Ok(Received::Invalid(e)) => {
                            self.protocol_errors += 1;
                            warn!(
                                "dropping undecodable message ({}/{}): {e}",
                                self.protocol_errors, self.shared.config.max_protocol_errors
                            );
                            if self.protocol_errors >= self.shared.config.max_protocol_errors {
                                warn!("too many consecutive protocol errors, closing connection");
                                break;
                            }
                        }
                        Ok(Received::Closed) => {
                            debug!("peer closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!("connection failed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        self.close().await;
    }

    async fn write(
        &mut self,
        outbound: Outbound,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        if let Some((request_id, respond_to)) = outbound.reply {
            // forget queries whose caller already gave up
            self.pending.retain(|_, pending| !pending.is_closed());
            self.pending.insert(request_id, respond_to);
        }

        trace!(
            "sending {} to {}",
            outbound.message.kind(),
            outbound.message.target
        );
        self.send(&outbound.message, stop).await
    }

    /// Write one message, bounded by `write_timeout` and abandoned on stop
    ///
    /// Either way out leaves a partial frame behind, so callers close the
    /// connection on error.
    async fn send(
        &mut self,
        message: &Message,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let limit = self.shared.config.write_timeout;
        tokio::select! {
            sent = self.writer.send_within(message, limit) => sent,
            _ = stop.wait_for(|stopped| *stopped) => Err(ConnectionError::Interrupted),
        }
    }

    async fn dispatch(&mut self, message: Message, stop: &mut watch::Receiver<bool>) -> Flow {
        let kind = message.kind();
        let Message {
            source, payload, ..
        } = message;
        trace!("received {kind} from {source}");

        match payload {
            Payload::Join { node_id } => {
                self.register(node_id).await;
            }

            Payload::Leave => {
                if let Some(node_id) = self.node_id.take() {
                    if self.shared.registry.remove_if_owned(&node_id, self.id).await {
                        info!("node {node_id} left");
                    }
                }
            }

            Payload::Metric { metrics } => {
                let count = metrics.len();
                let mut monitor = self.shared.monitor.lock().await;
                let raised: usize = metrics
                    .into_iter()
                    .map(|metric| monitor.ingest(&source, metric))
                    .sum();
                trace!("ingested {count} metrics from {source}, {raised} alerts raised");
            }

            Payload::Heartbeat => match &self.node_id {
                Some(node_id) => {
                    self.shared.registry.touch_if_owned(node_id, self.id, Utc::now()).await;
                }
                None => debug!("heartbeat from {source} before JOIN"),
            },

            Payload::Query { request_id, query } => {
                let result = self.shared.monitor.lock().await.get_metrics(&query);
                let response = Message::new(
                    COORDINATOR_ID,
                    source,
                    Payload::Response { request_id, result },
                );
                if let Err(e) = self.send(&response, stop).await {
                    warn!("failed to answer query {request_id}: {e}");
                    return Flow::Close;
                }
            }

            Payload::Response { request_id, result } => match self.pending.remove(&request_id) {
                Some(respond_to) => {
                    // the caller may have timed out already
                    let _ = respond_to.send(result);
                }
                None => debug!("response {request_id} from {source} matches no pending query"),
            },

            Payload::Status(report) => match &self.node_id {
                Some(node_id) => {
                    debug!("{node_id} reports state {}", report.state);
                    self.shared
                        .registry
                        .set_status_if_owned(node_id, self.id, report)
                        .await;
                }
                None => debug!("status from {source} before JOIN"),
            },

            Payload::Config { .. } | Payload::Alert { .. } => {
                warn!("ignoring {kind} sent by node {source}");
            }
        }

        Flow::Continue
    }

    async fn register(&mut self, node_id: String) {
        if let Some(previous) = self.node_id.take() {
            if previous != node_id {
                self.shared.registry.remove_if_owned(&previous, self.id).await;
            }
        }

        let record = NodeRecord::new(
            node_id.clone(),
            self.peer,
            self.id,
            self.outbound_tx.clone(),
        );
        self.shared.registry.register(record).await;
        self.node_id = Some(node_id);
    }

    async fn close(mut self) {
        if let Some(node_id) = &self.node_id {
            if self.shared.registry.remove_if_owned(node_id, self.id).await {
                info!("node {node_id} disconnected");
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            trace!("shutdown of write half failed: {e}");
        }
        debug!("connection closed");
    }
}
