//! Node agent
//!
//! Connects to the coordinator, reports metrics on an interval and reacts to
//! what the coordinator sends down the same connection.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected → Joining → Active → Leaving → Disconnected
//!                             └── peer closed ──┘
//! ```
//!
//! While active two tasks run: the reporting loop (collect, METRIC, HEARTBEAT)
//! and the receiving loop (CONFIG, QUERY, ALERT).

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    alerts::{Alert, aggregate_alerts},
    collector::MetricCollector,
    config::NodeConfig,
    error::{ConfigurationError, ConnectionError},
    monitors::Monitor,
    protocol::{
        COORDINATOR_ID, ConfigUpdate, Message, NodeState, Payload, StatusReport,
        frame::{MessageReader, MessageWriter, Received},
    },
};

type SharedWriter = Arc<Mutex<MessageWriter<OwnedWriteHalf>>>;

/// State both loops of one session work on
struct Context {
    node_id: String,
    retry_backoff: Duration,
    write_timeout: Duration,
    alert_buffer: usize,
    collector: Arc<Mutex<MetricCollector>>,
    monitor: Arc<Mutex<Monitor>>,
    received_alerts: Arc<Mutex<VecDeque<Alert>>>,
    state: Arc<watch::Sender<NodeState>>,
    stop: watch::Sender<bool>,
    writer: SharedWriter,
}

struct Session {
    context: Arc<Context>,
    reporting: Option<JoinHandle<()>>,
    receiving: Option<JoinHandle<()>>,
}

pub struct NodeAgent {
    config: NodeConfig,
    collector: Arc<Mutex<MetricCollector>>,
    monitor: Arc<Mutex<Monitor>>,
    received_alerts: Arc<Mutex<VecDeque<Alert>>>,
    state: Arc<watch::Sender<NodeState>>,
    session: Option<Session>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent").finish_non_exhaustive()
    }
}

impl NodeAgent {
    pub fn new(config: NodeConfig) -> Result<Self, ConfigurationError> {
        let collector = MetricCollector::new(config.collector_config());
        Self::with_collector(config, collector)
    }

    /// Agent reporting from a caller supplied collector
    pub fn with_collector(
        config: NodeConfig,
        collector: MetricCollector,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let mut monitor = Monitor::new(config.retention);
        for threshold in &config.thresholds {
            monitor.add_threshold_config(threshold)?;
        }

        let (state, _) = watch::channel(NodeState::Disconnected);

        Ok(Self {
            config,
            collector: Arc::new(Mutex::new(collector)),
            monitor: Arc::new(Mutex::new(monitor)),
            received_alerts: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(state),
            session: None,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// The node's own monitor, fed with every collected metric
    pub fn monitor(&self) -> Arc<Mutex<Monitor>> {
        self.monitor.clone()
    }

    pub fn collector(&self) -> Arc<Mutex<MetricCollector>> {
        self.collector.clone()
    }

    /// ALERTs pushed by the coordinator, oldest first
    pub async fn received_alerts(&self) -> Vec<Alert> {
        self.received_alerts.lock().await.iter().cloned().collect()
    }

    /// Connect, announce this node and start both loops
    ///
    /// Connecting is retried with a doubling backoff, at most
    /// `connect_retries` times. The agent counts as active as soon as the JOIN
    /// was written; the coordinator does not acknowledge it.
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn start(&mut self) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            debug!("agent already started");
            return Ok(());
        }

        self.state.send_replace(NodeState::Joining);

        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.send_replace(NodeState::Disconnected);
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut writer = MessageWriter::new(write_half);

        let join = Message::new(
            &self.config.node_id,
            COORDINATOR_ID,
            Payload::Join {
                node_id: self.config.node_id.clone(),
            },
        );
        if let Err(e) = writer.send_within(&join, self.config.write_timeout).await {
            self.state.send_replace(NodeState::Disconnected);
            return Err(e);
        }

        let (stop, stop_rx) = watch::channel(false);
        let context = Arc::new(Context {
            node_id: self.config.node_id.clone(),
            retry_backoff: self.config.retry_backoff,
            write_timeout: self.config.write_timeout,
            alert_buffer: self.config.alert_buffer,
            collector: self.collector.clone(),
            monitor: self.monitor.clone(),
            received_alerts: self.received_alerts.clone(),
            state: self.state.clone(),
            stop,
            writer: Arc::new(Mutex::new(writer)),
        });

        self.state.send_replace(NodeState::Active);
        info!("joined coordinator at {}", self.config.coordinator_addr());

        let reporting = tokio::spawn(reporting_loop(context.clone(), stop_rx.clone()));
        let receiving = tokio::spawn(receiving_loop(
            context.clone(),
            MessageReader::new(read_half),
            stop_rx,
        ));

        self.session = Some(Session {
            context,
            reporting: Some(reporting),
            receiving: Some(receiving),
        });
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream, ConnectionError> {
        let addr = self.config.coordinator_addr();
        let attempts = self.config.connect_retries.max(1);
        let mut backoff = self.config.connect_backoff;

        for attempt in 1..=attempts {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    debug!("connected to {addr} on attempt {attempt}");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("connection attempt {attempt}/{attempts} to {addr} failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        Err(ConnectionError::Unreachable { addr, attempts })
    }

    /// Send a STATUS message carrying the current state
    pub async fn report_status(&self, detail: Option<String>) -> Result<(), ConnectionError> {
        let session = self.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        let message = Message::new(
            &self.config.node_id,
            COORDINATOR_ID,
            Payload::Status(StatusReport {
                state: self.state(),
                detail,
            }),
        );
        send(&session.context, &message).await
    }

    /// Wait until both loops ended, e.g. because the coordinator went away
    ///
    /// Afterwards the agent can be started again. Cancel safe: the session is
    /// only released once both loops are done.
    pub async fn wait(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        join_loops(&mut session.reporting, &mut session.receiving).await;
        self.session = None;
        self.state.send_replace(NodeState::Disconnected);
    }

    /// Stop both loops, say goodbye and close the connection
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let connected = *self.state.borrow() == NodeState::Active;
        self.state.send_replace(NodeState::Leaving);
        session.context.stop.send_replace(true);
        join_loops(&mut session.reporting, &mut session.receiving).await;

        let mut writer = session.context.writer.lock().await;
        if connected {
            let leave = Message::new(&self.config.node_id, COORDINATOR_ID, Payload::Leave);
            if let Err(e) = writer.send_within(&leave, self.config.write_timeout).await {
                debug!("could not send LEAVE: {e}");
            }
        }
        if let Err(e) = writer.shutdown().await {
            trace!("shutdown of write half failed: {e}");
        }

        self.state.send_replace(NodeState::Disconnected);
        info!("left coordinator");
    }
}

async fn join_loops(
    reporting: &mut Option<JoinHandle<()>>,
    receiving: &mut Option<JoinHandle<()>>,
) {
    join_loop("receiving", receiving).await;
    join_loop("reporting", reporting).await;
}

/// Await a loop once; the handle is cleared so a cancelled wait can resume
async fn join_loop(name: &str, handle: &mut Option<JoinHandle<()>>) {
    if let Some(task) = handle.as_mut() {
        if let Err(e) = task.await {
            error!("{name} loop ended abnormally: {e}");
        }
        *handle = None;
    }
}

#[instrument(skip_all, fields(node = %context.node_id))]
async fn reporting_loop(context: Arc<Context>, mut stop: watch::Receiver<bool>) {
    debug!("reporting loop started");

    loop {
        if *stop.borrow() {
            break;
        }

        let (batch, interval) = {
            let mut collector = context.collector.lock().await;
            (collector.collect_all(), collector.interval())
        };

        let local_alerts = {
            let mut monitor = context.monitor.lock().await;
            for metric in &batch.metrics {
                monitor.ingest(&context.node_id, metric.clone());
            }
            // nothing sweeps the node's monitor, so its alerts are handled here
            monitor.drain_alerts()
        };
        for alert in aggregate_alerts(local_alerts) {
            warn!("local {} alert: {}", alert.level, alert.summary());
        }

        let delay = match send_report(&context, batch.metrics).await {
            Ok(()) => interval,
            Err(e) => {
                warn!("failed to report metrics, retrying in {:?}: {e}", context.retry_backoff);
                context.retry_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
    }

    debug!("reporting loop stopped");
}

async fn send_report(
    context: &Context,
    metrics: Vec<crate::Metric>,
) -> Result<(), ConnectionError> {
    let count = metrics.len();

    send(
        context,
        &Message::new(&context.node_id, COORDINATOR_ID, Payload::Metric { metrics }),
    )
    .await?;
    send(
        context,
        &Message::new(&context.node_id, COORDINATOR_ID, Payload::Heartbeat),
    )
    .await?;

    trace!("reported {count} metrics");
    Ok(())
}

/// Write one message within `write_timeout`
///
/// A timed out write may leave half a frame on the wire, so the session is
/// ended and the caller of `wait` sees the agent as disconnected.
async fn send(context: &Context, message: &Message) -> Result<(), ConnectionError> {
    let result = context
        .writer
        .lock()
        .await
        .send_within(message, context.write_timeout)
        .await;

    if let Err(ConnectionError::Timeout(limit)) = &result {
        warn!("coordinator stopped reading for {limit:?}, dropping the connection");
        context.state.send_replace(NodeState::Disconnected);
        context.stop.send_replace(true);
    }
    result
}

#[instrument(skip_all, fields(node = %context.node_id))]
async fn receiving_loop(
    context: Arc<Context>,
    mut reader: MessageReader<OwnedReadHalf>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("receiving loop started");
    let mut lost = false;

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = stop.changed() => {}

            received = reader.recv() => match received {
                Ok(Received::Message(message)) => handle_message(&context, message).await,
                Ok(Received::Invalid(e)) => warn!("dropping undecodable message: {e}"),
                Ok(Received::Closed) => {
                    info!("coordinator closed the connection");
                    lost = true;
                    break;
                }
                Err(e) => {
                    warn!("connection to coordinator failed: {e}");
                    lost = true;
                    break;
                }
            }
        }
    }

    if lost {
        context.state.send_replace(NodeState::Disconnected);
        // takes the reporting loop down with us
        context.stop.send_replace(true);
    }
    debug!("receiving loop stopped");
}

async fn handle_message(context: &Context, message: Message) {
    trace!("received {} from {}", message.kind(), message.source);

    match &message.payload {
        Payload::Config { config } => match apply_config(context, config).await {
            Ok(()) => info!("applied configuration update"),
            Err(e) => warn!("rejected configuration update: {e}"),
        },

        Payload::Query { request_id, query } => {
            let result = context.monitor.lock().await.get_metrics(query);
            let response = message.reply(Payload::Response {
                request_id: *request_id,
                result,
            });
            if let Err(e) = send(context, &response).await {
                warn!("failed to answer query {request_id}: {e}");
            }
        }

        Payload::Alert { alert } => {
            let mut alerts = context.received_alerts.lock().await;
            while alerts.len() >= context.alert_buffer.max(1) {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
            debug!("buffered alert: {}", alert.summary());
        }

        _ => debug!("ignoring {} from {}", message.kind(), message.source),
    }
}

/// Apply every part of `update` or none of it
async fn apply_config(context: &Context, update: &ConfigUpdate) -> Result<(), ConfigurationError> {
    let mut collector = context.collector.lock().await;
    let next = collector.config().updated(update)?;

    if let Some(thresholds) = &update.thresholds {
        context.monitor.lock().await.replace_thresholds(thresholds)?;
    }
    collector.reconfigure(next);
    Ok(())
}
