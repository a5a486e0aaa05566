//! Helper functions for integration tests

#![allow(dead_code)]

use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use fleet_monitoring::{
    Metric,
    alerts::Alert,
    collector::{CollectorConfig, Family, MetricCollector},
    config::{CoordinatorConfig, NodeConfig},
    coordinator::Coordinator,
    error::NotificationError,
    monitors::threshold::ThresholdConfig,
    notify::{NotificationProvider, Notifier},
    protocol::{
        COORDINATOR_ID, Message, Payload, encode,
        frame::{MessageReader, Received, write_frame},
    },
};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Coordinator config on an ephemeral port whose sweep only runs on demand
pub fn test_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        sweep_interval: Duration::from_secs(3600),
        drain_timeout: Duration::from_millis(200),
        query_timeout: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    }
}

pub fn test_node_config(node_id: &str, port: u16) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        coordinator_host: "127.0.0.1".to_string(),
        coordinator_port: port,
        reporting_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(50),
        connect_backoff: Duration::from_millis(10),
        connect_retries: 3,
        ..NodeConfig::default()
    }
}

pub fn threshold(metric: &str, operator: &str, value: f64, level: &str) -> ThresholdConfig {
    ThresholdConfig {
        id: None,
        metric: metric.to_string(),
        operator: operator.to_string(),
        value,
        sustained_for_secs: 0,
        level: level.to_string(),
    }
}

pub async fn start_coordinator(
    config: CoordinatorConfig,
    providers: Vec<Arc<dyn NotificationProvider>>,
) -> Coordinator {
    let mut notifier = Notifier::new(Duration::from_secs(2));
    for provider in providers {
        notifier.add_provider(provider);
    }
    Coordinator::start(config, notifier, None).await.unwrap()
}

/// Poll `check` until it holds or a few seconds passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Provider remembering every alert it was given
#[derive(Clone, Default)]
pub struct RecordingProvider {
    pub alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingProvider {
    pub fn recorded(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<bool, NotificationError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(true)
    }
}

/// Family reporting the same metrics on every collection
pub struct FixedFamily {
    pub metrics: Vec<Metric>,
}

impl Family for FixedFamily {
    fn name(&self) -> &str {
        "fixed"
    }

    fn collect(&mut self) -> anyhow::Result<Vec<Metric>> {
        Ok(self.metrics.clone())
    }
}

pub fn fixed_collector(metrics: Vec<Metric>, interval: Duration) -> MetricCollector {
    let config = CollectorConfig {
        interval,
        ..CollectorConfig::default()
    };
    MetricCollector::with_families(config, vec![Box::new(FixedFamily { metrics })])
}

/// One end of a protocol connection driven by the test itself
pub struct TestConnection {
    pub id: String,
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestConnection {
    pub fn new(id: &str, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id: id.to_string(),
            reader: MessageReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn connect(addr: SocketAddr, id: &str) -> Self {
        Self::new(id, TcpStream::connect(addr).await.unwrap())
    }

    /// Connect and announce `id`, waiting until the coordinator registered it
    pub async fn join(coordinator: &Coordinator, id: &str) -> Self {
        let mut connection = Self::connect(coordinator.local_addr(), id).await;
        connection
            .send(Payload::Join {
                node_id: id.to_string(),
            })
            .await;
        assert!(
            eventually(move || coordinator.registry().contains(id)).await,
            "node {id} was never registered"
        );
        connection
    }

    pub async fn send(&mut self, payload: Payload) {
        let message = Message::new(&self.id, COORDINATOR_ID, payload);
        self.send_message(&message).await;
    }

    pub async fn send_message(&mut self, message: &Message) {
        let body = encode(message).unwrap();
        write_frame(&mut self.writer, &body).await.unwrap();
    }

    pub async fn send_raw(&mut self, body: &[u8]) {
        write_frame(&mut self.writer, body).await.unwrap();
    }

    pub async fn recv_received(&mut self) -> Received {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
    }

    pub async fn recv(&mut self) -> Message {
        match self.recv_received().await {
            Received::Message(message) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Skip periodic reports until a message matching `predicate` arrives
    pub async fn recv_until<P>(&mut self, predicate: P) -> Message
    where
        P: Fn(&Message) -> bool,
    {
        loop {
            let message = self.recv().await;
            if predicate(&message) {
                return message;
            }
        }
    }
}

/// Listener standing in for a coordinator in node agent tests
pub struct FakeCoordinator {
    listener: TcpListener,
}

impl FakeCoordinator {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> TestConnection {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("node never connected")
            .unwrap();
        TestConnection::new(COORDINATOR_ID, stream)
    }
}
