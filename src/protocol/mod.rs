//! The message envelope exchanged between nodes and the coordinator
//!
//! On the wire every message is a JSON object
//! `{kind, source, target, payload, sent_at}` where `kind` is an upper case
//! discriminator such as `"METRIC"`. In memory the kind and the payload are a
//! single [`Payload`] enum, so a message cannot carry a payload of the wrong
//! shape.

pub mod frame;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    Metric, MetricQuery, alerts::Alert, collector::MetricFamily, error::ProtocolError,
    monitors::threshold::ThresholdConfig,
};

/// Target used for messages addressed to the coordinator itself
pub const COORDINATOR_ID: &str = "coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Leave,
    Metric,
    Heartbeat,
    Config,
    Query,
    Alert,
    Response,
    Status,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
            MessageKind::Metric => "METRIC",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Config => "CONFIG",
            MessageKind::Query => "QUERY",
            MessageKind::Alert => "ALERT",
            MessageKind::Response => "RESPONSE",
            MessageKind::Status => "STATUS",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOIN" => Ok(MessageKind::Join),
            "LEAVE" => Ok(MessageKind::Leave),
            "METRIC" => Ok(MessageKind::Metric),
            "HEARTBEAT" => Ok(MessageKind::Heartbeat),
            "CONFIG" => Ok(MessageKind::Config),
            "QUERY" => Ok(MessageKind::Query),
            "ALERT" => Ok(MessageKind::Alert),
            "RESPONSE" => Ok(MessageKind::Response),
            "STATUS" => Ok(MessageKind::Status),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings pushed from the coordinator to a node
///
/// Absent fields leave the node's current value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<Vec<MetricFamily>>,
    /// Replaces the node's local rule set when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Vec<ThresholdConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Disconnected,
    Joining,
    Active,
    Leaving,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            NodeState::Disconnected => "disconnected",
            NodeState::Joining => "joining",
            NodeState::Active => "active",
            NodeState::Leaving => "leaving",
        };
        f.write_str(state)
    }
}

/// Free form state report a node may send at any time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join { node_id: String },
    Leave,
    Metric { metrics: Vec<Metric> },
    Heartbeat,
    Config { config: ConfigUpdate },
    Query { request_id: u64, query: MetricQuery },
    Alert { alert: Alert },
    Response { request_id: u64, result: Vec<Metric> },
    Status(StatusReport),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Join { .. } => MessageKind::Join,
            Payload::Leave => MessageKind::Leave,
            Payload::Metric { .. } => MessageKind::Metric,
            Payload::Heartbeat => MessageKind::Heartbeat,
            Payload::Config { .. } => MessageKind::Config,
            Payload::Query { .. } => MessageKind::Query,
            Payload::Alert { .. } => MessageKind::Alert,
            Payload::Response { .. } => MessageKind::Response,
            Payload::Status(_) => MessageKind::Status,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        let value = match self {
            Payload::Join { node_id } => object([("node_id", Value::from(node_id.as_str()))]),
            Payload::Leave | Payload::Heartbeat => Value::Object(Map::new()),
            Payload::Metric { metrics } => object([("metrics", serde_json::to_value(metrics)?)]),
            Payload::Config { config } => object([("config", serde_json::to_value(config)?)]),
            Payload::Query { request_id, query } => object([
                ("request_id", Value::from(*request_id)),
                ("query", serde_json::to_value(query)?),
            ]),
            Payload::Alert { alert } => object([("alert", serde_json::to_value(alert)?)]),
            Payload::Response { request_id, result } => object([
                ("request_id", Value::from(*request_id)),
                ("result", serde_json::to_value(result)?),
            ]),
            Payload::Status(report) => serde_json::to_value(report)?,
        };
        Ok(value)
    }

    fn from_value(kind: MessageKind, payload: Value) -> Result<Self, ProtocolError> {
        let payload = match kind {
            MessageKind::Join => {
                let JoinPayload { node_id } = parse(kind, payload)?;
                Payload::Join { node_id }
            }
            MessageKind::Leave => {
                expect_empty(kind, &payload)?;
                Payload::Leave
            }
            MessageKind::Metric => {
                let MetricPayload { metrics } = parse(kind, payload)?;
                Payload::Metric { metrics }
            }
            MessageKind::Heartbeat => {
                expect_empty(kind, &payload)?;
                Payload::Heartbeat
            }
            MessageKind::Config => {
                let ConfigPayload { config } = parse(kind, payload)?;
                Payload::Config { config }
            }
            MessageKind::Query => {
                let QueryPayload { request_id, query } = parse(kind, payload)?;
                Payload::Query { request_id, query }
            }
            MessageKind::Alert => {
                let AlertPayload { alert } = parse(kind, payload)?;
                Payload::Alert { alert }
            }
            MessageKind::Response => {
                let ResponsePayload { request_id, result } = parse(kind, payload)?;
                Payload::Response { request_id, result }
            }
            MessageKind::Status => Payload::Status(parse(kind, payload)?),
        };
        Ok(payload)
    }
}

#[derive(Deserialize)]
struct JoinPayload {
    node_id: String,
}

#[derive(Deserialize)]
struct MetricPayload {
    metrics: Vec<Metric>,
}

#[derive(Deserialize)]
struct ConfigPayload {
    config: ConfigUpdate,
}

#[derive(Deserialize)]
struct QueryPayload {
    request_id: u64,
    #[serde(default)]
    query: MetricQuery,
}

#[derive(Deserialize)]
struct AlertPayload {
    alert: Alert,
}

#[derive(Deserialize)]
struct ResponsePayload {
    request_id: u64,
    result: Vec<Metric>,
}

/// Wire form used for decoding, before the kind is resolved
#[derive(Deserialize)]
struct Envelope {
    kind: String,
    source: String,
    target: String,
    #[serde(default)]
    payload: Value,
    sent_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    kind: &'static str,
    source: &'a str,
    target: &'a str,
    payload: Value,
    sent_at: DateTime<Utc>,
}

fn object<const N: usize>(fields: [(&str, Value); N]) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    )
}

fn parse<T: DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::PayloadShape {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn expect_empty(kind: MessageKind, payload: &Value) -> Result<(), ProtocolError> {
    match payload {
        Value::Null | Value::Object(_) => Ok(()),
        other => Err(ProtocolError::PayloadShape {
            kind: kind.to_string(),
            reason: format!("expected an object, got {other}"),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source: String,
    pub target: String,
    pub sent_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Message {
    pub fn new(source: impl Into<String>, target: impl Into<String>, payload: Payload) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            sent_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Build a message with the same endpoints swapped, e.g. for a RESPONSE
    pub fn reply(&self, payload: Payload) -> Self {
        Self::new(self.target.clone(), self.source.clone(), payload)
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = message.payload.to_value().map_err(ProtocolError::Encode)?;
    let envelope = EnvelopeRef {
        kind: message.kind().as_str(),
        source: &message.source,
        target: &message.target,
        payload,
        sent_at: message.sent_at,
    };
    serde_json::to_vec(&envelope).map_err(ProtocolError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
    let kind: MessageKind = envelope.kind.parse()?;
    let payload = Payload::from_value(kind, envelope.payload)?;

    Ok(Message {
        source: envelope.source,
        target: envelope.target,
        sent_at: envelope.sent_at,
        payload,
    })
}
