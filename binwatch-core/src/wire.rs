//! Topic grammar and JSON payloads exchanged over the message bus.

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    ActuatorOutcome, AlertEvent, AlertId, BinId, BinState, CommandId, CommandKind, CommandRecord,
};

/// Root of every per-bin topic.
pub const BIN_PREFIX: &str = "bins";
/// Outbound operational alerts, distinct from bin alerts.
pub const OPERATIONAL_ALERT_TOPIC: &str = "binwatch/alert";
/// Retained presence topic of the monitoring engine.
pub const PRESENCE_TOPIC: &str = "binwatch/status";

/// Subscription filters for all inbound traffic.
pub const INBOUND_FILTERS: [&str; 3] = [
    "bins/+/fill",
    "bins/+/command/ack",
    "bins/+/alert/ack",
];

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message as delivered by the bus, before decoding.
pub struct RawMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Undecoded payload bytes.
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Construct a raw message.
    #[must_use]
    pub fn new<T: Into<String>>(topic: T, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Classified inbound topic.
pub enum InboundTopic {
    /// `bins/{binId}/fill`
    Fill(BinId),
    /// `bins/{binId}/command/ack`
    CommandAck(BinId),
    /// `bins/{binId}/alert/ack`
    AlertAck(BinId),
}

impl InboundTopic {
    /// Classify a topic string; `None` for anything the engine does not consume.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let mut segments = topic.split('/');
        if segments.next()? != BIN_PREFIX {
            return None;
        }
        let bin = segments.next().filter(|segment| !segment.is_empty())?;
        let bin_id = BinId::new(bin);

        let rest: Vec<&str> = segments.collect();
        match rest.as_slice() {
            ["fill"] => Some(Self::Fill(bin_id)),
            ["command", "ack"] => Some(Self::CommandAck(bin_id)),
            ["alert", "ack"] => Some(Self::AlertAck(bin_id)),
            _ => None,
        }
    }

    /// Bin addressed by the topic.
    #[must_use]
    pub fn bin_id(&self) -> &BinId {
        match self {
            Self::Fill(bin_id) | Self::CommandAck(bin_id) | Self::AlertAck(bin_id) => bin_id,
        }
    }
}

/// Builders for outbound per-bin topics.
pub struct Topics;

impl Topics {
    /// `bins/{binId}/command`
    #[must_use]
    pub fn command(bin_id: &BinId) -> String {
        format!("{BIN_PREFIX}/{bin_id}/command")
    }

    /// `bins/{binId}/alert`
    #[must_use]
    pub fn alert(bin_id: &BinId) -> String {
        format!("{BIN_PREFIX}/{bin_id}/alert")
    }

    /// `bins/{binId}/status`
    #[must_use]
    pub fn status(bin_id: &BinId) -> String {
        format!("{BIN_PREFIX}/{bin_id}/status")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Sensor sample as sent on `bins/{binId}/fill`.
///
/// Fields are optional here so that missing values surface as a
/// validation error instead of a generic decode failure.
pub struct FillPayload {
    /// Fill level, 0 to 100.
    pub fill_percent: Option<f64>,
    /// Epoch seconds.
    pub timestamp: Option<f64>,
    /// Per-bin monotonic sequence.
    pub source_sequence: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Actuator command as sent on `bins/{binId}/command`.
pub struct CommandPayload {
    /// Attempt identifier the actuator deduplicates on.
    pub command_id: CommandId,
    /// Always `EmptyBin`.
    pub kind: CommandKind,
    /// Creation time of the command record, epoch seconds.
    #[serde(with = "ts_seconds")]
    pub issued_at: DateTime<Utc>,
}

impl From<&CommandRecord> for CommandPayload {
    fn from(record: &CommandRecord) -> Self {
        Self {
            command_id: record.command_id,
            kind: record.kind,
            issued_at: record.issued_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Actuator response as sent on `bins/{binId}/command/ack`.
pub struct AckPayload {
    /// Command being answered.
    pub command_id: CommandId,
    /// Reported result.
    pub outcome: ActuatorOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Operator acknowledgement as sent on `bins/{binId}/alert/ack`.
pub struct AlertAckPayload {
    /// Alert being acknowledged.
    pub alert_id: AlertId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// System-level alert that is not tied to a bin threshold.
pub struct OperationalAlert {
    /// Machine-readable kind, e.g. `persistence_failure`.
    pub kind: String,
    /// Bin whose processing surfaced the problem, if any.
    pub bin_id: Option<BinId>,
    /// Human-readable detail.
    pub message: String,
    /// Time of the alert, epoch seconds.
    #[serde(with = "ts_seconds")]
    pub raised_at: DateTime<Utc>,
}

/// Encode an alert for `bins/{binId}/alert`.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if encoding fails.
pub fn encode_alert(alert: &AlertEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(alert)
}

/// Encode a state snapshot for `bins/{binId}/status`.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if encoding fails.
pub fn encode_status(state: &BinState) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(state)
}
