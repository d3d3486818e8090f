//! Domain data structures for bins, readings, alerts, and emptying commands.

use std::fmt;
use std::str::FromStr;

use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic alert identifiers.
const ALERT_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9a4d_4e7b_8c55_1d2e_0f3a_7b91);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// Stable identifier of a monitored bin.
pub struct BinId(pub String);

impl BinId {
    /// Build an identifier from anything string-like.
    #[must_use]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BinId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Lifecycle status of a bin.
pub enum BinStatus {
    /// Fill level below the warning band.
    Normal,
    /// Fill level at or above the warning threshold.
    Warning,
    /// Fill level at or above the critical threshold.
    Critical,
    /// An emptying command is in flight.
    EmptyingInProgress,
    /// No reading arrived within the staleness window.
    Offline,
}

impl BinStatus {
    /// Severity rank used to detect upward transitions.
    ///
    /// `EmptyingInProgress` ranks with `Critical`: the bin is still full until
    /// the actuator confirms. `Offline` sits outside the ladder.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Normal | Self::Offline => 0,
            Self::Warning => 1,
            Self::Critical | Self::EmptyingInProgress => 2,
        }
    }

    /// Stable lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::EmptyingInProgress => "emptying",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for BinStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for BinStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(Self::Normal),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            "emptying" => Ok(Self::EmptyingInProgress),
            "offline" => Ok(Self::Offline),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
/// A stored enum name did not match any known variant.
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A validated fill-level sample.
pub struct BinReading {
    /// Bin the sample belongs to.
    pub bin_id: BinId,
    /// Fill level, 0 to 100 inclusive.
    pub fill_percent: f64,
    /// Sensor-side sample time.
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Monotonic per-bin sequence used for deduplication.
    pub source_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Current state of a single bin, owned by its worker.
pub struct BinState {
    /// Bin identifier.
    pub bin_id: BinId,
    /// Last reported fill level.
    pub last_fill_percent: f64,
    /// Current lifecycle status.
    pub status: BinStatus,
    /// Time of the last accepted reading.
    #[serde(with = "ts_seconds")]
    pub last_reading_timestamp: DateTime<Utc>,
    /// Time of the last status change.
    #[serde(with = "ts_seconds")]
    pub last_transition_timestamp: DateTime<Utc>,
    /// Consecutive readings at or above the warning threshold.
    pub consecutive_high_readings: u32,
    /// Status restored on the next reading after going offline.
    pub status_before_offline: Option<BinStatus>,
    /// Emptying attempts that timed out or failed since the last success.
    pub failed_attempts: u32,
    /// Earliest time a new emptying command may be issued.
    #[serde(with = "ts_seconds_option")]
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl BinState {
    /// Fresh state for a bin seen for the first time.
    #[must_use]
    pub fn new(bin_id: BinId, at: DateTime<Utc>) -> Self {
        Self {
            bin_id,
            last_fill_percent: 0.0,
            status: BinStatus::Normal,
            last_reading_timestamp: at,
            last_transition_timestamp: at,
            consecutive_high_readings: 0,
            status_before_offline: None,
            failed_attempts: 0,
            retry_not_before: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Severity carried by an alert.
pub enum AlertSeverity {
    /// Bin crossed the warning threshold.
    Warning,
    /// Bin crossed the critical threshold.
    Critical,
    /// Bin stopped reporting.
    Offline,
}

impl AlertSeverity {
    /// Stable lowercase name used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            "offline" => Ok(Self::Offline),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Identifier of an alert.
pub struct AlertId(pub Uuid);

impl AlertId {
    /// Derive the identifier from the event that raised the alert.
    ///
    /// The same trigger always yields the same id, which makes
    /// insert-if-absent writes idempotent under redelivery.
    #[must_use]
    pub fn derive(bin_id: &BinId, trigger: &str, severity: AlertSeverity) -> Self {
        let name = format!("{bin_id}/{trigger}/{severity}");
        Self(Uuid::new_v5(&ALERT_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Append-only alert record.
pub struct AlertEvent {
    /// Alert identifier.
    pub alert_id: AlertId,
    /// Bin that raised the alert.
    pub bin_id: BinId,
    /// Alert severity.
    pub severity: AlertSeverity,
    /// Fill level that triggered the alert.
    pub triggering_fill_percent: f64,
    /// Creation time.
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    /// Set once by an operator acknowledgement.
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Identifier of a single dispatch attempt.
pub struct CommandId(pub Uuid);

impl CommandId {
    /// Fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Kind of actuator command.
pub enum CommandKind {
    /// Empty the bin.
    EmptyBin,
}

impl CommandKind {
    /// Stable name used on the wire and in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmptyBin => "EmptyBin",
        }
    }
}

impl FromStr for CommandKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "EmptyBin" => Ok(Self::EmptyBin),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Lifecycle of a dispatched command.
pub enum CommandStatus {
    /// Persisted, awaiting an actuator response.
    Pending,
    /// Actuator confirmed completion.
    Acknowledged,
    /// Actuator reported failure, or the bin was deregistered while it was pending.
    Failed,
    /// No response within the command timeout.
    TimedOut,
}

impl CommandStatus {
    /// Stable lowercase name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Durable record of one dispatch attempt.
pub struct CommandRecord {
    /// Attempt identifier, also used by the actuator for deduplication.
    pub command_id: CommandId,
    /// Target bin.
    pub bin_id: BinId,
    /// Command kind.
    pub kind: CommandKind,
    /// Time the record was created.
    #[serde(with = "ts_seconds")]
    pub issued_at: DateTime<Utc>,
    /// Current status.
    pub status: CommandStatus,
    /// Time of the first successful publish, if any.
    #[serde(with = "ts_seconds_option")]
    pub published_at: Option<DateTime<Utc>>,
    /// Time the record left `Pending`.
    #[serde(with = "ts_seconds_option")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    /// Whether the record is still awaiting a response.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == CommandStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Request from the state engine to empty a bin.
pub struct CommandIntent {
    /// Target bin.
    pub bin_id: BinId,
    /// Command kind.
    pub kind: CommandKind,
    /// Time of the reading that produced the intent.
    pub requested_at: DateTime<Utc>,
    /// Fill level that produced the intent.
    pub triggering_fill_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Result reported by an actuator.
pub enum ActuatorOutcome {
    /// Bin emptied.
    Done,
    /// Emptying failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Logged status change of a bin.
pub struct Transition {
    /// Bin identifier.
    pub bin_id: BinId,
    /// Status before the change.
    pub from: BinStatus,
    /// Status after the change.
    pub to: BinStatus,
    /// Time of the change.
    #[serde(with = "ts_seconds")]
    pub at: DateTime<Utc>,
}
