//! Traits describing the storage and bus backends the engine depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    AlertEvent, AlertId, BinId, BinReading, BinState, CommandRecord, Transition,
};

#[derive(thiserror::Error, Debug)]
/// Errors raised by a [`BinStore`] backend.
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// A stored row could not be mapped back into a domain value.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    /// A write was refused because the store is unavailable.
    #[error("Store unavailable")]
    Unavailable,
}

#[derive(thiserror::Error, Debug)]
/// Errors raised by a [`BusPublisher`] backend.
pub enum PublishError {
    /// The payload could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// The bus client refused or failed to queue the message.
    #[error("Bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq)]
/// Everything one worker step writes, committed together or not at all.
pub struct StepWrite {
    /// New state of the bin.
    pub state: BinState,
    /// Reading that drove the step.
    pub reading: Option<BinReading>,
    /// Alert raised by the step.
    pub alert: Option<AlertEvent>,
    /// Status changes made by the step.
    pub transitions: Vec<Transition>,
    /// Write-ahead `Pending` record of a command the step will publish.
    pub command: Option<CommandRecord>,
}

impl StepWrite {
    /// A step that only changes the bin state.
    #[must_use]
    pub fn state(state: BinState) -> Self {
        Self {
            state,
            reading: None,
            alert: None,
            transitions: Vec::new(),
            command: None,
        }
    }
}

#[async_trait]
/// Durable storage for bin state, alerts, commands, and history.
///
/// Every write must be durable once it returns `Ok`.
pub trait BinStore: Send + Sync {
    /// Upsert the current state of a bin.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn save_state(&self, state: &BinState) -> Result<(), StoreError>;

    /// Load one bin's state.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn load_state(&self, bin_id: &BinId) -> Result<Option<BinState>, StoreError>;

    /// Load every known bin's state.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn load_all_states(&self) -> Result<Vec<BinState>, StoreError>;

    /// Write a whole step atomically. The state and command are upserted,
    /// the reading and alert are inserted if absent, and the transitions
    /// are appended.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails; nothing is then stored.
    async fn commit_step(&self, step: &StepWrite) -> Result<(), StoreError>;

    /// Deregister a bin at `at`.
    ///
    /// Removes its state, readings, and transitions, fails its pending
    /// commands, and records a tombstone. Alerts and command records are
    /// kept and stay attributable through the tombstone.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails; nothing is then changed.
    async fn delete_bin(&self, bin_id: &BinId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append an alert; appending an id that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn append_alert(&self, alert: &AlertEvent) -> Result<(), StoreError>;

    /// Mark an unacknowledged alert of `bin_id` acknowledged.
    ///
    /// Returns whether a row changed: `false` for an unknown id, an alert
    /// of another bin, or a repeated acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn acknowledge_alert(
        &self,
        bin_id: &BinId,
        alert_id: &AlertId,
    ) -> Result<bool, StoreError>;

    /// Alerts not yet acknowledged, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn active_alerts(&self) -> Result<Vec<AlertEvent>, StoreError>;

    /// Upsert a command record keyed by its id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn save_command(&self, record: &CommandRecord) -> Result<(), StoreError>;

    /// All commands still in `Pending` status.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn load_all_pending(&self) -> Result<Vec<CommandRecord>, StoreError>;

    /// Record an accepted reading; a repeated `(bin, sequence)` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn append_reading(&self, reading: &BinReading) -> Result<(), StoreError>;

    /// The newest `limit` readings of a bin, returned oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn recent_readings(
        &self,
        bin_id: &BinId,
        limit: usize,
    ) -> Result<Vec<BinReading>, StoreError>;

    /// Record a status change.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails.
    async fn append_transition(&self, transition: &Transition) -> Result<(), StoreError>;

    /// Status changes of a bin, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    async fn transitions(&self, bin_id: &BinId) -> Result<Vec<Transition>, StoreError>;
}

#[async_trait]
/// Outbound side of the message bus.
pub trait BusPublisher: Send + Sync {
    /// Publish a payload with at-least-once delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] when the message cannot be queued.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), PublishError>;
}
