//! Emptying commands: write-ahead records, publishing, and timeouts.
//!
//! A command record is persisted as `Pending` before anything is published,
//! so a crash between the two leaves a record that is republished on
//! restart. Actuators deduplicate on `commandId`. At most one pending
//! command exists per bin, and only records already stored are tracked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::model::{
    ActuatorOutcome, AlertEvent, BinId, BinState, CommandId, CommandIntent, CommandRecord,
    CommandStatus,
};
use crate::ports::{BinStore, BusPublisher, PublishError, StoreError};
use crate::retry::backoff_delta;
use crate::wire::{
    CommandPayload, OPERATIONAL_ALERT_TOPIC, OperationalAlert, Topics, encode_alert, encode_status,
};

#[derive(Error, Debug)]
/// Reasons a command could not be created, published, or resolved.
pub enum DispatchError {
    /// Dispatch is halted after a persistence failure.
    #[error("Command dispatch halted")]
    Halted,
    /// The bin already has a command in flight.
    #[error("Bin {bin_id} already has pending command {command_id}")]
    AlreadyPending {
        /// Bin addressed.
        bin_id: BinId,
        /// Command in flight.
        command_id: CommandId,
    },
    /// The command record could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The command could not be handed to the bus.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What [`CommandDispatcher::resume`] did.
pub struct ResumeReport {
    /// Pending records now tracked.
    pub adopted: usize,
    /// Never-published records sent during the resume.
    pub republished: usize,
}

/// Issues `EmptyBin` commands and tracks them until they resolve.
pub struct CommandDispatcher {
    store: Arc<dyn BinStore>,
    bus: Arc<dyn BusPublisher>,
    config: EngineConfig,
    pending: DashMap<CommandId, CommandRecord>,
    by_bin: DashMap<BinId, CommandId>,
    halted: AtomicBool,
}

impl CommandDispatcher {
    /// Create a dispatcher with no commands in flight.
    #[must_use]
    pub fn new(store: Arc<dyn BinStore>, bus: Arc<dyn BusPublisher>, config: EngineConfig) -> Self {
        Self {
            store,
            bus,
            config,
            pending: DashMap::new(),
            by_bin: DashMap::new(),
            halted: AtomicBool::new(false),
        }
    }

    /// Stop creating new commands until [`reopen`](Self::reopen).
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            warn!("command dispatch halted");
        }
    }

    /// Resume creating commands.
    pub fn reopen(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("command dispatch resumed");
        }
    }

    /// Whether new commands are refused.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// The command in flight for a bin, if any.
    #[must_use]
    pub fn pending_for(&self, bin_id: &BinId) -> Option<CommandRecord> {
        let command_id = *self.by_bin.get(bin_id)?;
        self.pending.get(&command_id).map(|record| record.clone())
    }

    /// Number of commands in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Delay before a bin that has failed `failed_attempts` times may retry.
    #[must_use]
    pub fn backoff_for(&self, failed_attempts: u32) -> TimeDelta {
        backoff_delta(
            failed_attempts,
            Duration::from_secs(self.config.backoff_base_secs),
            Duration::from_secs(self.config.backoff_cap_secs),
        )
    }

    /// Build a `Pending` record for an intent without storing or tracking it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Halted`] while halted and
    /// [`DispatchError::AlreadyPending`] if the bin has a command in flight.
    pub fn draft(
        &self,
        intent: &CommandIntent,
        now: DateTime<Utc>,
    ) -> Result<CommandRecord, DispatchError> {
        if self.is_halted() {
            return Err(DispatchError::Halted);
        }
        if let Some(existing) = self.by_bin.get(&intent.bin_id) {
            return Err(DispatchError::AlreadyPending {
                bin_id: intent.bin_id.clone(),
                command_id: *existing,
            });
        }

        Ok(CommandRecord {
            command_id: CommandId::generate(),
            bin_id: intent.bin_id.clone(),
            kind: intent.kind,
            issued_at: now,
            status: CommandStatus::Pending,
            published_at: None,
            resolved_at: None,
        })
    }

    /// Start tracking a record that is durably stored as `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AlreadyPending`] if the bin already has a
    /// command in flight.
    pub fn track(&self, record: CommandRecord) -> Result<(), DispatchError> {
        match self.by_bin.entry(record.bin_id.clone()) {
            Entry::Occupied(occupied) => {
                return Err(DispatchError::AlreadyPending {
                    bin_id: record.bin_id,
                    command_id: *occupied.get(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.command_id);
            }
        }
        debug!(bin = %record.bin_id, command = %record.command_id, "command tracked");
        self.pending.insert(record.command_id, record);
        Ok(())
    }

    /// Persist and track a `Pending` record for an intent without publishing it.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`draft`](Self::draft) and [`track`](Self::track),
    /// and [`DispatchError::Store`] if the record cannot be written.
    pub async fn prepare(
        &self,
        intent: &CommandIntent,
        now: DateTime<Utc>,
    ) -> Result<CommandRecord, DispatchError> {
        let record = self.draft(intent, now)?;
        self.store.save_command(&record).await?;
        self.track(record.clone())?;
        Ok(record)
    }

    /// Publish a tracked command and note when it went out.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if the bus refuses the message; the
    /// record stays pending and unpublished.
    pub async fn publish(
        &self,
        command_id: CommandId,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let Some(record) = self.pending.get(&command_id).map(|record| record.clone()) else {
            return Ok(());
        };

        let payload = serde_json::to_vec(&CommandPayload::from(&record)).map_err(PublishError::from)?;
        if let Err(err) = self
            .bus
            .publish(&Topics::command(&record.bin_id), payload, false)
            .await
        {
            warn!(bin = %record.bin_id, command = %command_id, error = %err, "command publish failed");
            return Err(err.into());
        }

        let published = self.pending.get_mut(&command_id).map(|mut entry| {
            entry.published_at = Some(now);
            entry.clone()
        });
        if let Some(published) = published
            && let Err(err) = self.store.save_command(&published).await
        {
            warn!(command = %command_id, error = %err, "could not record publish time");
        }
        info!(bin = %record.bin_id, command = %command_id, "EmptyBin command published");
        Ok(())
    }

    /// [`prepare`](Self::prepare) followed by [`publish`](Self::publish).
    ///
    /// A publish failure is logged and left for a later [`republish`](Self::republish).
    ///
    /// # Errors
    ///
    /// Returns the errors of [`prepare`](Self::prepare).
    pub async fn dispatch(
        &self,
        intent: &CommandIntent,
        now: DateTime<Utc>,
    ) -> Result<CommandRecord, DispatchError> {
        let record = self.prepare(intent, now).await?;
        if self.publish(record.command_id, now).await.is_err() {
            debug!(command = %record.command_id, "command left for republish");
        }
        Ok(self
            .pending
            .get(&record.command_id)
            .map_or(record, |current| current.clone()))
    }

    /// Resolve a command from an actuator response.
    ///
    /// Returns `None` for an unknown, already resolved, or foreign command.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the resolution cannot be written;
    /// the command then stays pending.
    pub async fn on_actuator_response(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        outcome: ActuatorOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRecord>, DispatchError> {
        let status = match outcome {
            ActuatorOutcome::Done => CommandStatus::Acknowledged,
            ActuatorOutcome::Failed => CommandStatus::Failed,
        };
        let resolved = self.resolve(bin_id, command_id, status, now).await?;
        if resolved.is_none() {
            debug!(bin = %bin_id, command = %command_id, "ignoring response for unknown command");
        }
        Ok(resolved)
    }

    /// Pending commands whose timeout has passed.
    #[must_use]
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<(BinId, CommandId)> {
        self.pending
            .iter()
            .filter(|record| self.is_expired(record.value(), now))
            .map(|record| (record.bin_id.clone(), record.command_id))
            .collect()
    }

    /// Mark a command timed out if it is still pending and past its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the resolution cannot be written.
    pub async fn expire(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRecord>, DispatchError> {
        let expired = self
            .pending
            .get(&command_id)
            .is_some_and(|record| self.is_expired(record.value(), now));
        if !expired {
            return Ok(None);
        }
        let resolved = self
            .resolve(bin_id, command_id, CommandStatus::TimedOut, now)
            .await?;
        if let Some(record) = &resolved {
            warn!(bin = %record.bin_id, command = %command_id, "command timed out");
        }
        Ok(resolved)
    }

    /// Pending commands that have never been published.
    #[must_use]
    pub fn unpublished(&self) -> Vec<(BinId, CommandId)> {
        self.pending
            .iter()
            .filter(|record| record.published_at.is_none())
            .map(|record| (record.bin_id.clone(), record.command_id))
            .collect()
    }

    /// Publish a command of `bin_id` that is still pending and unpublished.
    ///
    /// Returns `false` when there is nothing to send.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if the bus refuses the message.
    pub async fn republish(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let due = self
            .pending
            .get(&command_id)
            .is_some_and(|record| &record.bin_id == bin_id && record.published_at.is_none());
        if !due {
            return Ok(false);
        }
        self.publish(command_id, now).await?;
        Ok(true)
    }

    /// Adopt pending records loaded at startup.
    ///
    /// Records that were never published go out now. Published ones keep
    /// their publish time, so their timeout runs on from before the restart.
    pub async fn resume(&self, records: Vec<CommandRecord>, now: DateTime<Utc>) -> ResumeReport {
        let mut report = ResumeReport::default();
        let mut unpublished = Vec::new();
        for record in records.into_iter().filter(CommandRecord::is_pending) {
            if let Some(existing) = self.by_bin.get(&record.bin_id) {
                warn!(
                    bin = %record.bin_id,
                    kept = %*existing,
                    dropped = %record.command_id,
                    "second pending command for bin ignored"
                );
                continue;
            }
            self.by_bin.insert(record.bin_id.clone(), record.command_id);
            if record.published_at.is_none() {
                unpublished.push(record.command_id);
            }
            self.pending.insert(record.command_id, record);
            report.adopted += 1;
        }

        for command_id in unpublished {
            match self.publish(command_id, now).await {
                Ok(()) => report.republished += 1,
                Err(err) => {
                    debug!(command = %command_id, error = %err, "resumed command left for republish");
                }
            }
        }
        report
    }

    /// Forget in-flight state for a deregistered bin.
    pub fn drop_bin(&self, bin_id: &BinId) {
        if let Some((_, command_id)) = self.by_bin.remove(bin_id) {
            self.pending.remove(&command_id);
        }
    }

    /// Announce an alert on `bins/{binId}/alert`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if encoding or publishing fails.
    pub async fn publish_alert(&self, alert: &AlertEvent) -> Result<(), DispatchError> {
        let payload = encode_alert(alert).map_err(PublishError::from)?;
        self.bus
            .publish(&Topics::alert(&alert.bin_id), payload, false)
            .await?;
        Ok(())
    }

    /// Publish a retained state snapshot on `bins/{binId}/status`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if encoding or publishing fails.
    pub async fn publish_status(&self, state: &BinState) -> Result<(), DispatchError> {
        let payload = encode_status(state).map_err(PublishError::from)?;
        self.bus
            .publish(&Topics::status(&state.bin_id), payload, true)
            .await?;
        Ok(())
    }

    /// Raise a system-level alert on the operational topic.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if encoding or publishing fails.
    pub async fn publish_operational(&self, alert: &OperationalAlert) -> Result<(), DispatchError> {
        let payload = serde_json::to_vec(alert).map_err(PublishError::from)?;
        self.bus
            .publish(OPERATIONAL_ALERT_TOPIC, payload, false)
            .await?;
        Ok(())
    }

    fn is_expired(&self, record: &CommandRecord, now: DateTime<Utc>) -> bool {
        record
            .published_at
            .unwrap_or(record.issued_at)
            .checked_add_signed(self.config.command_timeout())
            .is_some_and(|deadline| deadline <= now)
    }

    async fn resolve(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        status: CommandStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRecord>, DispatchError> {
        let Some(mut record) = self.pending.get(&command_id).map(|record| record.clone()) else {
            return Ok(None);
        };
        if &record.bin_id != bin_id {
            warn!(
                bin = %bin_id,
                owner = %record.bin_id,
                command = %command_id,
                "command response arrived on another bin's topic"
            );
            return Ok(None);
        }

        record.status = status;
        record.resolved_at = Some(now);
        self.store.save_command(&record).await?;

        self.pending.remove(&command_id);
        self.by_bin
            .remove_if(&record.bin_id, |_, current| *current == command_id);
        info!(bin = %record.bin_id, command = %command_id, status = %record.status.as_str(), "command resolved");
        Ok(Some(record))
    }
}
