//! In-process store and bus backends for tests and single-node dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::{
    AlertEvent, AlertId, BinId, BinReading, BinState, CommandId, CommandRecord, CommandStatus,
    Transition,
};
use crate::ports::{BinStore, BusPublisher, PublishError, StepWrite, StoreError};

/// [`BinStore`] keeping everything in memory.
///
/// Each table is a sharded map, so writes for different bins do not
/// contend. Writes can be switched off with [`MemoryStore::set_writable`]
/// to simulate a failing disk.
#[derive(Debug)]
pub struct MemoryStore {
    states: DashMap<BinId, BinState>,
    alerts: DashMap<AlertId, AlertEvent>,
    commands: DashMap<CommandId, CommandRecord>,
    readings: DashMap<BinId, BTreeMap<u64, BinReading>>,
    transitions: DashMap<BinId, Vec<Transition>>,
    tombstones: DashMap<BinId, DateTime<Utc>>,
    writable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            states: DashMap::new(),
            alerts: DashMap::new(),
            commands: DashMap::new(),
            readings: DashMap::new(),
            transitions: DashMap::new(),
            tombstones: DashMap::new(),
            writable: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes succeed or fail with [`StoreError::Unavailable`].
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Every command record regardless of status, oldest first.
    #[must_use]
    pub fn all_commands(&self) -> Vec<CommandRecord> {
        let mut records: Vec<_> = self.commands.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.issued_at);
        records
    }

    /// Every alert regardless of acknowledgement, oldest first.
    #[must_use]
    pub fn all_alerts(&self) -> Vec<AlertEvent> {
        let mut alerts: Vec<_> = self.alerts.iter().map(|entry| entry.value().clone()).collect();
        alerts.sort_by_key(|alert| alert.created_at);
        alerts
    }

    /// When the bin was last deregistered, if ever.
    #[must_use]
    pub fn deregistered_at(&self, bin_id: &BinId) -> Option<DateTime<Utc>> {
        self.tombstones.get(bin_id).map(|at| *at)
    }

    fn insert_reading(&self, reading: &BinReading) {
        self.readings
            .entry(reading.bin_id.clone())
            .or_default()
            .entry(reading.source_sequence)
            .or_insert_with(|| reading.clone());
    }

    fn insert_alert(&self, alert: &AlertEvent) {
        self.alerts
            .entry(alert.alert_id)
            .or_insert_with(|| alert.clone());
    }

    fn push_transition(&self, transition: &Transition) {
        self.transitions
            .entry(transition.bin_id.clone())
            .or_default()
            .push(transition.clone());
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl BinStore for MemoryStore {
    async fn save_state(&self, state: &BinState) -> Result<(), StoreError> {
        self.check_writable()?;
        self.states.insert(state.bin_id.clone(), state.clone());
        Ok(())
    }

    async fn load_state(&self, bin_id: &BinId) -> Result<Option<BinState>, StoreError> {
        Ok(self.states.get(bin_id).map(|state| state.clone()))
    }

    async fn load_all_states(&self) -> Result<Vec<BinState>, StoreError> {
        let mut states: Vec<_> = self.states.iter().map(|entry| entry.value().clone()).collect();
        states.sort_by(|left, right| left.bin_id.cmp(&right.bin_id));
        Ok(states)
    }

    async fn commit_step(&self, step: &StepWrite) -> Result<(), StoreError> {
        self.check_writable()?;
        if let Some(reading) = &step.reading {
            self.insert_reading(reading);
        }
        if let Some(alert) = &step.alert {
            self.insert_alert(alert);
        }
        for transition in &step.transitions {
            self.push_transition(transition);
        }
        if let Some(record) = &step.command {
            self.commands.insert(record.command_id, record.clone());
        }
        self.states
            .insert(step.state.bin_id.clone(), step.state.clone());
        Ok(())
    }

    async fn delete_bin(&self, bin_id: &BinId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tombstones.insert(bin_id.clone(), at);
        self.states.remove(bin_id);
        self.readings.remove(bin_id);
        self.transitions.remove(bin_id);
        for mut record in self.commands.iter_mut() {
            if &record.bin_id == bin_id && record.is_pending() {
                record.status = CommandStatus::Failed;
                record.resolved_at = Some(at);
            }
        }
        Ok(())
    }

    async fn append_alert(&self, alert: &AlertEvent) -> Result<(), StoreError> {
        self.check_writable()?;
        self.insert_alert(alert);
        Ok(())
    }

    async fn acknowledge_alert(
        &self,
        bin_id: &BinId,
        alert_id: &AlertId,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        match self.alerts.get_mut(alert_id) {
            Some(mut alert) if &alert.bin_id == bin_id && !alert.acknowledged => {
                alert.acknowledged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        Ok(self
            .all_alerts()
            .into_iter()
            .filter(|alert| !alert.acknowledged)
            .collect())
    }

    async fn save_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.commands.insert(record.command_id, record.clone());
        Ok(())
    }

    async fn load_all_pending(&self) -> Result<Vec<CommandRecord>, StoreError> {
        Ok(self
            .all_commands()
            .into_iter()
            .filter(CommandRecord::is_pending)
            .collect())
    }

    async fn append_reading(&self, reading: &BinReading) -> Result<(), StoreError> {
        self.check_writable()?;
        self.insert_reading(reading);
        Ok(())
    }

    async fn recent_readings(
        &self,
        bin_id: &BinId,
        limit: usize,
    ) -> Result<Vec<BinReading>, StoreError> {
        let Some(readings) = self.readings.get(bin_id) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<_> = readings.values().rev().take(limit).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    async fn append_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        self.check_writable()?;
        self.push_transition(transition);
        Ok(())
    }

    async fn transitions(&self, bin_id: &BinId) -> Result<Vec<Transition>, StoreError> {
        Ok(self
            .transitions
            .get(bin_id)
            .map(|log| log.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message captured by [`MemoryBus`].
pub struct Published {
    /// Destination topic.
    pub topic: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Whether the broker should retain it.
    pub retain: bool,
}

/// [`BusPublisher`] that records messages instead of sending them.
#[derive(Debug)]
pub struct MemoryBus {
    sent: Mutex<Vec<Published>>,
    online: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
        }
    }
}

impl MemoryBus {
    /// Create a bus with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes succeed or fail.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Everything published so far.
    pub async fn published(&self) -> Vec<Published> {
        self.sent.lock().await.clone()
    }

    /// Messages published on one topic.
    pub async fn published_on(&self, topic: &str) -> Vec<Published> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BusPublisher for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(PublishError::Bus("bus offline".to_owned()));
        }
        self.sent.lock().await.push(Published {
            topic: topic.to_owned(),
            payload,
            retain,
        });
        Ok(())
    }
}
