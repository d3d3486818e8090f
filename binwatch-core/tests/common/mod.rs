//! Shared fixtures for router integration tests.

#![allow(
    dead_code,
    reason = "each test binary uses a different subset of the fixtures"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use binwatch_core::{
    ActuatorOutcome, AlertEvent, AlertId, BinEvent, BinId, BinReading, BinState, BinStatus,
    BinStore, BusPublisher, CommandId, CommandRecord, EngineConfig, EventRouter, IngestConfig, MemoryBus, MemoryStore,
    RawMessage, RouterConfig, RouterError, StepReport, StepWrite, StoreError, Transition,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::{Notify, watch};

/// Fixed epoch for all test timestamps.
pub const EPOCH_SECS: i64 = 1_700_000_000;

/// Test time `secs` seconds after the fixed epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(EPOCH_SECS, 0).expect("valid epoch") + TimeDelta::seconds(secs)
}

/// Router settings with short persistence retries.
pub fn fast_router() -> RouterConfig {
    RouterConfig {
        persist_retries: 2,
        persist_initial_delay_ms: 1,
        persist_max_delay_ms: 2,
        ..RouterConfig::default()
    }
}

/// Status committed by a step, if it committed.
pub fn committed_status(report: &StepReport) -> Option<BinStatus> {
    match report {
        StepReport::Committed { state, .. } => Some(state.status),
        _ => None,
    }
}

/// `bins/{bin}/fill` message for a reading taken `secs` after the epoch.
pub fn fill_message(bin: &str, sequence: u64, fill: f64, secs: i64) -> RawMessage {
    let payload = json!({
        "fillPercent": fill,
        "timestamp": EPOCH_SECS + secs,
        "sourceSequence": sequence,
    });
    RawMessage::new(format!("bins/{bin}/fill"), payload.to_string().into_bytes())
}

/// `bins/{bin}/command/ack` message.
pub fn ack_message(bin: &str, command_id: CommandId, outcome: ActuatorOutcome) -> RawMessage {
    let payload = json!({ "commandId": command_id, "outcome": outcome });
    RawMessage::new(
        format!("bins/{bin}/command/ack"),
        payload.to_string().into_bytes(),
    )
}

/// `bins/{bin}/alert/ack` message.
pub fn alert_ack_message(bin: &str, alert_id: AlertId) -> RawMessage {
    let payload = json!({ "alertId": alert_id });
    RawMessage::new(
        format!("bins/{bin}/alert/ack"),
        payload.to_string().into_bytes(),
    )
}

/// A recovered router over in-memory adapters.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<MemoryBus>,
    pub router: EventRouter,
}

impl Harness {
    /// Fresh store and bus with default thresholds.
    pub async fn start() -> Self {
        Self::with_engine(EngineConfig::default()).await
    }

    /// Fresh store and bus with custom thresholds.
    pub async fn with_engine(engine: EngineConfig) -> Self {
        Self::resume(Arc::new(MemoryStore::new()), Arc::new(MemoryBus::new()), engine).await
    }

    /// Router over existing adapters, as after a restart.
    pub async fn resume(store: Arc<MemoryStore>, bus: Arc<MemoryBus>, engine: EngineConfig) -> Self {
        let backend: Arc<dyn BinStore> = Arc::clone(&store) as Arc<dyn BinStore>;
        Self::build(backend, store, bus, engine).await
    }

    /// Fresh adapters with the router writing through a [`GatedStore`].
    pub async fn gated() -> (Self, Arc<GatedStore>) {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(GatedStore::new(Arc::clone(&store)));
        let backend: Arc<dyn BinStore> = Arc::clone(&gate) as Arc<dyn BinStore>;
        let harness = Self::build(
            backend,
            store,
            Arc::new(MemoryBus::new()),
            EngineConfig::default(),
        )
        .await;
        (harness, gate)
    }

    async fn build(
        backend: Arc<dyn BinStore>,
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        engine: EngineConfig,
    ) -> Self {
        let router = EventRouter::new(
            backend,
            Arc::clone(&bus) as Arc<dyn BusPublisher>,
            engine,
            IngestConfig::default(),
            &fast_router(),
        );
        router.recover(at(0)).await.expect("recovery");
        Self { store, bus, router }
    }

    /// Deliver a fill reading and wait for its step.
    pub async fn fill(&self, bin: &str, sequence: u64, fill: f64, secs: i64) -> StepReport {
        self.deliver(&fill_message(bin, sequence, fill, secs), secs)
            .await
            .expect("reading accepted")
    }

    /// Deliver any message at `secs` and wait for its step.
    pub async fn deliver(&self, raw: &RawMessage, secs: i64) -> Result<StepReport, RouterError> {
        self.router.handle_message(raw, at(secs)).await?.wait().await
    }

    /// Wait until every event queued on `bin` so far has been handled.
    pub async fn settle(&self, bin: &str, secs: i64) {
        self.router
            .process(&BinId::new(bin), BinEvent::Reconcile, at(secs))
            .await
            .expect("worker alive");
    }

    /// Run a sweep and wait for the work it queued on `bin`.
    pub async fn sweep(&self, bin: &str, secs: i64) {
        self.router.sweep(at(secs)).await;
        self.settle(bin, secs).await;
    }
}

/// [`MemoryStore`] wrapper that can hold one bin's writes at a gate and
/// fail step commits on demand.
pub struct GatedStore {
    pub inner: Arc<MemoryStore>,
    held: Mutex<Option<BinId>>,
    open: watch::Sender<bool>,
    entered: Notify,
    fail_commits: AtomicBool,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            held: Mutex::new(None),
            open: watch::Sender::new(true),
            entered: Notify::new(),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Block command and step writes for `bin` until [`release`](Self::release).
    pub fn hold(&self, bin: &str) {
        *self.held.lock().expect("gate lock") = Some(BinId::new(bin));
        self.open.send_replace(false);
    }

    /// Let every held write through.
    pub fn release(&self) {
        *self.held.lock().expect("gate lock") = None;
        self.open.send_replace(true);
    }

    /// Make step commits fail with [`StoreError::Unavailable`].
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Wait until a write for the held bin reached the gate.
    pub async fn reached(&self) {
        self.entered.notified().await;
    }

    async fn pass(&self, bin_id: &BinId) {
        let held = self.held.lock().expect("gate lock").as_ref() == Some(bin_id);
        if !held {
            return;
        }
        self.entered.notify_one();
        let mut open = self.open.subscribe();
        open.wait_for(|open| *open).await.expect("gate alive");
    }
}

#[async_trait]
impl BinStore for GatedStore {
    async fn save_state(&self, state: &BinState) -> Result<(), StoreError> {
        self.inner.save_state(state).await
    }

    async fn load_state(&self, bin_id: &BinId) -> Result<Option<BinState>, StoreError> {
        self.inner.load_state(bin_id).await
    }

    async fn load_all_states(&self) -> Result<Vec<BinState>, StoreError> {
        self.inner.load_all_states().await
    }

    async fn commit_step(&self, step: &StepWrite) -> Result<(), StoreError> {
        self.pass(&step.state.bin_id).await;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.inner.commit_step(step).await
    }

    async fn delete_bin(&self, bin_id: &BinId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.delete_bin(bin_id, at).await
    }

    async fn append_alert(&self, alert: &AlertEvent) -> Result<(), StoreError> {
        self.inner.append_alert(alert).await
    }

    async fn acknowledge_alert(
        &self,
        bin_id: &BinId,
        alert_id: &AlertId,
    ) -> Result<bool, StoreError> {
        self.inner.acknowledge_alert(bin_id, alert_id).await
    }

    async fn active_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        self.inner.active_alerts().await
    }

    async fn save_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        self.pass(&record.bin_id).await;
        self.inner.save_command(record).await
    }

    async fn load_all_pending(&self) -> Result<Vec<CommandRecord>, StoreError> {
        self.inner.load_all_pending().await
    }

    async fn append_reading(&self, reading: &BinReading) -> Result<(), StoreError> {
        self.inner.append_reading(reading).await
    }

    async fn recent_readings(
        &self,
        bin_id: &BinId,
        limit: usize,
    ) -> Result<Vec<BinReading>, StoreError> {
        self.inner.recent_readings(bin_id, limit).await
    }

    async fn append_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        self.inner.append_transition(transition).await
    }

    async fn transitions(&self, bin_id: &BinId) -> Result<Vec<Transition>, StoreError> {
        self.inner.transitions(bin_id).await
    }
}
