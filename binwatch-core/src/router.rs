//! Event router: the single writer for every bin.
//!
//! Inbound traffic is validated, turned into [`BinEvent`]s and queued on
//! the owning bin's worker. A worker step writes everything it produced,
//! bin state included, in one atomic store commit, and publishes only after
//! that commit succeeds. Publish retries also run as worker steps. A
//! persistence failure rolls the step back and halts command dispatch
//! until a later commit succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, IngestConfig, RouterConfig};
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::engine::{Outcome, StateEngine};
use crate::ingest::{IngestError, ReadingIngestor};
use crate::model::{
    ActuatorOutcome, AlertEvent, AlertId, BinId, BinReading, BinState, BinStatus, CommandId,
    CommandRecord,
};
use crate::ports::{BinStore, BusPublisher, StepWrite, StoreError};
use crate::retry::RetryPolicy;
use crate::wire::{AckPayload, AlertAckPayload, InboundTopic, OperationalAlert, RawMessage};
use crate::workers::{BinHandler, WorkerError, WorkerRegistry};

#[derive(Debug, Clone, PartialEq)]
/// Work item for a single bin.
pub enum BinEvent {
    /// A validated sensor reading.
    Reading(BinReading),
    /// The actuator answered a command.
    ActuatorResponse {
        /// Command being answered.
        command_id: CommandId,
        /// Reported result.
        outcome: ActuatorOutcome,
    },
    /// A command may have outlived its timeout.
    CommandTimeout {
        /// Command to check.
        command_id: CommandId,
    },
    /// Retry a command whose publish failed.
    Republish {
        /// Command to send.
        command_id: CommandId,
    },
    /// Check whether the bin has gone silent.
    StalenessCheck,
    /// An operator acknowledged an alert.
    AcknowledgeAlert {
        /// Alert being acknowledged.
        alert_id: AlertId,
    },
    /// The bin waits for an emptying that no command tracks any more.
    Reconcile,
    /// Deregister the bin.
    Deregister,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of one worker step.
pub enum StepReport {
    /// A new bin state was durably written.
    Committed {
        /// State after the step.
        state: BinState,
        /// Alert raised by the step.
        alert: Option<AlertEvent>,
        /// Command created by the step.
        command: Option<CommandRecord>,
    },
    /// The event required no change.
    Unchanged,
    /// Alert acknowledgement handled; `false` if no unacknowledged alert
    /// of this bin had the id.
    AlertAcknowledged(bool),
    /// A command whose earlier publish failed went out.
    CommandPublished(CommandId),
    /// The bin was removed.
    Deregistered,
    /// Persistence failed; nothing from the step was committed.
    RolledBack(String),
}

#[derive(Error, Debug)]
/// Reasons inbound traffic was not queued.
pub enum RouterError {
    /// [`EventRouter::recover`] has not completed yet.
    #[error("Router not ready; recovery has not run")]
    NotReady,
    /// The topic is not one the engine consumes.
    #[error("Unroutable topic: {0}")]
    Unroutable(String),
    /// A fill message was rejected by the ingestor.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// An acknowledgement payload could not be decoded.
    #[error("Malformed {topic} payload: {source}")]
    Decode {
        /// Topic the payload arrived on.
        topic: String,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// The bin's worker could not take the event.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What [`EventRouter::recover`] found.
pub struct RecoveryReport {
    /// Bins whose state was loaded.
    pub bins: usize,
    /// Pending commands resumed.
    pub pending_commands: usize,
    /// Resumed commands that had never been published and went out.
    pub republished: usize,
    /// Bins waiting on an emptying no command tracks.
    pub orphaned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What one [`EventRouter::sweep`] queued.
pub struct SweepReport {
    /// Publish retries queued.
    pub publish_retries: usize,
    /// Timeout checks queued.
    pub timeouts: usize,
    /// Staleness checks queued.
    pub stale: usize,
    /// Reconciliations queued.
    pub orphaned: usize,
}

/// Handle on the report of a queued event.
#[derive(Debug)]
pub struct Receipt(oneshot::Receiver<StepReport>);

impl Receipt {
    /// Wait until the bin's worker has handled the event.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Worker`] if the worker stopped first.
    pub async fn wait(self) -> Result<StepReport, RouterError> {
        self.0
            .await
            .map_err(|_closed| RouterError::Worker(WorkerError::NoReply))
    }
}

struct Job {
    event: BinEvent,
    at: DateTime<Utc>,
}

struct BinProcessor {
    engine: StateEngine,
    ingestor: Arc<ReadingIngestor>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn BinStore>,
    states: DashMap<BinId, BinState>,
    persist: RetryPolicy,
}

#[async_trait]
impl BinHandler for BinProcessor {
    type Event = Job;
    type Report = StepReport;

    async fn handle(&self, bin_id: &BinId, job: Job) -> StepReport {
        let Job { event, at } = job;
        match event {
            BinEvent::Reading(reading) => self.on_reading(reading, at).await,
            BinEvent::ActuatorResponse {
                command_id,
                outcome,
            } => self.on_actuator_response(bin_id, command_id, outcome, at).await,
            BinEvent::CommandTimeout { command_id } => {
                self.on_command_timeout(bin_id, command_id, at).await
            }
            BinEvent::Republish { command_id } => self.on_republish(bin_id, command_id, at).await,
            BinEvent::StalenessCheck => self.on_staleness_check(bin_id, at).await,
            BinEvent::AcknowledgeAlert { alert_id } => {
                self.on_alert_ack(bin_id, alert_id, at).await
            }
            BinEvent::Reconcile => self.on_reconcile(bin_id, at).await,
            BinEvent::Deregister => self.on_deregister(bin_id, at).await,
        }
    }
}

impl BinProcessor {
    fn state_of(&self, bin_id: &BinId) -> Option<BinState> {
        self.states.get(bin_id).map(|state| state.clone())
    }

    fn awaits_command(&self, state: &BinState) -> bool {
        let waiting = state.status == BinStatus::EmptyingInProgress
            || (state.status == BinStatus::Offline
                && state.status_before_offline == Some(BinStatus::EmptyingInProgress));
        waiting && self.dispatcher.pending_for(&state.bin_id).is_none()
    }

    async fn on_reading(&self, reading: BinReading, at: DateTime<Utc>) -> StepReport {
        let bin_id = reading.bin_id.clone();
        let current = self.state_of(&bin_id);
        let mut outcome = self.engine.apply(current.as_ref(), &reading);

        if outcome.intent.is_some() {
            if self.dispatcher.is_halted() {
                info!(bin = %bin_id, "dispatch halted, emptying deferred");
                outcome = self.engine.defer_intent(outcome);
            } else if let Some(existing) = self.dispatcher.pending_for(&bin_id) {
                warn!(bin = %bin_id, command = %existing.command_id, "command already pending, emptying deferred");
                outcome = self.engine.defer_intent(outcome);
            }
        }

        match self.commit(Some(&reading), outcome, at).await {
            Ok(report) => report,
            Err(err) => {
                self.ingestor.forget(&bin_id, reading.source_sequence);
                self.fail(&bin_id, &err, at).await
            }
        }
    }

    async fn on_actuator_response(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        outcome: ActuatorOutcome,
        at: DateTime<Utc>,
    ) -> StepReport {
        let resolved = match self
            .persist
            .run("resolve_command", || {
                self.dispatcher
                    .on_actuator_response(bin_id, command_id, outcome, at)
            })
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return StepReport::Unchanged,
            Err(err) => return self.fail(bin_id, &err, at).await,
        };

        let Some(state) = self.state_of(bin_id) else {
            warn!(bin = %bin_id, command = %resolved.command_id, "response for bin without state");
            return StepReport::Unchanged;
        };
        let next = match outcome {
            ActuatorOutcome::Done => {
                info!(bin = %bin_id, command = %command_id, "bin emptied");
                self.engine.on_emptied(&state, at)
            }
            ActuatorOutcome::Failed => {
                warn!(bin = %bin_id, command = %command_id, "actuator reported failure");
                let backoff = self.dispatcher.backoff_for(state.failed_attempts);
                self.engine.on_command_failed(&state, at, backoff)
            }
        };
        self.commit_or_fail(bin_id, next, at).await
    }

    async fn on_command_timeout(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        at: DateTime<Utc>,
    ) -> StepReport {
        let expired = match self
            .persist
            .run("expire_command", || self.dispatcher.expire(bin_id, command_id, at))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return StepReport::Unchanged,
            Err(err) => return self.fail(bin_id, &err, at).await,
        };

        let Some(state) = self.state_of(bin_id) else {
            return StepReport::Unchanged;
        };
        let backoff = self.dispatcher.backoff_for(state.failed_attempts);
        debug!(bin = %bin_id, command = %expired.command_id, backoff_secs = backoff.num_seconds(), "re-arming after timeout");
        let next = self.engine.on_command_failed(&state, at, backoff);
        self.commit_or_fail(bin_id, next, at).await
    }

    async fn on_republish(
        &self,
        bin_id: &BinId,
        command_id: CommandId,
        at: DateTime<Utc>,
    ) -> StepReport {
        match self.dispatcher.republish(bin_id, command_id, at).await {
            Ok(true) => StepReport::CommandPublished(command_id),
            Ok(false) => StepReport::Unchanged,
            Err(err) => {
                debug!(bin = %bin_id, command = %command_id, error = %err, "command still unpublished");
                StepReport::Unchanged
            }
        }
    }

    async fn on_staleness_check(&self, bin_id: &BinId, at: DateTime<Utc>) -> StepReport {
        let Some(outcome) = self
            .state_of(bin_id)
            .and_then(|state| self.engine.mark_offline(&state, at))
        else {
            return StepReport::Unchanged;
        };
        warn!(bin = %bin_id, "no readings within staleness window, bin offline");
        self.commit_or_fail(bin_id, outcome, at).await
    }

    async fn on_alert_ack(&self, bin_id: &BinId, alert_id: AlertId, at: DateTime<Utc>) -> StepReport {
        match self
            .persist
            .run("acknowledge_alert", || {
                self.store.acknowledge_alert(bin_id, &alert_id)
            })
            .await
        {
            Ok(changed) => {
                if changed {
                    info!(bin = %bin_id, alert = %alert_id, "alert acknowledged");
                } else {
                    debug!(bin = %bin_id, alert = %alert_id, "no open alert of this bin to acknowledge");
                }
                StepReport::AlertAcknowledged(changed)
            }
            Err(err) => self.fail(bin_id, &DispatchError::from(err), at).await,
        }
    }

    async fn on_reconcile(&self, bin_id: &BinId, at: DateTime<Utc>) -> StepReport {
        let Some(state) = self.state_of(bin_id).filter(|state| self.awaits_command(state)) else {
            return StepReport::Unchanged;
        };
        warn!(bin = %bin_id, "emptying without a tracked command, re-arming");
        let backoff = self.dispatcher.backoff_for(state.failed_attempts);
        let next = self.engine.on_command_failed(&state, at, backoff);
        self.commit_or_fail(bin_id, next, at).await
    }

    async fn on_deregister(&self, bin_id: &BinId, at: DateTime<Utc>) -> StepReport {
        if let Err(err) = self
            .persist
            .run("delete_bin", || self.store.delete_bin(bin_id, at))
            .await
        {
            return self.fail(bin_id, &DispatchError::from(err), at).await;
        }
        self.states.remove(bin_id);
        self.dispatcher.drop_bin(bin_id);
        self.ingestor.drop_bin(bin_id);
        info!(bin = %bin_id, "bin deregistered");
        StepReport::Deregistered
    }

    async fn commit_or_fail(&self, bin_id: &BinId, outcome: Outcome, at: DateTime<Utc>) -> StepReport {
        match self.commit(None, outcome, at).await {
            Ok(report) => report,
            Err(err) => self.fail(bin_id, &err, at).await,
        }
    }

    async fn commit(
        &self,
        reading: Option<&BinReading>,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<StepReport, DispatchError> {
        let bin_id = outcome.state.bin_id.clone();
        let prepared = match &outcome.intent {
            Some(intent) => Some(self.dispatcher.draft(intent, at)?),
            None => None,
        };

        let write = StepWrite {
            state: outcome.state.clone(),
            reading: reading.cloned(),
            alert: outcome.alert.clone(),
            transitions: outcome.transitions.clone(),
            command: prepared.clone(),
        };
        self.persist
            .run("commit_step", || self.store.commit_step(&write))
            .await?;

        self.states.insert(bin_id.clone(), outcome.state.clone());
        self.dispatcher.reopen();
        for transition in &outcome.transitions {
            info!(bin = %bin_id, from = %transition.from, to = %transition.to, "status changed");
        }

        let command = match prepared {
            Some(record) => match self.dispatcher.track(record.clone()) {
                Ok(()) => {
                    if let Err(err) = self.dispatcher.publish(record.command_id, at).await {
                        debug!(bin = %bin_id, error = %err, "command left for republish");
                    }
                    Some(self.dispatcher.pending_for(&bin_id).unwrap_or(record))
                }
                Err(err) => {
                    warn!(bin = %bin_id, error = %err, "stored command not tracked, left for reconciliation");
                    None
                }
            },
            None => None,
        };
        if let Some(alert) = &outcome.alert {
            info!(bin = %bin_id, alert = %alert.alert_id, severity = %alert.severity, "alert raised");
            if let Err(err) = self.dispatcher.publish_alert(alert).await {
                warn!(bin = %bin_id, error = %err, "alert publish failed");
            }
        }
        if let Err(err) = self.dispatcher.publish_status(&outcome.state).await {
            warn!(bin = %bin_id, error = %err, "status publish failed");
        }

        Ok(StepReport::Committed {
            state: outcome.state,
            alert: outcome.alert,
            command,
        })
    }

    async fn fail(&self, bin_id: &BinId, err: &DispatchError, at: DateTime<Utc>) -> StepReport {
        error!(bin = %bin_id, error = %err, "persistence failed, step rolled back");
        self.dispatcher.halt();
        let alert = OperationalAlert {
            kind: "persistence_failure".to_owned(),
            bin_id: Some(bin_id.clone()),
            message: err.to_string(),
            raised_at: at,
        };
        if let Err(publish_err) = self.dispatcher.publish_operational(&alert).await {
            warn!(error = %publish_err, "operational alert publish failed");
        }
        StepReport::RolledBack(err.to_string())
    }
}

/// Routes inbound traffic and sweeps onto per-bin workers.
pub struct EventRouter {
    processor: Arc<BinProcessor>,
    workers: WorkerRegistry<BinProcessor>,
    ingestor: Arc<ReadingIngestor>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn BinStore>,
    dedup_window: usize,
    ready: AtomicBool,
}

impl EventRouter {
    /// Wire the engine, ingestor, and dispatcher to a store and a bus.
    #[must_use]
    pub fn new(
        store: Arc<dyn BinStore>,
        bus: Arc<dyn BusPublisher>,
        engine: EngineConfig,
        ingest: IngestConfig,
        router: &RouterConfig,
    ) -> Self {
        let dedup_window = ingest.dedup_window;
        let ingestor = Arc::new(ReadingIngestor::new(ingest));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&store),
            bus,
            engine.clone(),
        ));
        let processor = Arc::new(BinProcessor {
            engine: StateEngine::new(engine),
            ingestor: Arc::clone(&ingestor),
            dispatcher: Arc::clone(&dispatcher),
            store: Arc::clone(&store),
            states: DashMap::new(),
            persist: RetryPolicy {
                max_retries: router.persist_retries,
                initial_delay: Duration::from_millis(router.persist_initial_delay_ms),
                max_delay: Duration::from_millis(router.persist_max_delay_ms),
            },
        });
        let workers = WorkerRegistry::new(
            Arc::clone(&processor),
            router.queue_depth,
            router.max_concurrent_bins,
        );

        Self {
            processor,
            workers,
            ingestor,
            dispatcher,
            store,
            dedup_window,
            ready: AtomicBool::new(false),
        }
    }

    /// Reload persisted state and resume in-flight commands.
    ///
    /// Must complete before [`handle_message`](Self::handle_message)
    /// accepts traffic. Pending commands that were never published go out
    /// once; the others keep their timeout clock.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if persisted state cannot be read.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        let states = self.store.load_all_states().await?;
        for state in &states {
            let history = self
                .store
                .recent_readings(&state.bin_id, self.dedup_window)
                .await?;
            self.ingestor.prime(&state.bin_id, &history);
            self.processor
                .states
                .insert(state.bin_id.clone(), state.clone());
        }

        let pending = self.store.load_all_pending().await?;
        let resumed = self.dispatcher.resume(pending, now).await;

        let orphans: Vec<BinId> = states
            .iter()
            .filter(|state| self.processor.awaits_command(state))
            .map(|state| state.bin_id.clone())
            .collect();
        self.ready.store(true, Ordering::SeqCst);

        for bin_id in &orphans {
            let job = Job {
                event: BinEvent::Reconcile,
                at: now,
            };
            if let Err(err) = self.workers.submit(bin_id, job).await {
                warn!(bin = %bin_id, error = %err, "could not queue reconciliation");
            }
        }

        let report = RecoveryReport {
            bins: states.len(),
            pending_commands: resumed.adopted,
            republished: resumed.republished,
            orphaned: orphans.len(),
        };
        info!(
            bins = report.bins,
            pending_commands = report.pending_commands,
            republished = report.republished,
            orphaned = report.orphaned,
            "recovery complete"
        );
        Ok(report)
    }

    /// Whether [`recover`](Self::recover) has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Validate an inbound bus message and queue it on its bin.
    ///
    /// The returned [`Receipt`] may be dropped; the event is handled either way.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NotReady`] before recovery,
    /// [`RouterError::Ingest`] for malformed or duplicate readings,
    /// [`RouterError::Decode`] for malformed acknowledgements, and
    /// [`RouterError::Unroutable`] for foreign topics.
    pub async fn handle_message(
        &self,
        raw: &RawMessage,
        now: DateTime<Utc>,
    ) -> Result<Receipt, RouterError> {
        if !self.is_ready() {
            return Err(RouterError::NotReady);
        }
        let Some(topic) = InboundTopic::parse(&raw.topic) else {
            return Err(RouterError::Unroutable(raw.topic.clone()));
        };

        let event = match &topic {
            InboundTopic::Fill(_) => BinEvent::Reading(self.ingestor.ingest(raw, now)?),
            InboundTopic::CommandAck(_) => {
                let ack: AckPayload = decode(raw)?;
                BinEvent::ActuatorResponse {
                    command_id: ack.command_id,
                    outcome: ack.outcome,
                }
            }
            InboundTopic::AlertAck(_) => {
                let ack: AlertAckPayload = decode(raw)?;
                BinEvent::AcknowledgeAlert {
                    alert_id: ack.alert_id,
                }
            }
        };
        self.submit(topic.bin_id(), event, now).await
    }

    /// Queue an event on a bin's worker.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Worker`] after shutdown.
    pub async fn submit(
        &self,
        bin_id: &BinId,
        event: BinEvent,
        at: DateTime<Utc>,
    ) -> Result<Receipt, RouterError> {
        let receiver = self.workers.enqueue(bin_id, Job { event, at }).await?;
        Ok(Receipt(receiver))
    }

    /// Queue an event and wait for its step to finish.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Worker`] after shutdown.
    pub async fn process(
        &self,
        bin_id: &BinId,
        event: BinEvent,
        at: DateTime<Utc>,
    ) -> Result<StepReport, RouterError> {
        self.submit(bin_id, event, at).await?.wait().await
    }

    /// Queue publish retries, timeout checks, staleness checks, and
    /// reconciliations on the bins they concern.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_ready() {
            return report;
        }

        let unpublished = self.dispatcher.unpublished();
        let timeouts = self.dispatcher.sweep_timeouts(now);
        let mut stale = Vec::new();
        let mut orphans = Vec::new();
        for entry in self.processor.states.iter() {
            if self.processor.engine.mark_offline(entry.value(), now).is_some() {
                stale.push(entry.key().clone());
            } else if self.processor.awaits_command(entry.value()) {
                orphans.push(entry.key().clone());
            }
        }

        for (bin_id, command_id) in unpublished {
            if self.queue(&bin_id, BinEvent::Republish { command_id }, now).await {
                report.publish_retries += 1;
            }
        }
        for (bin_id, command_id) in timeouts {
            if self.queue(&bin_id, BinEvent::CommandTimeout { command_id }, now).await {
                report.timeouts += 1;
            }
        }
        for bin_id in stale {
            if self.queue(&bin_id, BinEvent::StalenessCheck, now).await {
                report.stale += 1;
            }
        }
        for bin_id in orphans {
            if self.queue(&bin_id, BinEvent::Reconcile, now).await {
                report.orphaned += 1;
            }
        }
        if report != SweepReport::default() {
            debug!(
                publish_retries = report.publish_retries,
                in_flight = self.dispatcher.pending_count(),
                timeouts = report.timeouts,
                stale = report.stale,
                orphaned = report.orphaned,
                "sweep queued work"
            );
        }
        report
    }

    /// Deregister a bin and retire its worker. Alerts and command records
    /// stay in the store.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Worker`] after shutdown.
    pub async fn deregister(
        &self,
        bin_id: &BinId,
        at: DateTime<Utc>,
    ) -> Result<StepReport, RouterError> {
        let report = self.process(bin_id, BinEvent::Deregister, at).await?;
        if matches!(report, StepReport::Deregistered) {
            self.workers.remove(bin_id);
        }
        Ok(report)
    }

    /// Latest committed state of a bin.
    #[must_use]
    pub fn bin_state(&self, bin_id: &BinId) -> Option<BinState> {
        self.processor.state_of(bin_id)
    }

    /// Alerts not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the read fails.
    pub async fn active_alerts(&self) -> Result<Vec<AlertEvent>, StoreError> {
        self.store.active_alerts().await
    }

    /// The command dispatcher, for inspection.
    #[must_use]
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Stop accepting events and drain every bin's queue.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.workers.shutdown().await;
        info!("event router stopped");
    }

    async fn queue(&self, bin_id: &BinId, event: BinEvent, at: DateTime<Utc>) -> bool {
        match self.workers.submit(bin_id, Job { event, at }).await {
            Ok(()) => true,
            Err(err) => {
                warn!(bin = %bin_id, error = %err, "could not queue sweep event");
                false
            }
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &RawMessage) -> Result<T, RouterError> {
    serde_json::from_slice(&raw.payload).map_err(|source| {
        warn!(topic = %raw.topic, error = %source, "malformed acknowledgement dropped");
        RouterError::Decode {
            topic: raw.topic.clone(),
            source,
        }
    })
}
