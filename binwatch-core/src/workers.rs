//! Registry of per-bin workers.
//!
//! Each bin gets its own task fed by a bounded queue, so events for one bin
//! are handled strictly in arrival order while different bins run in
//! parallel. A shared semaphore caps how many bins do work at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::model::BinId;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons an event could not be delivered to a worker.
pub enum WorkerError {
    /// The registry is shutting down.
    #[error("Worker registry is shut down")]
    ShutDown,
    /// The worker stopped before answering.
    #[error("Worker stopped before replying")]
    NoReply,
}

#[async_trait]
/// Per-bin event handling logic run by the workers.
pub trait BinHandler: Send + Sync + 'static {
    /// Event type queued for a bin.
    type Event: Send + 'static;
    /// Result reported back to a waiting caller.
    type Report: Send + 'static;

    /// Handle one event. Calls for the same bin never overlap.
    async fn handle(&self, bin_id: &BinId, event: Self::Event) -> Self::Report;
}

struct Envelope<H: BinHandler> {
    event: H::Event,
    reply: Option<oneshot::Sender<H::Report>>,
}

struct Worker<H: BinHandler> {
    sender: mpsc::Sender<Envelope<H>>,
    task: JoinHandle<()>,
}

/// Spawns, feeds, and retires per-bin workers.
pub struct WorkerRegistry<H: BinHandler> {
    handler: Arc<H>,
    workers: DashMap<BinId, Worker<H>>,
    permits: Arc<Semaphore>,
    queue_depth: usize,
    closed: AtomicBool,
}

impl<H: BinHandler> WorkerRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new(handler: Arc<H>, queue_depth: usize, max_concurrent_bins: usize) -> Self {
        Self {
            handler,
            workers: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_bins.max(1))),
            queue_depth: queue_depth.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an event for a bin, waiting while its queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn submit(&self, bin_id: &BinId, event: H::Event) -> Result<(), WorkerError> {
        self.deliver(bin_id, Envelope { event, reply: None }).await
    }

    /// Queue an event and return a receiver for the worker's report.
    ///
    /// Dropping the receiver does not cancel the event.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn enqueue(
        &self,
        bin_id: &BinId,
        event: H::Event,
    ) -> Result<oneshot::Receiver<H::Report>, WorkerError> {
        let (reply, response) = oneshot::channel();
        self.deliver(
            bin_id,
            Envelope {
                event,
                reply: Some(reply),
            },
        )
        .await?;
        Ok(response)
    }

    /// Retire a bin's worker once its queue drains.
    pub fn remove(&self, bin_id: &BinId) {
        if self.workers.remove(bin_id).is_some() {
            debug!(bin = %bin_id, "worker retired");
        }
    }

    /// Stop accepting events and wait for every queue to drain.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let bins: Vec<BinId> = self.workers.iter().map(|worker| worker.key().clone()).collect();
        let mut tasks = Vec::with_capacity(bins.len());
        for bin_id in bins {
            if let Some((_, worker)) = self.workers.remove(&bin_id) {
                drop(worker.sender);
                tasks.push((bin_id, worker.task));
            }
        }
        for (bin_id, task) in tasks {
            if let Err(err) = task.await {
                warn!(bin = %bin_id, error = %err, "worker ended abnormally");
            }
        }
    }

    async fn deliver(&self, bin_id: &BinId, envelope: Envelope<H>) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::ShutDown);
        }

        let sender = self.sender_for(bin_id);
        match sender.send(envelope).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(envelope)) => {
                warn!(bin = %bin_id, "worker gone, respawning");
                self.workers
                    .remove_if(bin_id, |_, worker| worker.sender.same_channel(&sender));
                self.sender_for(bin_id)
                    .send(envelope)
                    .await
                    .map_err(|_closed| WorkerError::ShutDown)
            }
        }
    }

    fn sender_for(&self, bin_id: &BinId) -> mpsc::Sender<Envelope<H>> {
        self.workers
            .entry(bin_id.clone())
            .or_insert_with(|| self.spawn(bin_id.clone()))
            .sender
            .clone()
    }

    fn spawn(&self, bin_id: BinId) -> Worker<H> {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let task = tokio::spawn(run_worker(
            bin_id,
            Arc::clone(&self.handler),
            Arc::clone(&self.permits),
            receiver,
        ));
        Worker { sender, task }
    }
}

async fn run_worker<H: BinHandler>(
    bin_id: BinId,
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    mut receiver: mpsc::Receiver<Envelope<H>>,
) {
    debug!(bin = %bin_id, "worker started");
    while let Some(envelope) = receiver.recv().await {
        let permit = permits.acquire().await.ok();
        let report = handler.handle(&bin_id, envelope.event).await;
        drop(permit);
        if let Some(reply) = envelope.reply
            && reply.send(report).is_err()
        {
            trace!(bin = %bin_id, "report dropped");
        }
    }
    debug!(bin = %bin_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Mutex;
    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(BinId, u32)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl BinHandler for Recorder {
        type Event = u32;
        type Report = usize;

        async fn handle(&self, bin_id: &BinId, event: u32) -> usize {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            sleep(Duration::from_millis(2)).await;
            let mut seen = self.seen.lock().await;
            seen.push((bin_id.clone(), event));
            self.running.fetch_sub(1, Ordering::SeqCst);
            seen.len()
        }
    }

    #[tokio::test]
    async fn events_for_one_bin_keep_their_order() {
        let recorder = Arc::new(Recorder::default());
        let registry = WorkerRegistry::new(Arc::clone(&recorder), 4, 8);
        let bin = BinId::new("B1");

        for event in 0..20 {
            registry.submit(&bin, event).await.expect("accepted");
        }
        registry.shutdown().await;

        let seen: Vec<u32> = recorder.seen.lock().await.iter().map(|(_, event)| *event).collect();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_across_bins() {
        let recorder = Arc::new(Recorder::default());
        let registry = WorkerRegistry::new(Arc::clone(&recorder), 4, 2);

        for index in 0..6 {
            registry
                .submit(&BinId::new(format!("B{index}")), 1)
                .await
                .expect("accepted");
        }
        registry.shutdown().await;

        assert_eq!(recorder.seen.lock().await.len(), 6);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2, "at most two bins at once");
    }

    #[tokio::test]
    async fn enqueue_returns_report_and_shutdown_refuses_more() {
        let registry = WorkerRegistry::new(Arc::new(Recorder::default()), 4, 4);
        let bin = BinId::new("B1");

        let report = registry.enqueue(&bin, 7).await.expect("accepted");
        assert_eq!(report.await, Ok(1));
        registry.shutdown().await;
        assert_eq!(registry.submit(&bin, 8).await, Err(WorkerError::ShutDown));
    }
}
