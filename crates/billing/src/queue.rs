//! Work queue and worker pool
//!
//! Two bounded lanes feed a fixed pool of workers: manual runs go on the high
//! lane and are always taken first, periodic ticks use the normal lane. The
//! pool size bounds concurrent load on the payment gateway.
//!
//! Closing the queue stops new work from being accepted; workers keep going
//! until both lanes are drained.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batch::Batch;
use crate::error::{BillingError, BillingResult};
use crate::orchestrator::{RenewalOrchestrator, RunMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Manual `run_now` triggers
    High,
    /// Periodic ticks
    Normal,
}

/// One subscription to process
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub subscription_id: Uuid,
    pub batch: Arc<Batch>,
    pub mode: RunMode,
}

struct Lanes {
    high: mpsc::Sender<WorkItem>,
    normal: mpsc::Sender<WorkItem>,
}

struct Receivers {
    high: mpsc::Receiver<WorkItem>,
    normal: mpsc::Receiver<WorkItem>,
}

/// Producer side, cheap to clone
#[derive(Clone)]
pub struct WorkQueue {
    lanes: Arc<RwLock<Option<Lanes>>>,
}

impl WorkQueue {
    /// Enqueue an item, waiting for room if the lane is full
    pub async fn enqueue(&self, item: WorkItem, priority: Priority) -> BillingResult<()> {
        let sender = {
            let lanes = self.lanes.read().await;
            let lanes = lanes.as_ref().ok_or(BillingError::QueueClosed)?;
            match priority {
                Priority::High => lanes.high.clone(),
                Priority::Normal => lanes.normal.clone(),
            }
        };

        let batch = Arc::clone(&item.batch);
        sender
            .send(item)
            .await
            .map_err(|_| BillingError::QueueClosed)?;
        batch.note_enqueued();
        Ok(())
    }

    /// Stop accepting work. Items already queued are still processed.
    pub async fn close(&self) {
        self.lanes.write().await.take();
    }

    pub async fn is_closed(&self) -> bool {
        self.lanes.read().await.is_none()
    }
}

/// Fixed set of workers draining a [`WorkQueue`]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        orchestrator: RenewalOrchestrator,
        worker_count: usize,
        capacity: usize,
    ) -> (WorkQueue, WorkerPool) {
        let capacity = capacity.max(1);
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);

        let receivers = Arc::new(Mutex::new(Receivers {
            high: high_rx,
            normal: normal_rx,
        }));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let receivers = Arc::clone(&receivers);
                let orchestrator = orchestrator.clone();
                tokio::spawn(run_worker(worker, receivers, orchestrator))
            })
            .collect();

        let queue = WorkQueue {
            lanes: Arc::new(RwLock::new(Some(Lanes {
                high: high_tx,
                normal: normal_tx,
            }))),
        };
        (queue, WorkerPool { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. Close the queue first.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Renewal worker exited abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    receivers: Arc<Mutex<Receivers>>,
    orchestrator: RenewalOrchestrator,
) {
    tracing::debug!(worker = worker, "Renewal worker started");
    loop {
        let item = {
            let mut guard = receivers.lock().await;
            let rx = &mut *guard;
            tokio::select! {
                biased;
                Some(item) = rx.high.recv() => Some(item),
                Some(item) = rx.normal.recv() => Some(item),
                else => None,
            }
        };

        let Some(item) = item else {
            break;
        };
        orchestrator
            .process(item.subscription_id, &item.batch, item.mode)
            .await;
    }
    tracing::debug!(worker = worker, "Renewal worker stopped");
}
