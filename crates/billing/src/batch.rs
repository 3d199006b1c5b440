//! Per-run batch tracking
//!
//! Every scheduled tick or manual run becomes one [`Batch`]. Workers report
//! outcomes into it; the batch watches the gateway error rate and pauses
//! itself when it looks like the provider is down, so the rest of the batch
//! does not hammer a dead gateway.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::models::JobName;
use crate::orchestrator::RenewalOutcome;

/// Final tally of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub job: JobName,
    pub enqueued: usize,
    pub renewed: u32,
    pub retry_scheduled: u32,
    pub suspended: u32,
    pub errored: u32,
    pub skipped: u32,
    /// Gateway calls that ended in ERROR
    pub gateway_errors: u32,
    /// Charge attempts made against the gateway
    pub charges: u32,
    /// Expiration notices delivered (notification runs only)
    pub notices_delivered: usize,
    pub paused: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct Tally {
    renewed: AtomicU32,
    retry_scheduled: AtomicU32,
    suspended: AtomicU32,
    errored: AtomicU32,
    skipped: AtomicU32,
}

#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    job: JobName,
    threshold: f64,
    min_attempts: u32,
    charges: AtomicU32,
    gateway_errors: AtomicU32,
    paused: AtomicBool,
    tally: Tally,
    enqueued: AtomicUsize,
    finished: AtomicUsize,
    sealed: AtomicBool,
    notices: AtomicUsize,
    started_at: OffsetDateTime,
    finished_at: Mutex<Option<OffsetDateTime>>,
    done: Notify,
}

impl Batch {
    pub fn new(job: JobName, threshold: f64, min_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            job,
            threshold,
            min_attempts,
            charges: AtomicU32::new(0),
            gateway_errors: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            tally: Tally::default(),
            enqueued: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            notices: AtomicUsize::new(0),
            started_at: OffsetDateTime::now_utc(),
            finished_at: Mutex::new(None),
            done: Notify::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job(&self) -> JobName {
        self.job
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Record one gateway call. Returns the error rate if this call is the
    /// one that tripped the pause, so the caller raises exactly one alert.
    pub fn record_charge(&self, gateway_error: bool) -> Option<f64> {
        let charges = self.charges.fetch_add(1, Ordering::AcqRel) + 1;
        let errors = if gateway_error {
            self.gateway_errors.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.gateway_errors.load(Ordering::Acquire)
        };

        if charges < self.min_attempts {
            return None;
        }
        let rate = f64::from(errors) / f64::from(charges);
        if rate > self.threshold
            && self
                .paused
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(rate);
        }
        None
    }

    pub fn note_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_notices(&self, delivered: usize) {
        self.notices.fetch_add(delivered, Ordering::AcqRel);
    }

    /// No more items will be added
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        self.notify_if_done();
    }

    pub fn note_finished(&self, outcome: &RenewalOutcome) {
        let counter = match outcome {
            RenewalOutcome::Renewed { .. } => &self.tally.renewed,
            RenewalOutcome::RetryScheduled { .. } => &self.tally.retry_scheduled,
            RenewalOutcome::Suspended { .. } => &self.tally.suspended,
            RenewalOutcome::Errored { .. } => &self.tally.errored,
            RenewalOutcome::Skipped(_) => &self.tally.skipped,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.finished.fetch_add(1, Ordering::AcqRel);
        self.notify_if_done();
    }

    pub fn is_complete(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
            && self.finished.load(Ordering::Acquire) >= self.enqueued.load(Ordering::Acquire)
    }

    fn notify_if_done(&self) {
        if self.is_complete() {
            self.done.notify_waiters();
        }
    }

    pub async fn summary(&self) -> BatchSummary {
        let mut finished_at = self.finished_at.lock().await;
        if finished_at.is_none() && self.is_complete() {
            *finished_at = Some(OffsetDateTime::now_utc());
        }

        BatchSummary {
            batch_id: self.id,
            job: self.job,
            enqueued: self.enqueued.load(Ordering::Acquire),
            renewed: self.tally.renewed.load(Ordering::Acquire),
            retry_scheduled: self.tally.retry_scheduled.load(Ordering::Acquire),
            suspended: self.tally.suspended.load(Ordering::Acquire),
            errored: self.tally.errored.load(Ordering::Acquire),
            skipped: self.tally.skipped.load(Ordering::Acquire),
            gateway_errors: self.gateway_errors.load(Ordering::Acquire),
            charges: self.charges.load(Ordering::Acquire),
            notices_delivered: self.notices.load(Ordering::Acquire),
            paused: self.is_paused(),
            started_at: self.started_at,
            finished_at: *finished_at,
        }
    }

    /// Wait until the batch is sealed and every item has finished
    pub async fn wait(&self) -> BatchSummary {
        loop {
            let notified = self.done.notified();
            if self.is_complete() {
                break;
            }
            notified.await;
        }
        self.summary().await
    }
}

/// Caller-facing handle to a running batch
#[derive(Debug, Clone)]
pub struct BatchHandle {
    batch: Arc<Batch>,
}

impl BatchHandle {
    pub(crate) fn new(batch: Arc<Batch>) -> Self {
        Self { batch }
    }

    pub fn id(&self) -> Uuid {
        self.batch.id()
    }

    pub fn job(&self) -> JobName {
        self.batch.job()
    }

    pub async fn wait(&self) -> BatchSummary {
        self.batch.wait().await
    }

    pub async fn summary(&self) -> BatchSummary {
        self.batch.summary().await
    }
}
