//! Job cadence and manual triggers
//!
//! [`Scheduler`] is an explicit state machine (`Stopped` / `Running`). Starting
//! it spins up the worker pool and registers one cron job per [`JobName`];
//! stopping it stops the cron ticks, closes the queue and waits for queued and
//! in-flight renewals to finish. All domain work is delegated to the scanner
//! and orchestrator.
//!
//! A tick that cannot read its candidate set aborts, raises a systemic alert
//! and leaves the next tick to try again. It never takes the process down.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::batch::{Batch, BatchHandle};
use crate::config::RenewalConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{Alert, AlertSeverity, AlertType, CronJobConfig, JobName};
use crate::orchestrator::{RenewalOrchestrator, RenewalOutcome, RunMode, SkipReason};
use crate::queue::{Priority, WorkItem, WorkQueue, WorkerPool};
use crate::scanner::ExpirationScanner;
use crate::store::RenewalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Reject schedules the cron engine cannot parse
pub fn validate_schedule(schedule: &str) -> BillingResult<()> {
    if schedule.trim().is_empty() {
        return Err(BillingError::Validation("cron schedule is empty".into()));
    }
    Job::new_async(schedule, |_uuid, _l| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| {
            BillingError::Validation(format!("invalid cron schedule '{}': {}", schedule, e))
        })
}

fn to_offset(tick: chrono::DateTime<chrono::Utc>) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(tick.timestamp()).ok()
}

/// Domain side of a job run: scan, enqueue, wait, record
struct JobRunner {
    store: Arc<dyn RenewalStore>,
    scanner: ExpirationScanner,
    orchestrator: RenewalOrchestrator,
    audit: Arc<AuditLog>,
    config: RenewalConfig,
}

impl JobRunner {
    fn new_batch(&self, job: JobName) -> Arc<Batch> {
        Batch::new(
            job,
            self.config.systemic_failure_threshold,
            self.config.systemic_min_attempts,
        )
    }

    async fn job_config(&self, job: JobName) -> BillingResult<CronJobConfig> {
        Ok(self
            .store
            .get_cron_config(job)
            .await?
            .unwrap_or_else(|| CronJobConfig::new(job, self.config.schedule_for(job))))
    }

    /// Cron entry point
    async fn tick(&self, job: JobName, queue: &WorkQueue, next_run_at: Option<OffsetDateTime>) {
        let mut config = match self.job_config(job).await {
            Ok(config) => config,
            Err(e) => {
                self.fail(job, &e).await;
                return;
            }
        };
        config.next_run_at = next_run_at;

        if !config.enabled {
            tracing::debug!(job = job.as_str(), "Job disabled, skipping tick");
            self.save_config(&config).await;
            return;
        }

        config.last_run_at = Some(OffsetDateTime::now_utc());
        self.save_config(&config).await;

        tracing::info!(job = job.as_str(), "Running scheduled job");
        self.execute(self.new_batch(job), queue, Priority::Normal)
            .await;
    }

    async fn save_config(&self, config: &CronJobConfig) {
        if let Err(e) = self.store.save_cron_config(config).await {
            tracing::warn!(job = config.job_name.as_str(), error = %e, "Failed to update job bookkeeping");
        }
    }

    /// Run a batch to completion and record its summary
    async fn execute(&self, batch: Arc<Batch>, queue: &WorkQueue, priority: Priority) {
        if let Err(e) = self.feed(&batch, queue, priority).await {
            self.fail(batch.job(), &e).await;
        }
        batch.seal();
        let summary = batch.wait().await;
        self.audit.record_batch(summary).await;
    }

    async fn feed(
        &self,
        batch: &Arc<Batch>,
        queue: &WorkQueue,
        priority: Priority,
    ) -> BillingResult<()> {
        if batch.job() == JobName::ExpirationNotifications {
            let report = self
                .scanner
                .scan_for_notification_only(self.config.notice_days)
                .await
                .map_err(|e| BillingError::SchedulerFatal(e.to_string()))?;
            batch.note_notices(report.delivered);
            tracing::info!(
                batch_id = %batch.id(),
                scanned = report.scanned,
                delivered = report.delivered,
                "Expiration notices sent"
            );
            return Ok(());
        }

        let mut cursor = None;
        for _ in 0..self.scanner.max_pages() {
            let page = match batch.job() {
                JobName::RetryFailedPayments => self.scanner.scan_retry_due(cursor).await,
                _ => {
                    self.scanner
                        .scan_for_renewal(self.config.renewal_window_days, cursor)
                        .await
                }
            }
            .map_err(|e| BillingError::SchedulerFatal(e.to_string()))?;

            for subscription in &page.items {
                if batch.is_paused() {
                    tracing::warn!(batch_id = %batch.id(), "Batch paused, no further work enqueued");
                    return Ok(());
                }
                let item = WorkItem {
                    subscription_id: subscription.id,
                    batch: Arc::clone(batch),
                    mode: RunMode::Scheduled,
                };
                match queue.enqueue(item, priority).await {
                    Ok(()) => {}
                    Err(BillingError::QueueClosed) => {
                        tracing::info!(batch_id = %batch.id(), "Queue closed, stopping batch feed");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }

        tracing::info!(
            batch_id = %batch.id(),
            job = batch.job().as_str(),
            max_pages = self.scanner.max_pages(),
            "Page limit reached, remaining candidates left for the next tick"
        );
        Ok(())
    }

    async fn fail(&self, job: JobName, error: &BillingError) {
        tracing::error!(job = job.as_str(), error = %error, "Scheduled run aborted");
        let alert = Alert::new(
            AlertType::SchedulerFailure,
            AlertSeverity::Systemic,
            format!("{} run aborted: {}", job, error),
            None,
        );
        if let Err(e) = self.audit.raise_alert(&alert).await {
            tracing::error!(job = job.as_str(), error = %e, "Failed to store scheduler alert");
        }
    }
}

struct Runtime {
    cron: JobScheduler,
    queue: WorkQueue,
    pool: WorkerPool,
    jobs: HashMap<JobName, Uuid>,
}

pub struct Scheduler {
    runner: Arc<JobRunner>,
    runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RenewalStore>,
        scanner: ExpirationScanner,
        orchestrator: RenewalOrchestrator,
        audit: Arc<AuditLog>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            runner: Arc::new(JobRunner {
                store,
                scanner,
                orchestrator,
                audit,
                config,
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn scanner(&self) -> &ExpirationScanner {
        &self.runner.scanner
    }

    pub async fn state(&self) -> SchedulerState {
        if self.runtime.lock().await.is_some() {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    fn cron_job(&self, job: JobName, schedule: &str, queue: WorkQueue) -> BillingResult<Job> {
        let runner = Arc::clone(&self.runner);
        let cron_job = Job::new_async(schedule, move |uuid, mut scheduler| {
            let runner = Arc::clone(&runner);
            let queue = queue.clone();
            Box::pin(async move {
                let next_run_at = scheduler
                    .next_tick_for_job(uuid)
                    .await
                    .ok()
                    .flatten()
                    .and_then(to_offset);
                runner.tick(job, &queue, next_run_at).await;
            })
        })?;
        Ok(cron_job)
    }

    /// Start ticking. Does nothing if already running.
    pub async fn start(&self) -> BillingResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            tracing::debug!("Scheduler already running");
            return Ok(());
        }

        let configs = self.get_config().await?;
        let config = &self.runner.config;
        let (queue, pool) = WorkerPool::spawn(
            self.runner.orchestrator.clone(),
            config.worker_count,
            config.queue_capacity,
        );

        match self.start_cron(&configs, &queue).await {
            Ok((cron, jobs)) => {
                tracing::info!(
                    workers = pool.size(),
                    jobs = jobs.len(),
                    "Renewal scheduler started"
                );
                *runtime = Some(Runtime {
                    cron,
                    queue,
                    pool,
                    jobs,
                });
                Ok(())
            }
            Err(e) => {
                queue.close().await;
                pool.join().await;
                Err(e)
            }
        }
    }

    async fn start_cron(
        &self,
        configs: &[CronJobConfig],
        queue: &WorkQueue,
    ) -> BillingResult<(JobScheduler, HashMap<JobName, Uuid>)> {
        let mut cron = JobScheduler::new().await?;
        let mut jobs = HashMap::new();
        for config in configs {
            let id = cron
                .add(self.cron_job(config.job_name, &config.schedule, queue.clone())?)
                .await?;
            jobs.insert(config.job_name, id);
            tracing::info!(
                job = config.job_name.as_str(),
                schedule = %config.schedule,
                enabled = config.enabled,
                "Scheduled renewal job"
            );
        }
        cron.start().await?;

        for config in configs {
            if let Some(id) = jobs.get(&config.job_name) {
                let mut config = config.clone();
                config.next_run_at = cron
                    .next_tick_for_job(*id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(to_offset);
                self.runner.save_config(&config).await;
            }
        }
        Ok((cron, jobs))
    }

    /// Stop ticking and drain queued and in-flight work. Does nothing if
    /// already stopped.
    pub async fn stop(&self) -> BillingResult<()> {
        // Release the guard before draining so state queries stay responsive
        let Some(mut rt) = self.runtime.lock().await.take() else {
            tracing::debug!("Scheduler already stopped");
            return Ok(());
        };

        tracing::info!("Stopping renewal scheduler, draining work queue");
        if let Err(e) = rt.cron.shutdown().await {
            tracing::warn!(error = %e, "Cron scheduler shutdown reported an error");
        }
        rt.queue.close().await;
        rt.pool.join().await;
        tracing::info!("Renewal scheduler stopped");
        Ok(())
    }

    pub async fn restart(&self) -> BillingResult<()> {
        self.stop().await?;
        self.start().await
    }

    /// Trigger a job immediately, ahead of periodic work
    pub async fn run_now(&self, job: JobName) -> BillingResult<BatchHandle> {
        let queue = match self.runtime.lock().await.as_ref() {
            Some(rt) => rt.queue.clone(),
            None => return Err(BillingError::SchedulerNotRunning),
        };

        let batch = self.runner.new_batch(job);
        let handle = BatchHandle::new(Arc::clone(&batch));
        tracing::info!(job = job.as_str(), batch_id = %batch.id(), "Manual run requested");

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            match runner.job_config(job).await {
                Ok(mut config) => {
                    config.last_run_at = Some(OffsetDateTime::now_utc());
                    runner.save_config(&config).await;
                }
                Err(e) => {
                    tracing::warn!(job = job.as_str(), error = %e, "Failed to read job config");
                }
            }
            runner.execute(batch, &queue, Priority::High).await;
        });
        Ok(handle)
    }

    /// Run the renewal workflow for one business right away, bypassing the
    /// renewal window and retry timing. Still lock-gated and audited.
    pub async fn simulate(&self, business_id: Uuid) -> BillingResult<RenewalOutcome> {
        let subscription = self
            .runner
            .store
            .find_subscription_for_business(business_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription for business {}", business_id))
            })?;

        let batch = self.runner.new_batch(JobName::AutoRenewalRun);
        batch.note_enqueued();
        batch.seal();
        let outcome = self
            .runner
            .orchestrator
            .process(subscription.id, &batch, RunMode::Simulation)
            .await;
        self.runner.audit.record_batch(batch.summary().await).await;

        if outcome == RenewalOutcome::Skipped(SkipReason::LockBusy) {
            return Err(BillingError::LockBusy(subscription.id));
        }
        Ok(outcome)
    }

    /// Every job's configuration, defaults filled in for unsaved jobs
    pub async fn get_config(&self) -> BillingResult<Vec<CronJobConfig>> {
        let mut configs = Vec::with_capacity(JobName::ALL.len());
        for job in JobName::ALL {
            configs.push(self.runner.job_config(job).await?);
        }
        Ok(configs)
    }

    /// Replace a job's schedule or enabled flag. A running scheduler picks up
    /// the new schedule immediately.
    pub async fn set_config(&self, config: CronJobConfig) -> BillingResult<CronJobConfig> {
        validate_schedule(&config.schedule)?;

        let existing = self.runner.job_config(config.job_name).await?;
        let mut updated = CronJobConfig {
            last_run_at: existing.last_run_at,
            next_run_at: None,
            ..config
        };

        let mut runtime = self.runtime.lock().await;
        if let Some(rt) = runtime.as_mut() {
            if let Some(old) = rt.jobs.remove(&updated.job_name) {
                rt.cron.remove(&old).await?;
            }
            let id = rt
                .cron
                .add(self.cron_job(updated.job_name, &updated.schedule, rt.queue.clone())?)
                .await?;
            rt.jobs.insert(updated.job_name, id);
            updated.next_run_at = rt
                .cron
                .next_tick_for_job(id)
                .await
                .ok()
                .flatten()
                .and_then(to_offset);
        }

        self.runner.store.save_cron_config(&updated).await?;
        tracing::info!(
            job = updated.job_name.as_str(),
            schedule = %updated.schedule,
            enabled = updated.enabled,
            "Job configuration updated"
        );
        Ok(updated)
    }
}
