//! Administrative surface
//!
//! Everything an operator (or the API layer in front of this crate) can ask
//! of the engine. Parameters are validated here; bad input is a
//! [`BillingError::Validation`] and changes nothing.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{AuditLog, PerformanceMetrics, RenewalStats};
use crate::batch::BatchHandle;
use crate::error::BillingResult;
use crate::models::{Alert, CronJobConfig, JobName, RenewalAttempt, Subscription};
use crate::orchestrator::{RenewalOrchestrator, RenewalOutcome};
use crate::scanner::ScanPage;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::store::{LogFilter, Page, PageRequest, ScanCursor};

#[derive(Clone)]
pub struct RenewalAdmin {
    scheduler: Arc<Scheduler>,
    orchestrator: RenewalOrchestrator,
    audit: Arc<AuditLog>,
}

impl RenewalAdmin {
    pub fn new(
        scheduler: Arc<Scheduler>,
        orchestrator: RenewalOrchestrator,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            scheduler,
            orchestrator,
            audit,
        }
    }

    // Manual triggers

    pub async fn run_renewal_now(&self) -> BillingResult<BatchHandle> {
        self.scheduler.run_now(JobName::AutoRenewalRun).await
    }

    pub async fn run_expiration_notifications_now(&self) -> BillingResult<BatchHandle> {
        self.scheduler.run_now(JobName::ExpirationNotifications).await
    }

    pub async fn run_retry_failed_payments_now(&self) -> BillingResult<BatchHandle> {
        self.scheduler.run_now(JobName::RetryFailedPayments).await
    }

    pub async fn simulate_renewal(&self, business_id: Uuid) -> BillingResult<RenewalOutcome> {
        self.scheduler.simulate(business_id).await
    }

    /// Lift a suspension: SUSPENDED -> ACTIVE with retry state cleared
    pub async fn reactivate(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.orchestrator.reactivate(subscription_id).await
    }

    // Reporting

    pub async fn stats(&self) -> BillingResult<RenewalStats> {
        self.audit.stats().await
    }

    pub async fn performance_metrics(&self) -> PerformanceMetrics {
        self.audit.performance().await
    }

    pub async fn expiring_subscriptions(
        &self,
        days: u32,
        cursor: Option<ScanCursor>,
    ) -> BillingResult<ScanPage> {
        self.scheduler.scanner().expiring_within(days, cursor).await
    }

    /// All renewal attempts, newest first
    pub async fn renewal_history(&self, page: u32, per_page: u32) -> BillingResult<Page<RenewalAttempt>> {
        self.audit
            .logs(&LogFilter::default(), PageRequest::new(page, per_page)?)
            .await
    }

    /// Renewal attempts matching `filter`, newest first
    pub async fn logs(
        &self,
        filter: &LogFilter,
        page: u32,
        per_page: u32,
    ) -> BillingResult<Page<RenewalAttempt>> {
        self.audit
            .logs(filter, PageRequest::new(page, per_page)?)
            .await
    }

    pub async fn alerts(&self, page: u32, per_page: u32) -> BillingResult<Page<Alert>> {
        self.audit.alerts(PageRequest::new(page, per_page)?).await
    }

    // Scheduler control

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state().await
    }

    pub async fn start_scheduler(&self) -> BillingResult<()> {
        self.scheduler.start().await
    }

    pub async fn stop_scheduler(&self) -> BillingResult<()> {
        self.scheduler.stop().await
    }

    pub async fn restart_scheduler(&self) -> BillingResult<()> {
        self.scheduler.restart().await
    }

    pub async fn cron_config(&self) -> BillingResult<Vec<CronJobConfig>> {
        self.scheduler.get_config().await
    }

    pub async fn set_cron_config(&self, config: CronJobConfig) -> BillingResult<CronJobConfig> {
        self.scheduler.set_config(config).await
    }
}
