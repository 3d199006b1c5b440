// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription auto-renewal engine
//!
//! Finds subscriptions approaching their end date, charges them through a
//! payment gateway, schedules retries with exponential backoff, suspends
//! after terminal declines or exhausted retries, and keeps an append-only
//! audit of every attempt.
//!
//! ## Features
//!
//! - **Scheduler**: Cron-driven renewal, expiration-notice and retry jobs, plus manual triggers
//! - **Expiration Scanner**: Keyset-paginated candidate selection
//! - **Renewal Orchestrator**: Lock-gated charge workflow with state transitions
//! - **Retry Policy**: Transient/terminal classification and capped backoff
//! - **Lock Manager**: Per-subscription leases (in-memory or Redis)
//! - **Audit & Metrics**: Attempt log, alerts, stats and latency counters
//! - **Admin**: Operator surface for the API layer

pub mod admin;
pub mod audit;
pub mod batch;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_support;

// Admin
pub use admin::RenewalAdmin;

// Audit
pub use audit::{AuditLog, PerformanceMetrics, RenewalStats};

// Batches
pub use batch::{BatchHandle, BatchSummary};

// Config
pub use config::RenewalConfig;

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    cancellation, CancelHandle, CancelSignal, ChargeOutcome, ChargeRequest, GatewayError,
    HttpGateway, PaymentGateway,
};

// Locks
pub use lock::{Acquire, InMemoryLockManager, LeaseRenewal, LockManager, LockToken, RedisLockManager};

// Models
pub use models::{
    Alert, AlertSeverity, AlertType, AttemptOutcome, CronJobConfig, JobName, Plan,
    RenewalAttempt, Subscription, SubscriptionStatus,
};

// Notifications
pub use notify::{
    NotificationDispatcher, NotificationKind, Notifier, NotifyError, TracingNotifier,
    WebhookNotifier,
};

// Orchestrator
pub use orchestrator::{idempotency_key, RenewalOrchestrator, RenewalOutcome, RunMode, SkipReason};

// Retry
pub use retry::{ErrorClass, RetryPolicy};

// Scanner
pub use scanner::{ExpirationScanner, NoticeReport, ScanPage};

// Scheduler
pub use scheduler::{validate_schedule, Scheduler, SchedulerState};

// Storage
pub use postgres::PgStore;
pub use store::{InMemoryStore, LogFilter, Page, PageRequest, RenewalStore, ScanCursor};

use std::sync::Arc;

/// Fully wired renewal engine
pub struct RenewalEngine {
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: RenewalOrchestrator,
    pub audit: Arc<AuditLog>,
    pub admin: RenewalAdmin,
}

impl RenewalEngine {
    /// Wire every component around the given collaborators. The scheduler
    /// starts out stopped.
    pub fn new(
        store: Arc<dyn RenewalStore>,
        locks: Arc<dyn LockManager>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: RenewalConfig,
    ) -> BillingResult<Self> {
        config.validate()?;

        let dispatcher = NotificationDispatcher::new(notifier);
        let audit = Arc::new(AuditLog::new(store.clone()));
        let orchestrator = RenewalOrchestrator::new(
            store.clone(),
            locks,
            gateway,
            dispatcher.clone(),
            audit.clone(),
            &config,
        );
        let scanner = ExpirationScanner::new(store.clone(), dispatcher, &config);
        let scheduler = Arc::new(Scheduler::new(
            store,
            scanner,
            orchestrator.clone(),
            audit.clone(),
            config,
        ));
        let admin = RenewalAdmin::new(scheduler.clone(), orchestrator.clone(), audit.clone());

        Ok(Self {
            scheduler,
            orchestrator,
            audit,
            admin,
        })
    }

    /// Wire an engine against in-memory storage and locks
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: RenewalConfig,
    ) -> BillingResult<Self> {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryLockManager::new()),
            gateway,
            notifier,
            config,
        )
    }
}
