//! Renewal engine configuration
//!
//! Every setting has a default and can be overridden through a `RENEWAL_*`
//! environment variable. Call [`RenewalConfig::validate`] before handing the
//! config to the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::models::JobName;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Tunables for the renewal engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Failed charges allowed before a subscription is suspended
    pub max_retries: u32,
    /// First retry delay; doubled for every subsequent attempt
    pub base_delay: Duration,
    /// Upper bound on any retry delay
    pub max_delay: Duration,
    /// Renew subscriptions whose end date is at most this many days away
    pub renewal_window_days: u32,
    /// Send "expires in N days" notices this many days ahead
    pub notice_days: u32,
    pub worker_count: usize,
    /// Scanner page size
    pub page_size: usize,
    pub max_pages_per_tick: usize,
    /// Fraction of ERROR outcomes in one batch that pauses the batch
    pub systemic_failure_threshold: f64,
    /// Attempts a batch must have made before the failure rate is judged
    pub systemic_min_attempts: u32,
    pub lock_ttl: Duration,
    /// Deadline for a single gateway call
    pub charge_deadline: Duration,
    pub queue_capacity: usize,
    pub auto_renewal_schedule: String,
    pub expiration_notice_schedule: String,
    pub retry_failed_schedule: String,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(SECS_PER_DAY),
            max_delay: Duration::from_secs(7 * SECS_PER_DAY),
            renewal_window_days: 3,
            notice_days: 7,
            worker_count: 10,
            page_size: 200,
            max_pages_per_tick: 5,
            systemic_failure_threshold: 0.5,
            systemic_min_attempts: 5,
            lock_ttl: Duration::from_secs(60),
            charge_deadline: Duration::from_secs(30),
            queue_capacity: 1000,
            // Top of every hour
            auto_renewal_schedule: "0 0 * * * *".to_string(),
            // Daily at 09:00 UTC
            expiration_notice_schedule: "0 0 9 * * *".to_string(),
            // Every 4 hours at :30
            retry_failed_schedule: "0 30 */4 * * *".to_string(),
        }
    }
}

impl RenewalConfig {
    /// Load configuration from `RENEWAL_*` environment variables
    ///
    /// Unset variables keep their defaults; malformed values are a
    /// [`BillingError::Config`].
    pub fn from_env() -> BillingResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>("RENEWAL_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("RENEWAL_BASE_DELAY_SECS")? {
            config.base_delay = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("RENEWAL_MAX_DELAY_SECS")? {
            config.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("RENEWAL_WINDOW_DAYS")? {
            config.renewal_window_days = v;
        }
        if let Some(v) = env_parse::<u32>("RENEWAL_NOTICE_DAYS")? {
            config.notice_days = v;
        }
        if let Some(v) = env_parse::<usize>("RENEWAL_WORKER_COUNT")? {
            config.worker_count = v;
        }
        if let Some(v) = env_parse::<usize>("RENEWAL_PAGE_SIZE")? {
            config.page_size = v;
        }
        if let Some(v) = env_parse::<usize>("RENEWAL_MAX_PAGES_PER_TICK")? {
            config.max_pages_per_tick = v;
        }
        if let Some(v) = env_parse::<f64>("RENEWAL_SYSTEMIC_THRESHOLD")? {
            config.systemic_failure_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("RENEWAL_SYSTEMIC_MIN_ATTEMPTS")? {
            config.systemic_min_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("RENEWAL_LOCK_TTL_SECS")? {
            config.lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("RENEWAL_CHARGE_DEADLINE_SECS")? {
            config.charge_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("RENEWAL_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Ok(v) = std::env::var("RENEWAL_SCHEDULE_AUTO_RENEWAL") {
            config.auto_renewal_schedule = v;
        }
        if let Ok(v) = std::env::var("RENEWAL_SCHEDULE_EXPIRATION_NOTICES") {
            config.expiration_notice_schedule = v;
        }
        if let Ok(v) = std::env::var("RENEWAL_SCHEDULE_RETRY_FAILED") {
            config.retry_failed_schedule = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> BillingResult<()> {
        if self.worker_count == 0 {
            return Err(BillingError::Config("worker_count must be at least 1".into()));
        }
        if self.page_size == 0 || self.max_pages_per_tick == 0 {
            return Err(BillingError::Config(
                "page_size and max_pages_per_tick must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(BillingError::Config("queue_capacity must be at least 1".into()));
        }
        if !(self.systemic_failure_threshold > 0.0 && self.systemic_failure_threshold <= 1.0) {
            return Err(BillingError::Config(format!(
                "systemic_failure_threshold must be in (0, 1], got {}",
                self.systemic_failure_threshold
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(BillingError::Config(
                "base_delay must not exceed max_delay".into(),
            ));
        }
        // The heartbeat fires at ttl/2, so the deadline must leave room for it
        if self.charge_deadline >= self.lock_ttl {
            return Err(BillingError::Config(
                "charge_deadline must be shorter than lock_ttl".into(),
            ));
        }
        Ok(())
    }

    /// Default cron expression for a job
    pub fn schedule_for(&self, job: JobName) -> &str {
        match job {
            JobName::AutoRenewalRun => &self.auto_renewal_schedule,
            JobName::ExpirationNotifications => &self.expiration_notice_schedule,
            JobName::RetryFailedPayments => &self.retry_failed_schedule,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> BillingResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("Invalid value for {}: {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}
