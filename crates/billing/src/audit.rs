//! Audit trail and metrics
//!
//! Every renewal attempt goes through [`AuditLog::record`], which persists it
//! (with the subscription change and alert it caused) before anything else
//! happens. The log also keeps process-local latency counters and a bounded
//! history of recent batch summaries for the performance endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::batch::BatchSummary;
use crate::error::BillingResult;
use crate::models::{Alert, AttemptOutcome, RenewalAttempt, Subscription, SubscriptionStatus};
use crate::store::{LogFilter, Page, PageRequest, RenewalStore};

/// Number of batch summaries kept for the performance endpoint
const RECENT_BATCHES: usize = 20;

/// Aggregate renewal statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalStats {
    pub total_attempts: u64,
    pub attempts_by_outcome: HashMap<AttemptOutcome, u64>,
    /// APPROVED / total attempts, 0.0 when there are none
    pub success_rate: f64,
    pub subscriptions_by_status: HashMap<SubscriptionStatus, u64>,
    pub alerts: u64,
}

/// Process-local performance counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub attempts_recorded: u64,
    pub avg_attempt_ms: f64,
    pub max_attempt_ms: u64,
    pub batches_completed: u64,
    pub recent_batches: Vec<BatchSummary>,
    pub uptime_secs: i64,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
    batches: AtomicU64,
}

pub struct AuditLog {
    store: Arc<dyn RenewalStore>,
    counters: Counters,
    recent: Mutex<VecDeque<BatchSummary>>,
    started_at: OffsetDateTime,
}

impl AuditLog {
    pub fn new(store: Arc<dyn RenewalStore>) -> Self {
        Self {
            store,
            counters: Counters::default(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_BATCHES)),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// Persist an attempt with its resulting subscription state and alert
    pub async fn record(
        &self,
        attempt: &RenewalAttempt,
        subscription: Option<&Subscription>,
        alert: Option<&Alert>,
    ) -> BillingResult<()> {
        self.store
            .commit_attempt(attempt, subscription, alert)
            .await?;

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_ms
            .fetch_add(attempt.duration_ms, Ordering::Relaxed);
        self.counters
            .max_ms
            .fetch_max(attempt.duration_ms, Ordering::Relaxed);

        tracing::info!(
            subscription_id = %attempt.subscription_id,
            business_id = %attempt.business_id,
            attempt_number = attempt.attempt_number,
            outcome = attempt.outcome.as_str(),
            duration_ms = attempt.duration_ms,
            "Renewal attempt recorded"
        );
        if let Some(alert) = alert {
            log_alert(alert);
        }
        Ok(())
    }

    /// Persist a standalone alert (systemic failures, scheduler faults)
    pub async fn raise_alert(&self, alert: &Alert) -> BillingResult<()> {
        self.store.insert_alert(alert).await?;
        log_alert(alert);
        Ok(())
    }

    pub async fn record_batch(&self, summary: BatchSummary) {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            batch_id = %summary.batch_id,
            job = summary.job.as_str(),
            enqueued = summary.enqueued,
            renewed = summary.renewed,
            retry_scheduled = summary.retry_scheduled,
            suspended = summary.suspended,
            errored = summary.errored,
            skipped = summary.skipped,
            paused = summary.paused,
            "Batch finished"
        );

        let mut recent = self.recent.lock().await;
        if recent.len() >= RECENT_BATCHES {
            recent.pop_front();
        }
        recent.push_back(summary);
    }

    pub async fn stats(&self) -> BillingResult<RenewalStats> {
        let attempts_by_outcome = self
            .store
            .count_attempts_by_outcome(&LogFilter::default())
            .await?;
        let subscriptions_by_status = self.store.count_by_status().await?;
        let alerts = self.store.list_alerts(PageRequest::new(1, 1)?).await?.total;

        let total_attempts: u64 = attempts_by_outcome.values().sum();
        let approved = attempts_by_outcome
            .get(&AttemptOutcome::Approved)
            .copied()
            .unwrap_or(0);
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            approved as f64 / total_attempts as f64
        };

        Ok(RenewalStats {
            total_attempts,
            attempts_by_outcome,
            success_rate,
            subscriptions_by_status,
            alerts,
        })
    }

    pub async fn performance(&self) -> PerformanceMetrics {
        let attempts = self.counters.attempts.load(Ordering::Relaxed);
        let total_ms = self.counters.total_ms.load(Ordering::Relaxed);
        let avg_attempt_ms = if attempts == 0 {
            0.0
        } else {
            total_ms as f64 / attempts as f64
        };

        PerformanceMetrics {
            attempts_recorded: attempts,
            avg_attempt_ms,
            max_attempt_ms: self.counters.max_ms.load(Ordering::Relaxed),
            batches_completed: self.counters.batches.load(Ordering::Relaxed),
            recent_batches: self.recent.lock().await.iter().cloned().collect(),
            uptime_secs: (OffsetDateTime::now_utc() - self.started_at).whole_seconds(),
        }
    }

    /// Attempt history, newest first
    pub async fn logs(
        &self,
        filter: &LogFilter,
        page: PageRequest,
    ) -> BillingResult<Page<RenewalAttempt>> {
        filter.validate()?;
        self.store.list_attempts(filter, page).await
    }

    pub async fn alerts(&self, page: PageRequest) -> BillingResult<Page<Alert>> {
        self.store.list_alerts(page).await
    }
}

fn log_alert(alert: &Alert) {
    tracing::warn!(
        alert_id = %alert.id,
        alert_type = alert.alert_type.as_str(),
        severity = alert.severity.as_str(),
        subscription_id = ?alert.related_subscription_id,
        message = %alert.message,
        "Alert raised"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSeverity, AlertType, JobName};
    use crate::store::InMemoryStore;
    use uuid::Uuid;

    fn attempt(outcome: AttemptOutcome, duration_ms: u64) -> RenewalAttempt {
        let now = OffsetDateTime::now_utc();
        RenewalAttempt {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            attempt_number: 1,
            amount_cents: 1000,
            currency: "USD".into(),
            outcome,
            billing_period_end: now,
            gateway_reference: None,
            error_message: None,
            duration_ms,
            created_at: now,
        }
    }

    fn summary(job: JobName) -> BatchSummary {
        BatchSummary {
            batch_id: Uuid::new_v4(),
            job,
            enqueued: 0,
            renewed: 0,
            retry_scheduled: 0,
            suspended: 0,
            errored: 0,
            skipped: 0,
            gateway_errors: 0,
            charges: 0,
            notices_delivered: 0,
            paused: false,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_stats_success_rate() {
        let audit = AuditLog::new(Arc::new(InMemoryStore::new()));
        audit
            .record(&attempt(AttemptOutcome::Approved, 10), None, None)
            .await
            .unwrap();
        audit
            .record(&attempt(AttemptOutcome::Approved, 30), None, None)
            .await
            .unwrap();
        let alert = Alert::new(AlertType::TerminalDecline, AlertSeverity::High, "declined", None);
        audit
            .record(&attempt(AttemptOutcome::FailedTerminal, 20), None, Some(&alert))
            .await
            .unwrap();
        audit
            .record(&attempt(AttemptOutcome::Error, 5), None, None)
            .await
            .unwrap();

        let stats = audit.stats().await.unwrap();
        assert_eq!(stats.total_attempts, 4);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.attempts_by_outcome[&AttemptOutcome::Error], 1);
        assert_eq!(stats.alerts, 1);

        let perf = audit.performance().await;
        assert_eq!(perf.attempts_recorded, 4);
        assert_eq!(perf.max_attempt_ms, 30);
        assert!((perf.avg_attempt_ms - 16.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let audit = AuditLog::new(Arc::new(InMemoryStore::new()));
        let stats = audit.stats().await.unwrap();
        assert_eq!(stats.total_attempts, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_recent_batches_are_bounded() {
        let audit = AuditLog::new(Arc::new(InMemoryStore::new()));
        for _ in 0..(RECENT_BATCHES + 5) {
            audit.record_batch(summary(JobName::AutoRenewalRun)).await;
        }
        let perf = audit.performance().await;
        assert_eq!(perf.batches_completed, (RECENT_BATCHES + 5) as u64);
        assert_eq!(perf.recent_batches.len(), RECENT_BATCHES);
    }

    #[tokio::test]
    async fn test_logs_reject_inverted_range() {
        let audit = AuditLog::new(Arc::new(InMemoryStore::new()));
        let now = OffsetDateTime::now_utc();
        let filter = LogFilter {
            from: Some(now),
            to: Some(now - time::Duration::days(1)),
            ..Default::default()
        };
        assert!(audit.logs(&filter, PageRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_logs_filter_by_outcome() {
        let audit = AuditLog::new(Arc::new(InMemoryStore::new()));
        audit
            .record(&attempt(AttemptOutcome::Approved, 1), None, None)
            .await
            .unwrap();
        audit
            .record(&attempt(AttemptOutcome::FailedTransient, 1), None, None)
            .await
            .unwrap();

        let filter = LogFilter {
            outcome: Some(AttemptOutcome::FailedTransient),
            ..Default::default()
        };
        let page = audit.logs(&filter, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].outcome, AttemptOutcome::FailedTransient);
    }
}
