//! Persistence contract for the renewal engine
//!
//! [`RenewalStore`] is the narrow CRUD surface the engine needs. Schema and
//! migrations live outside this crate. [`InMemoryStore`] backs tests and
//! single-process setups; `PgStore` (see [`crate::postgres`]) backs production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Alert, AttemptOutcome, CronJobConfig, JobName, Plan, RenewalAttempt, Subscription,
    SubscriptionStatus,
};

pub const MAX_PER_PAGE: u32 = 100;

/// Keyset position for `(end_date, id)` ordered scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub id: Uuid,
}

impl ScanCursor {
    pub fn after(subscription: &Subscription) -> Self {
        Self {
            end_date: subscription.end_date,
            id: subscription.id,
        }
    }

    fn precedes(&self, subscription: &Subscription) -> bool {
        (self.end_date, self.id) < (subscription.end_date, subscription.id)
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> BillingResult<Self> {
        if page == 0 {
            return Err(BillingError::Validation("page starts at 1".into()));
        }
        if per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(BillingError::Validation(format!(
                "per_page must be between 1 and {}",
                MAX_PER_PAGE
            )));
        }
        Ok(Self { page, per_page })
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.per_page as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    fn slice(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.per_page as usize)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            per_page: request.per_page,
        }
    }
}

/// Filters for renewal history and logs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub outcome: Option<AttemptOutcome>,
    pub business_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
}

impl LogFilter {
    pub fn validate(&self) -> BillingResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(BillingError::Validation(
                    "date range start is after its end".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, attempt: &RenewalAttempt) -> bool {
        self.from.is_none_or(|from| attempt.created_at >= from)
            && self.to.is_none_or(|to| attempt.created_at <= to)
            && self.outcome.is_none_or(|o| attempt.outcome == o)
            && self.business_id.is_none_or(|b| attempt.business_id == b)
            && self
                .subscription_id
                .is_none_or(|s| attempt.subscription_id == s)
    }
}

/// Storage collaborator used by the engine
#[async_trait]
pub trait RenewalStore: Send + Sync {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The business's current subscription: the latest-ending one that is
    /// neither expired nor cancelled
    async fn find_subscription_for_business(
        &self,
        business_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;

    /// Auto-renewing ACTIVE/GRACE subscriptions with `end_date <= cutoff`
    /// and no retry pending after `now`, ascending by `(end_date, id)`
    async fn renewal_candidates(
        &self,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>>;

    /// TRIAL/ACTIVE/GRACE subscriptions ending in `[from, cutoff]`,
    /// regardless of auto-renew
    async fn expiring_subscriptions(
        &self,
        from: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>>;

    /// Auto-renewing ACTIVE/GRACE subscriptions with a failed attempt whose
    /// `next_retry_at <= now`
    async fn retry_due(
        &self,
        now: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>>;

    async fn count_by_status(&self) -> BillingResult<HashMap<SubscriptionStatus, u64>>;

    /// Persist an attempt together with the resulting subscription row and
    /// alert, atomically
    async fn commit_attempt(
        &self,
        attempt: &RenewalAttempt,
        subscription: Option<&Subscription>,
        alert: Option<&Alert>,
    ) -> BillingResult<()>;

    async fn has_approved_attempt(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn count_attempts_for_period(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<u32>;

    /// Newest first
    async fn list_attempts(
        &self,
        filter: &LogFilter,
        page: PageRequest,
    ) -> BillingResult<Page<RenewalAttempt>>;

    async fn count_attempts_by_outcome(
        &self,
        filter: &LogFilter,
    ) -> BillingResult<HashMap<AttemptOutcome, u64>>;

    async fn insert_alert(&self, alert: &Alert) -> BillingResult<()>;

    /// Newest first
    async fn list_alerts(&self, page: PageRequest) -> BillingResult<Page<Alert>>;

    async fn get_cron_config(&self, job: JobName) -> BillingResult<Option<CronJobConfig>>;

    async fn list_cron_configs(&self) -> BillingResult<Vec<CronJobConfig>>;

    async fn save_cron_config(&self, config: &CronJobConfig) -> BillingResult<()>;
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, Subscription>,
    plans: HashMap<Uuid, Plan>,
    attempts: Vec<RenewalAttempt>,
    alerts: Vec<Alert>,
    cron: HashMap<JobName, CronJobConfig>,
}

/// In-memory [`RenewalStore`]
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    scans_unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.inner.write().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Simulate a storage outage: scans and reads fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Fail only the candidate scans, leaving point reads and writes working
    pub fn set_scans_unavailable(&self, unavailable: bool) {
        self.scans_unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(BillingError::Database("store unavailable".into()));
        }
        Ok(())
    }

    async fn scan<F>(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
        predicate: F,
    ) -> BillingResult<Vec<Subscription>>
    where
        F: Fn(&Subscription) -> bool,
    {
        self.check_available()?;
        if self.scans_unavailable.load(Ordering::Acquire) {
            return Err(BillingError::Database("candidate query failed".into()));
        }
        let inner = self.inner.read().await;
        let mut rows: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| after.is_none_or(|c| c.precedes(s)))
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.end_date, s.id));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl RenewalStore for InMemoryStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        Ok(self.inner.read().await.subscriptions.get(&id).cloned())
    }

    async fn find_subscription_for_business(
        &self,
        business_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.business_id == business_id && !s.status.is_terminal())
            .max_by_key(|s| s.end_date)
            .cloned())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        self.check_available()?;
        self.inner
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        self.check_available()?;
        Ok(self.inner.read().await.plans.get(&id).cloned())
    }

    async fn renewal_candidates(
        &self,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        self.scan(after, limit, |s| {
            s.auto_renew
                && s.status.is_renewable()
                && s.end_date <= cutoff
                && s.next_retry_at.is_none_or(|at| at <= now)
        })
        .await
    }

    async fn expiring_subscriptions(
        &self,
        from: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        self.scan(after, limit, |s| {
            matches!(
                s.status,
                SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::Grace
            ) && s.end_date >= from
                && s.end_date <= cutoff
        })
        .await
    }

    async fn retry_due(
        &self,
        now: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        self.scan(after, limit, |s| {
            s.auto_renew
                && s.status.is_renewable()
                && s.retry_count > 0
                && s.next_retry_at.is_some_and(|at| at <= now)
        })
        .await
    }

    async fn count_by_status(&self) -> BillingResult<HashMap<SubscriptionStatus, u64>> {
        self.check_available()?;
        let mut counts = HashMap::new();
        for sub in self.inner.read().await.subscriptions.values() {
            *counts.entry(sub.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn commit_attempt(
        &self,
        attempt: &RenewalAttempt,
        subscription: Option<&Subscription>,
        alert: Option<&Alert>,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.attempts.push(attempt.clone());
        if let Some(sub) = subscription {
            inner.subscriptions.insert(sub.id, sub.clone());
        }
        if let Some(alert) = alert {
            inner.alerts.push(alert.clone());
        }
        Ok(())
    }

    async fn has_approved_attempt(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        self.check_available()?;
        Ok(self.inner.read().await.attempts.iter().any(|a| {
            a.subscription_id == subscription_id
                && a.billing_period_end == billing_period_end
                && a.outcome == AttemptOutcome::Approved
        }))
    }

    async fn count_attempts_for_period(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<u32> {
        self.check_available()?;
        let count = self
            .inner
            .read()
            .await
            .attempts
            .iter()
            .filter(|a| {
                a.subscription_id == subscription_id && a.billing_period_end == billing_period_end
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_attempts(
        &self,
        filter: &LogFilter,
        page: PageRequest,
    ) -> BillingResult<Page<RenewalAttempt>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        // Attempts are appended in creation order
        let matching: Vec<RenewalAttempt> = inner
            .attempts
            .iter()
            .rev()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        Ok(Page::slice(matching, page))
    }

    async fn count_attempts_by_outcome(
        &self,
        filter: &LogFilter,
    ) -> BillingResult<HashMap<AttemptOutcome, u64>> {
        self.check_available()?;
        let mut counts = HashMap::new();
        for attempt in self
            .inner
            .read()
            .await
            .attempts
            .iter()
            .filter(|a| filter.matches(a))
        {
            *counts.entry(attempt.outcome).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn insert_alert(&self, alert: &Alert) -> BillingResult<()> {
        self.check_available()?;
        self.inner.write().await.alerts.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(&self, page: PageRequest) -> BillingResult<Page<Alert>> {
        self.check_available()?;
        let alerts: Vec<Alert> = self.inner.read().await.alerts.iter().rev().cloned().collect();
        Ok(Page::slice(alerts, page))
    }

    async fn get_cron_config(&self, job: JobName) -> BillingResult<Option<CronJobConfig>> {
        self.check_available()?;
        Ok(self.inner.read().await.cron.get(&job).cloned())
    }

    async fn list_cron_configs(&self) -> BillingResult<Vec<CronJobConfig>> {
        self.check_available()?;
        let mut configs: Vec<CronJobConfig> =
            self.inner.read().await.cron.values().cloned().collect();
        configs.sort_by_key(|c| c.job_name.as_str());
        Ok(configs)
    }

    async fn save_cron_config(&self, config: &CronJobConfig) -> BillingResult<()> {
        self.check_available()?;
        self.inner
            .write()
            .await
            .cron
            .insert(config.job_name, config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn sub_ending(now: OffsetDateTime, days: i64) -> Subscription {
        Subscription::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            now - Duration::days(30),
            now + Duration::days(days),
        )
    }

    #[tokio::test]
    async fn test_renewal_candidates_keyset_pagination() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        for days in [5, 1, 3, 2, 4] {
            store.insert_subscription(sub_ending(now, days)).await;
        }

        let cutoff = now + Duration::days(10);
        let first = store.renewal_candidates(now, cutoff, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = ScanCursor::after(first.last().unwrap());
        let second = store.renewal_candidates(now, cutoff, Some(cursor), 2).await.unwrap();
        let third = store
            .renewal_candidates(now, cutoff, Some(ScanCursor::after(second.last().unwrap())), 2)
            .await
            .unwrap();

        let all: Vec<_> = first.iter().chain(&second).chain(&third).collect();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].end_date <= w[1].end_date));
    }

    #[tokio::test]
    async fn test_renewal_candidates_exclude_pending_retries() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();

        let mut waiting = sub_ending(now, -2);
        waiting.status = SubscriptionStatus::Grace;
        waiting.retry_count = 1;
        waiting.next_retry_at = Some(now + Duration::days(1));
        let mut elapsed = sub_ending(now, -1);
        elapsed.status = SubscriptionStatus::Grace;
        elapsed.retry_count = 2;
        elapsed.next_retry_at = Some(now - Duration::minutes(5));
        let fresh = sub_ending(now, 1);

        store.insert_subscription(waiting).await;
        store.insert_subscription(elapsed.clone()).await;
        store.insert_subscription(fresh.clone()).await;

        let rows = store
            .renewal_candidates(now, now + Duration::days(3), None, 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = rows.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![elapsed.id, fresh.id]);
    }

    #[tokio::test]
    async fn test_retry_due_requires_elapsed_retry() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();

        let mut due = sub_ending(now, -1);
        due.retry_count = 1;
        due.next_retry_at = Some(now - Duration::hours(1));
        let mut later = sub_ending(now, -1);
        later.retry_count = 1;
        later.next_retry_at = Some(now + Duration::hours(1));
        let fresh = sub_ending(now, -1);

        store.insert_subscription(due.clone()).await;
        store.insert_subscription(later).await;
        store.insert_subscription(fresh).await;

        let rows = store.retry_due(now, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, due.id);
    }

    #[tokio::test]
    async fn test_find_subscription_for_business_skips_terminal() {
        let store = InMemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let business = Uuid::new_v4();

        let mut cancelled = sub_ending(now, 40);
        cancelled.business_id = business;
        cancelled.status = SubscriptionStatus::Cancelled;
        let mut current = sub_ending(now, 10);
        current.business_id = business;

        store.insert_subscription(cancelled).await;
        store.insert_subscription(current.clone()).await;

        let found = store.find_subscription_for_business(business).await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(current.id));
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let result = store
            .renewal_candidates(OffsetDateTime::now_utc(), OffsetDateTime::now_utc(), None, 10)
            .await;
        assert!(matches!(result, Err(BillingError::Database(_))));
    }

    #[test]
    fn test_page_request_bounds() {
        assert!(PageRequest::new(0, 10).is_err());
        assert!(PageRequest::new(1, 0).is_err());
        assert!(PageRequest::new(1, MAX_PER_PAGE + 1).is_err());
        assert_eq!(PageRequest::new(3, 10).unwrap().offset(), 20);
    }

    #[test]
    fn test_log_filter_rejects_inverted_range() {
        let now = OffsetDateTime::now_utc();
        let filter = LogFilter {
            from: Some(now),
            to: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }
}
