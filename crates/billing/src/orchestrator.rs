//! Per-subscription renewal workflow
//!
//! [`RenewalOrchestrator::process`] is the only automated path that mutates a
//! subscription. It runs while holding the subscription's lease:
//!
//! 1. acquire the lease (BUSY means someone else is on it: skip)
//! 2. re-read the subscription and re-check eligibility
//! 3. charge the plan price under a deadline, heartbeating the lease
//! 4. apply the outcome (renew / schedule retry / suspend) and persist the
//!    attempt, subscription and alert together
//! 5. notify, then release the lease
//!
//! The locked section runs in its own task so a panic inside it becomes an
//! ERROR attempt instead of taking the worker down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinError;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::batch::Batch;
use crate::config::RenewalConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    cancellation, CancelSignal, ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway,
};
use crate::lock::{Acquire, LeaseRenewal, LockManager, LockToken};
use crate::models::{
    Alert, AlertSeverity, AlertType, AttemptOutcome, Plan, RenewalAttempt, Subscription,
    SubscriptionStatus,
};
use crate::notify::{NotificationDispatcher, NotificationKind};
use crate::retry::{ErrorClass, RetryPolicy};
use crate::store::RenewalStore;

/// How a subscription reached the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Periodic tick or manual run: window and retry timing apply
    Scheduled,
    /// Diagnostic single-business run: window and retry timing are ignored
    Simulation,
}

/// Why a subscription was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LockBusy,
    NotFound,
    NotRenewable(SubscriptionStatus),
    AutoRenewDisabled,
    OutsideWindow,
    RetryNotDue,
    /// The current billing period already has an APPROVED attempt
    AlreadyRenewed,
    BatchPaused,
    PlanMissing,
}

/// Result of processing one subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum RenewalOutcome {
    Renewed {
        #[serde(with = "time::serde::rfc3339")]
        new_end_date: OffsetDateTime,
        reference: String,
    },
    RetryScheduled {
        retry_count: u32,
        #[serde(with = "time::serde::rfc3339")]
        next_retry_at: OffsetDateTime,
    },
    Suspended {
        reason: String,
    },
    Errored {
        message: String,
    },
    Skipped(SkipReason),
}

/// Idempotency key shared by every charge for one billing period
pub fn idempotency_key(subscription_id: Uuid, period_end: OffsetDateTime) -> String {
    format!("{}:{}", subscription_id, period_end.unix_timestamp())
}

/// Data fixed for the lifetime of one charge attempt
struct AttemptContext {
    plan: Plan,
    period_end: OffsetDateTime,
    attempt_number: u32,
    duration_ms: u64,
}

impl AttemptContext {
    fn attempt(&self, subscription: &Subscription, outcome: AttemptOutcome) -> RenewalAttempt {
        RenewalAttempt {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            business_id: subscription.business_id,
            attempt_number: self.attempt_number,
            amount_cents: self.plan.price_cents,
            currency: self.plan.currency.clone(),
            outcome,
            billing_period_end: self.period_end,
            gateway_reference: None,
            error_message: None,
            duration_ms: self.duration_ms,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone)]
pub struct RenewalOrchestrator {
    store: Arc<dyn RenewalStore>,
    locks: Arc<dyn LockManager>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: NotificationDispatcher,
    audit: Arc<AuditLog>,
    policy: RetryPolicy,
    window_days: u32,
    lock_ttl: Duration,
    charge_deadline: Duration,
}

impl RenewalOrchestrator {
    pub fn new(
        store: Arc<dyn RenewalStore>,
        locks: Arc<dyn LockManager>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: NotificationDispatcher,
        audit: Arc<AuditLog>,
        config: &RenewalConfig,
    ) -> Self {
        Self {
            store,
            locks,
            gateway,
            notifier,
            audit,
            policy: RetryPolicy::from_config(config),
            window_days: config.renewal_window_days,
            lock_ttl: config.lock_ttl,
            charge_deadline: config.charge_deadline,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the renewal workflow for one subscription and report the outcome
    /// to `batch`. Never fails: every error becomes an audited outcome.
    pub async fn process(
        &self,
        subscription_id: Uuid,
        batch: &Arc<Batch>,
        mode: RunMode,
    ) -> RenewalOutcome {
        let outcome = match self.locks.acquire(subscription_id, self.lock_ttl).await {
            Ok(Acquire::Acquired(token)) => {
                self.process_locked(subscription_id, token, batch, mode)
                    .await
            }
            Ok(Acquire::Busy) => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    batch_id = %batch.id(),
                    "Subscription locked by another worker, skipping"
                );
                RenewalOutcome::Skipped(SkipReason::LockBusy)
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to acquire renewal lock"
                );
                let message = e.to_string();
                self.record_error(subscription_id, &message).await;
                RenewalOutcome::Errored { message }
            }
        };

        batch.note_finished(&outcome);
        outcome
    }

    async fn process_locked(
        &self,
        subscription_id: Uuid,
        token: LockToken,
        batch: &Arc<Batch>,
        mode: RunMode,
    ) -> RenewalOutcome {
        let (cancel, signal) = cancellation();
        let mut task = tokio::spawn({
            let this = self.clone();
            let batch = Arc::clone(batch);
            async move { this.renew(subscription_id, &batch, mode, signal).await }
        });

        let half_ttl = (self.lock_ttl / 2).max(Duration::from_millis(1));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + half_ttl, half_ttl);
        let mut lease_lost = false;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = heartbeat.tick(), if !lease_lost => {
                    match self.locks.renew(subscription_id, token, self.lock_ttl).await {
                        Ok(LeaseRenewal::Renewed) => {
                            tracing::trace!(subscription_id = %subscription_id, "Lease renewed");
                        }
                        Ok(LeaseRenewal::Expired) => {
                            tracing::warn!(subscription_id = %subscription_id, "Renewal lease expired, cancelling charge");
                            lease_lost = true;
                            cancel.cancel();
                        }
                        Err(e) => {
                            tracing::warn!(subscription_id = %subscription_id, error = %e, "Lease renewal failed, cancelling charge");
                            lease_lost = true;
                            cancel.cancel();
                        }
                    }
                }
            }
        };

        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Renewal failed"
                );
                self.record_error(subscription_id, &e.to_string()).await;
                RenewalOutcome::Errored {
                    message: e.to_string(),
                }
            }
            Err(join_error) => {
                let message = join_failure_message(join_error);
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %message,
                    "Renewal task crashed"
                );
                self.record_error(subscription_id, &message).await;
                RenewalOutcome::Errored { message }
            }
        };

        match self.locks.release(subscription_id, token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(subscription_id = %subscription_id, "Lease was already gone at release");
            }
            Err(e) => {
                tracing::warn!(subscription_id = %subscription_id, error = %e, "Failed to release renewal lock");
            }
        }
        outcome
    }

    fn ineligible(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
        mode: RunMode,
    ) -> Option<SkipReason> {
        if !subscription.status.is_renewable() {
            return Some(SkipReason::NotRenewable(subscription.status));
        }
        if !subscription.auto_renew {
            return Some(SkipReason::AutoRenewDisabled);
        }
        if mode == RunMode::Scheduled {
            if !subscription.within_window(now, self.window_days) {
                return Some(SkipReason::OutsideWindow);
            }
            if subscription.retry_pending(now) {
                return Some(SkipReason::RetryNotDue);
            }
        }
        None
    }

    /// The locked section. Only fresh state read here drives decisions.
    async fn renew(
        &self,
        subscription_id: Uuid,
        batch: &Arc<Batch>,
        mode: RunMode,
        cancel: CancelSignal,
    ) -> BillingResult<RenewalOutcome> {
        let now = OffsetDateTime::now_utc();
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(RenewalOutcome::Skipped(SkipReason::NotFound));
        };

        if let Some(reason) = self.ineligible(&subscription, now, mode) {
            tracing::debug!(
                subscription_id = %subscription_id,
                reason = ?reason,
                "Subscription no longer eligible for renewal"
            );
            return Ok(RenewalOutcome::Skipped(reason));
        }

        let Some(plan) = self.store.get_plan(subscription.plan_id).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                plan_id = %subscription.plan_id,
                "Plan missing for subscription"
            );
            return Ok(RenewalOutcome::Skipped(SkipReason::PlanMissing));
        };

        let period_end = subscription.end_date;
        if self
            .store
            .has_approved_attempt(subscription_id, period_end)
            .await?
        {
            return Ok(RenewalOutcome::Skipped(SkipReason::AlreadyRenewed));
        }

        if batch.is_paused() {
            return Ok(RenewalOutcome::Skipped(SkipReason::BatchPaused));
        }

        let attempt_number = self
            .store
            .count_attempts_for_period(subscription_id, period_end)
            .await?
            .saturating_add(1);

        let request = ChargeRequest {
            subscription_id,
            business_id: subscription.business_id,
            amount_cents: plan.price_cents,
            currency: plan.currency.clone(),
            payment_method: subscription.payment_method.clone(),
            idempotency_key: idempotency_key(subscription_id, period_end),
            deadline: self.charge_deadline,
            cancel: cancel.clone(),
        };

        tracing::info!(
            subscription_id = %subscription_id,
            business_id = %subscription.business_id,
            attempt_number = attempt_number,
            amount_cents = plan.price_cents,
            "Charging renewal"
        );

        let started = Instant::now();
        let charge = match tokio::time::timeout(self.charge_deadline, self.gateway.charge(request)).await {
            Ok(outcome) => outcome,
            Err(_) => ChargeOutcome::Error(GatewayError::Timeout),
        };
        let ctx = AttemptContext {
            plan,
            period_end,
            attempt_number,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if cancel.is_cancelled() {
            // Another worker may own the subscription now; leave its row alone
            let mut attempt = ctx.attempt(&subscription, AttemptOutcome::Error);
            let message = match charge {
                ChargeOutcome::Approved { reference } => {
                    // The customer was charged; keep the reference
                    tracing::error!(
                        subscription_id = %subscription.id,
                        reference = %reference,
                        "Charge approved after renewal lease was lost"
                    );
                    attempt.gateway_reference = Some(reference);
                    "charge approved after lease loss, needs reconciliation".to_string()
                }
                _ => "renewal lease lost before the charge completed".to_string(),
            };
            attempt.error_message = Some(message.clone());
            self.audit.record(&attempt, None, None).await?;
            return Ok(RenewalOutcome::Errored { message });
        }

        match charge {
            ChargeOutcome::Approved { reference } => {
                self.on_approved(subscription, ctx, reference, batch).await
            }
            ChargeOutcome::Failed(error) => {
                self.on_failure(subscription, ctx, error, false, batch)
                    .await
            }
            ChargeOutcome::Error(error) => {
                self.on_failure(subscription, ctx, error, true, batch).await
            }
        }
    }

    async fn on_approved(
        &self,
        mut subscription: Subscription,
        ctx: AttemptContext,
        reference: String,
        batch: &Arc<Batch>,
    ) -> BillingResult<RenewalOutcome> {
        ensure_transition(&subscription, SubscriptionStatus::Active)?;

        subscription.end_date =
            ctx.period_end + time::Duration::days(i64::from(ctx.plan.duration_days));
        subscription.status = SubscriptionStatus::Active;
        subscription.retry_count = 0;
        subscription.next_retry_at = None;
        subscription.last_attempt_at = Some(OffsetDateTime::now_utc());

        let mut attempt = ctx.attempt(&subscription, AttemptOutcome::Approved);
        attempt.gateway_reference = Some(reference.clone());
        self.audit
            .record(&attempt, Some(&subscription), None)
            .await?;
        self.check_systemic(batch, false).await;

        self.notifier
            .dispatch(
                NotificationKind::RenewalSucceeded,
                subscription.business_id,
                serde_json::json!({
                    "subscription_id": subscription.id,
                    "plan": ctx.plan.name,
                    "amount_cents": ctx.plan.price_cents,
                    "currency": ctx.plan.currency,
                    "new_end_date": subscription.end_date.unix_timestamp(),
                    "reference": reference,
                }),
            )
            .await;

        Ok(RenewalOutcome::Renewed {
            new_end_date: subscription.end_date,
            reference,
        })
    }

    async fn on_failure(
        &self,
        mut subscription: Subscription,
        ctx: AttemptContext,
        error: GatewayError,
        gateway_error: bool,
        batch: &Arc<Batch>,
    ) -> BillingResult<RenewalOutcome> {
        // No usable answer counts as transient for the subscription
        let class = if gateway_error {
            ErrorClass::Transient
        } else {
            self.policy.classify(&error)
        };
        let now = OffsetDateTime::now_utc();
        subscription.last_attempt_at = Some(now);

        let terminal = class == ErrorClass::Terminal;
        if terminal || self.policy.exhausted_after_failure(subscription.retry_count) {
            let (alert_type, reason) = if terminal {
                (
                    AlertType::TerminalDecline,
                    format!("terminal gateway failure: {}", error),
                )
            } else {
                subscription.retry_count = subscription
                    .retry_count
                    .saturating_add(1)
                    .min(self.policy.max_retries);
                (
                    AlertType::RetriesExhausted,
                    format!(
                        "retries exhausted after {} failures: {}",
                        subscription.retry_count, error
                    ),
                )
            };

            ensure_transition(&subscription, SubscriptionStatus::Suspended)?;
            subscription.status = SubscriptionStatus::Suspended;
            subscription.next_retry_at = None;

            let mut attempt = ctx.attempt(&subscription, AttemptOutcome::FailedTerminal);
            attempt.error_message = Some(reason.clone());
            let alert = Alert::new(
                alert_type,
                AlertSeverity::High,
                format!("Subscription {} suspended: {}", subscription.id, reason),
                Some(subscription.id),
            );
            self.audit
                .record(&attempt, Some(&subscription), Some(&alert))
                .await?;
            self.check_systemic(batch, gateway_error).await;

            self.notifier
                .dispatch(
                    NotificationKind::RenewalFailed,
                    subscription.business_id,
                    serde_json::json!({
                        "subscription_id": subscription.id,
                        "plan": ctx.plan.name,
                        "reason": reason,
                    }),
                )
                .await;

            return Ok(RenewalOutcome::Suspended { reason });
        }

        subscription.retry_count = subscription.retry_count.saturating_add(1);
        let next_retry_at = now + self.policy.backoff(subscription.retry_count);
        subscription.next_retry_at = Some(next_retry_at);
        if now > ctx.period_end {
            ensure_transition(&subscription, SubscriptionStatus::Grace)?;
            subscription.status = SubscriptionStatus::Grace;
        }

        let outcome = if gateway_error {
            AttemptOutcome::Error
        } else {
            AttemptOutcome::FailedTransient
        };
        let mut attempt = ctx.attempt(&subscription, outcome);
        attempt.error_message = Some(error.to_string());
        self.audit
            .record(&attempt, Some(&subscription), None)
            .await?;
        self.check_systemic(batch, gateway_error).await;

        self.notifier
            .dispatch(
                NotificationKind::RenewalRetryScheduled,
                subscription.business_id,
                serde_json::json!({
                    "subscription_id": subscription.id,
                    "plan": ctx.plan.name,
                    "reason": error.to_string(),
                    "retry_count": subscription.retry_count,
                    "next_retry_at": next_retry_at.unix_timestamp(),
                }),
            )
            .await;

        Ok(RenewalOutcome::RetryScheduled {
            retry_count: subscription.retry_count,
            next_retry_at,
        })
    }

    async fn check_systemic(&self, batch: &Batch, gateway_error: bool) {
        let Some(rate) = batch.record_charge(gateway_error) else {
            return;
        };
        let alert = Alert::new(
            AlertType::SystemicFailureRate,
            AlertSeverity::Systemic,
            format!(
                "{:.0}% of gateway calls in {} batch {} returned errors; remaining charges paused",
                rate * 100.0,
                batch.job(),
                batch.id()
            ),
            None,
        );
        if let Err(e) = self.audit.raise_alert(&alert).await {
            tracing::error!(batch_id = %batch.id(), error = %e, "Failed to store systemic alert");
        }
    }

    /// Best effort: audit a crashed or failed workflow as an ERROR attempt
    async fn record_error(&self, subscription_id: Uuid, message: &str) {
        if let Err(e) = self.try_record_error(subscription_id, message).await {
            tracing::error!(
                subscription_id = %subscription_id,
                error = %e,
                "Failed to record ERROR attempt"
            );
        }
    }

    async fn try_record_error(&self, subscription_id: Uuid, message: &str) -> BillingResult<()> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(());
        };
        let Some(plan) = self.store.get_plan(subscription.plan_id).await? else {
            return Ok(());
        };
        let attempt_number = self
            .store
            .count_attempts_for_period(subscription_id, subscription.end_date)
            .await?
            .saturating_add(1);
        let ctx = AttemptContext {
            plan,
            period_end: subscription.end_date,
            attempt_number,
            duration_ms: 0,
        };
        let mut attempt = ctx.attempt(&subscription, AttemptOutcome::Error);
        attempt.error_message = Some(message.to_string());
        self.audit.record(&attempt, None, None).await
    }

    /// Administrative SUSPENDED -> ACTIVE override, under the same lock
    pub async fn reactivate(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let token = match self.locks.acquire(subscription_id, self.lock_ttl).await? {
            Acquire::Acquired(token) => token,
            Acquire::Busy => return Err(BillingError::LockBusy(subscription_id)),
        };

        let result = self.reactivate_locked(subscription_id).await;
        if let Err(e) = self.locks.release(subscription_id, token).await {
            tracing::warn!(subscription_id = %subscription_id, error = %e, "Failed to release renewal lock");
        }
        let subscription = result?;

        self.notifier
            .dispatch(
                NotificationKind::SubscriptionReactivated,
                subscription.business_id,
                serde_json::json!({
                    "subscription_id": subscription.id,
                    "end_date": subscription.end_date.unix_timestamp(),
                }),
            )
            .await;
        Ok(subscription)
    }

    async fn reactivate_locked(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let mut subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;

        if !subscription.status.can_reactivate() {
            return Err(BillingError::InvalidTransition {
                subscription_id,
                from: subscription.status,
                to: SubscriptionStatus::Active,
            });
        }

        let previous = subscription.status;
        subscription.status = SubscriptionStatus::Active;
        subscription.retry_count = 0;
        subscription.next_retry_at = None;
        self.store.save_subscription(&subscription).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            business_id = %subscription.business_id,
            from = %previous,
            "Subscription reactivated by administrator"
        );
        Ok(subscription)
    }
}

fn ensure_transition(subscription: &Subscription, to: SubscriptionStatus) -> BillingResult<()> {
    if subscription.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            subscription_id: subscription.id,
            from: subscription.status,
            to,
        })
    }
}

fn join_failure_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "renewal task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("renewal task panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockManager;
    use crate::models::JobName;
    use crate::store::{LogFilter, PageRequest};
    use crate::test_support::{ExpiringLocks, Fixture, ScriptedGateway, UnavailableLocks};

    const DAY: time::Duration = time::Duration::DAY;

    fn batch() -> Arc<Batch> {
        Batch::new(JobName::AutoRenewalRun, 0.5, 5)
    }

    async fn attempts(fx: &Fixture, subscription_id: Uuid) -> Vec<RenewalAttempt> {
        let filter = LogFilter {
            subscription_id: Some(subscription_id),
            ..Default::default()
        };
        fx.store
            .list_attempts(&filter, PageRequest::new(1, 100).unwrap())
            .await
            .unwrap()
            .items
    }

    #[tokio::test]
    async fn test_approved_extends_from_old_end_date() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, _) = fx.seed(time::Duration::hours(2), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        let renewed = fx.subscription(sub.id).await;
        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));
        assert_eq!(renewed.end_date, sub.end_date + 30 * DAY);
        assert_eq!(renewed.status, SubscriptionStatus::Active);
        assert_eq!(renewed.retry_count, 0);

        let history = attempts(&fx, sub.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Approved);
        assert_eq!(history[0].gateway_reference.as_deref(), Some("ch_test"));
        assert_eq!(history[0].billing_period_end, sub.end_date);
        assert_eq!(fx.notifier.count(NotificationKind::RenewalSucceeded), 1);
    }

    #[tokio::test]
    async fn test_charge_carries_period_idempotency_key() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, plan) = fx.seed(time::Duration::hours(2), 30).await;

        fx.orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        let requests = fx.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].idempotency_key,
            format!("{}:{}", sub.id, sub.end_date.unix_timestamp())
        );
        assert_eq!(requests[0].amount_cents, plan.price_cents);
    }

    #[tokio::test]
    async fn test_transient_failure_before_end_date_keeps_status() {
        let fx = Fixture::new(ScriptedGateway::always(ChargeOutcome::Failed(
            GatewayError::ServerError { status: 503 },
        )));
        let (sub, _) = fx.seed(time::Duration::days(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        let after = fx.subscription(sub.id).await;
        assert!(matches!(
            outcome,
            RenewalOutcome::RetryScheduled { retry_count: 1, .. }
        ));
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.end_date, sub.end_date);
        // backoff(1) with the default 1 day base
        let delay = after.next_retry_at.unwrap() - after.last_attempt_at.unwrap();
        assert_eq!(delay, 2 * DAY);
        assert_eq!(
            attempts(&fx, sub.id).await[0].outcome,
            AttemptOutcome::FailedTransient
        );
        assert_eq!(fx.notifier.count(NotificationKind::RenewalRetryScheduled), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_after_end_date_enters_grace() {
        let fx = Fixture::new(ScriptedGateway::always(ChargeOutcome::Failed(
            GatewayError::RateLimited { retry_after: None },
        )));
        let (sub, _) = fx.seed(-time::Duration::hours(1), 30).await;

        fx.orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert_eq!(
            fx.subscription(sub.id).await.status,
            SubscriptionStatus::Grace
        );
    }

    #[tokio::test]
    async fn test_terminal_decline_suspends_and_alerts() {
        let fx = Fixture::new(ScriptedGateway::always(ChargeOutcome::Failed(
            GatewayError::CardDeclined("stolen card".into()),
        )));
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        let after = fx.subscription(sub.id).await;
        assert!(matches!(outcome, RenewalOutcome::Suspended { .. }));
        assert_eq!(after.status, SubscriptionStatus::Suspended);
        assert_eq!(after.retry_count, 0);
        assert_eq!(
            attempts(&fx, sub.id).await[0].outcome,
            AttemptOutcome::FailedTerminal
        );

        let alerts = fx.audit.alerts(PageRequest::default()).await.unwrap();
        assert_eq!(alerts.total, 1);
        assert_eq!(alerts.items[0].alert_type, AlertType::TerminalDecline);
        assert_eq!(alerts.items[0].severity, AlertSeverity::High);
        assert_eq!(alerts.items[0].related_subscription_id, Some(sub.id));
        assert_eq!(fx.notifier.count(NotificationKind::RenewalFailed), 1);
    }

    #[tokio::test]
    async fn test_gateway_error_recorded_as_error_but_retried() {
        let fx = Fixture::new(ScriptedGateway::always(ChargeOutcome::Error(
            GatewayError::Unreachable("connection refused".into()),
        )));
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;
        let batch = batch();

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch, RunMode::Scheduled)
            .await;

        assert!(matches!(outcome, RenewalOutcome::RetryScheduled { .. }));
        assert_eq!(attempts(&fx, sub.id).await[0].outcome, AttemptOutcome::Error);
        assert_eq!(batch.summary().await.gateway_errors, 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_transient_error() {
        let mut fx = Fixture::new(ScriptedGateway::approving().with_delay(std::time::Duration::from_secs(5)));
        fx.config.charge_deadline = std::time::Duration::from_millis(50);
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert!(matches!(outcome, RenewalOutcome::RetryScheduled { .. }));
        let history = attempts(&fx, sub.id).await;
        assert_eq!(history[0].outcome, AttemptOutcome::Error);
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("gateway call timed out")
        );
    }

    #[tokio::test]
    async fn test_skips_when_ineligible() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let orchestrator = fx.orchestrator();

        let (far, _) = fx.seed(time::Duration::days(20), 30).await;
        assert_eq!(
            orchestrator.process(far.id, &batch(), RunMode::Scheduled).await,
            RenewalOutcome::Skipped(SkipReason::OutsideWindow)
        );

        let (mut manual, _) = fx.seed(time::Duration::hours(1), 30).await;
        manual.auto_renew = false;
        fx.store.insert_subscription(manual.clone()).await;
        assert_eq!(
            orchestrator.process(manual.id, &batch(), RunMode::Scheduled).await,
            RenewalOutcome::Skipped(SkipReason::AutoRenewDisabled)
        );

        let (mut waiting, _) = fx.seed(time::Duration::hours(1), 30).await;
        waiting.retry_count = 1;
        waiting.next_retry_at = Some(OffsetDateTime::now_utc() + DAY);
        fx.store.insert_subscription(waiting.clone()).await;
        assert_eq!(
            orchestrator.process(waiting.id, &batch(), RunMode::Scheduled).await,
            RenewalOutcome::Skipped(SkipReason::RetryNotDue)
        );

        let (mut cancelled, _) = fx.seed(time::Duration::hours(1), 30).await;
        cancelled.status = SubscriptionStatus::Cancelled;
        fx.store.insert_subscription(cancelled.clone()).await;
        assert_eq!(
            orchestrator.process(cancelled.id, &batch(), RunMode::Scheduled).await,
            RenewalOutcome::Skipped(SkipReason::NotRenewable(SubscriptionStatus::Cancelled))
        );

        assert_eq!(fx.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_simulation_ignores_window() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, _) = fx.seed(time::Duration::days(20), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Simulation)
            .await;

        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));
    }

    #[tokio::test]
    async fn test_busy_lock_skips_without_charging() {
        let locks = Arc::new(InMemoryLockManager::new());
        let fx = Fixture::with_locks(ScriptedGateway::approving(), locks.clone());
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let _held = locks
            .acquire(sub.id, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert_eq!(outcome, RenewalOutcome::Skipped(SkipReason::LockBusy));
        assert_eq!(fx.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_processing() {
        let locks = Arc::new(InMemoryLockManager::new());
        let fx = Fixture::with_locks(ScriptedGateway::approving(), locks.clone());
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        fx.orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert!(matches!(
            locks
                .acquire(sub.id, std::time::Duration::from_secs(1))
                .await
                .unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_error_attempt() {
        let locks = Arc::new(InMemoryLockManager::new());
        let fx = Fixture::with_locks(ScriptedGateway::panicking(), locks.clone());
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        match outcome {
            RenewalOutcome::Errored { message } => assert!(message.contains("panicked")),
            other => panic!("expected Errored, got {:?}", other),
        }
        let history = attempts(&fx, sub.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Error);
        // Subscription untouched, lock released
        assert_eq!(fx.subscription(sub.id).await, sub);
        assert!(matches!(
            locks
                .acquire(sub.id, std::time::Duration::from_secs(1))
                .await
                .unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_lease_loss_cancels_charge_without_mutation() {
        let mut fx = Fixture::with_locks(
            ScriptedGateway::approving().with_delay(std::time::Duration::from_secs(5)),
            Arc::new(ExpiringLocks::default()),
        );
        fx.config.lock_ttl = std::time::Duration::from_millis(100);
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert!(matches!(outcome, RenewalOutcome::Errored { .. }));
        assert_eq!(fx.subscription(sub.id).await, sub);
        let history = attempts(&fx, sub.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Error);
    }

    #[tokio::test]
    async fn test_approval_after_lease_loss_keeps_reference() {
        let mut fx = Fixture::with_locks(
            ScriptedGateway::always(ChargeOutcome::Approved {
                reference: "ch_late".into(),
            })
            .with_delay(std::time::Duration::from_millis(200))
            .ignoring_cancel(),
            Arc::new(ExpiringLocks::default()),
        );
        fx.config.lock_ttl = std::time::Duration::from_millis(100);
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;

        assert!(matches!(outcome, RenewalOutcome::Errored { .. }));
        assert_eq!(fx.subscription(sub.id).await, sub);
        let history = attempts(&fx, sub.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Error);
        assert_eq!(history[0].gateway_reference.as_deref(), Some("ch_late"));
        assert!(history[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("approved after lease loss"));
    }

    #[tokio::test]
    async fn test_lock_backend_failure_is_audited() {
        let fx = Fixture::with_locks(ScriptedGateway::approving(), Arc::new(UnavailableLocks));
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;
        let batch = batch();

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch, RunMode::Scheduled)
            .await;

        assert!(matches!(outcome, RenewalOutcome::Errored { .. }));
        assert_eq!(fx.gateway.calls(), 0);
        assert_eq!(fx.subscription(sub.id).await, sub);
        let history = attempts(&fx, sub.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Error);
        assert!(history[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Lock backend error"));
    }

    #[tokio::test]
    async fn test_already_renewed_period_is_skipped() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, plan) = fx.seed(time::Duration::hours(1), 30).await;

        // An approval for this period exists but the row was not advanced
        let ctx = AttemptContext {
            plan,
            period_end: sub.end_date,
            attempt_number: 1,
            duration_ms: 0,
        };
        fx.store
            .commit_attempt(&ctx.attempt(&sub, AttemptOutcome::Approved), None, None)
            .await
            .unwrap();

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch(), RunMode::Scheduled)
            .await;
        assert_eq!(outcome, RenewalOutcome::Skipped(SkipReason::AlreadyRenewed));
        assert_eq!(fx.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_paused_batch_skips_charges() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;
        let batch = Batch::new(JobName::AutoRenewalRun, 0.5, 1);
        batch.record_charge(true);
        assert!(batch.is_paused());

        let outcome = fx
            .orchestrator()
            .process(sub.id, &batch, RunMode::Scheduled)
            .await;

        assert_eq!(outcome, RenewalOutcome::Skipped(SkipReason::BatchPaused));
        assert_eq!(fx.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_reactivate_suspended() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (mut sub, _) = fx.seed(time::Duration::hours(1), 30).await;
        sub.status = SubscriptionStatus::Suspended;
        sub.retry_count = 5;
        fx.store.insert_subscription(sub.clone()).await;

        let reactivated = fx.orchestrator().reactivate(sub.id).await.unwrap();
        assert_eq!(reactivated.status, SubscriptionStatus::Active);
        assert_eq!(reactivated.retry_count, 0);
        assert_eq!(fx.subscription(sub.id).await, reactivated);
        assert_eq!(fx.notifier.count(NotificationKind::SubscriptionReactivated), 1);
    }

    #[tokio::test]
    async fn test_reactivate_rejects_active() {
        let fx = Fixture::new(ScriptedGateway::approving());
        let (sub, _) = fx.seed(time::Duration::hours(1), 30).await;

        let result = fx.orchestrator().reactivate(sub.id).await;
        assert!(matches!(
            result,
            Err(BillingError::InvalidTransition {
                from: SubscriptionStatus::Active,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reactivate_respects_lock() {
        let locks = Arc::new(InMemoryLockManager::new());
        let fx = Fixture::with_locks(ScriptedGateway::approving(), locks.clone());
        let (mut sub, _) = fx.seed(time::Duration::hours(1), 30).await;
        sub.status = SubscriptionStatus::Suspended;
        fx.store.insert_subscription(sub.clone()).await;

        let _held = locks
            .acquire(sub.id, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            fx.orchestrator().reactivate(sub.id).await,
            Err(BillingError::LockBusy(id)) if id == sub.id
        ));
    }
}
