//! Shared doubles for engine tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::RenewalConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use crate::lock::{Acquire, InMemoryLockManager, LeaseRenewal, LockManager, LockToken};
use crate::models::{Plan, Subscription};
use crate::notify::{NotificationDispatcher, NotificationKind, Notifier, NotifyError};
use crate::orchestrator::RenewalOrchestrator;
use crate::store::{InMemoryStore, RenewalStore};

/// Gateway that replays a script, then falls back to a fixed outcome
pub struct ScriptedGateway {
    script: Mutex<VecDeque<ChargeOutcome>>,
    fallback: ChargeOutcome,
    delay: Option<Duration>,
    ignores_cancel: bool,
    panics: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    pub fn approving() -> Self {
        Self::always(ChargeOutcome::Approved {
            reference: "ch_test".into(),
        })
    }

    pub fn always(outcome: ChargeOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            delay: None,
            ignores_cancel: false,
            panics: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(outcomes: Vec<ChargeOutcome>, fallback: ChargeOutcome) -> Self {
        let gateway = Self::always(fallback);
        *gateway.script.lock().unwrap() = outcomes.into();
        gateway
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::approving()
        }
    }

    /// Answer only after `delay`, unless the request is cancelled first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sit out the whole delay even when the request is cancelled
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignores_cancel = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: ChargeRequest) -> ChargeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.panics {
            panic!("gateway adapter blew up");
        }
        if let Some(delay) = self.delay.filter(|_| self.ignores_cancel) {
            tokio::time::sleep(delay).await;
        } else if let Some(delay) = self.delay {
            let mut cancel = request.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return ChargeOutcome::Error(GatewayError::Cancelled),
            }
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Notifier that remembers what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationKind, Uuid, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|(k, _, _)| *k).collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        business_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((kind, business_id, payload));
        Ok(())
    }
}

/// Lock manager whose leases can never be renewed
#[derive(Default)]
pub struct ExpiringLocks {
    inner: InMemoryLockManager,
}

#[async_trait]
impl LockManager for ExpiringLocks {
    async fn acquire(&self, subscription_id: Uuid, ttl: Duration) -> BillingResult<Acquire> {
        self.inner.acquire(subscription_id, ttl).await
    }

    async fn release(&self, subscription_id: Uuid, token: LockToken) -> BillingResult<bool> {
        self.inner.release(subscription_id, token).await
    }

    async fn renew(
        &self,
        _subscription_id: Uuid,
        _token: LockToken,
        _ttl: Duration,
    ) -> BillingResult<LeaseRenewal> {
        Ok(LeaseRenewal::Expired)
    }
}

/// Lock backend that is unreachable
pub struct UnavailableLocks;

#[async_trait]
impl LockManager for UnavailableLocks {
    async fn acquire(&self, _subscription_id: Uuid, _ttl: Duration) -> BillingResult<Acquire> {
        Err(BillingError::Lock("connection refused".into()))
    }

    async fn release(&self, _subscription_id: Uuid, _token: LockToken) -> BillingResult<bool> {
        Err(BillingError::Lock("connection refused".into()))
    }

    async fn renew(
        &self,
        _subscription_id: Uuid,
        _token: LockToken,
        _ttl: Duration,
    ) -> BillingResult<LeaseRenewal> {
        Err(BillingError::Lock("connection refused".into()))
    }
}

pub fn plan(duration_days: u32) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: "Pro".into(),
        price_cents: 4900,
        currency: "USD".into(),
        duration_days,
    }
}

/// Engine collaborators wired over in-memory backends
pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub locks: Arc<dyn LockManager>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<AuditLog>,
    pub config: RenewalConfig,
}

impl Fixture {
    pub fn new(gateway: ScriptedGateway) -> Self {
        Self::with_locks(gateway, Arc::new(InMemoryLockManager::new()))
    }

    pub fn with_locks(gateway: ScriptedGateway, locks: Arc<dyn LockManager>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditLog::new(store.clone() as Arc<dyn RenewalStore>));
        Self {
            store,
            locks,
            gateway: Arc::new(gateway),
            notifier: Arc::new(RecordingNotifier::default()),
            audit,
            config: RenewalConfig::default(),
        }
    }

    pub fn orchestrator(&self) -> RenewalOrchestrator {
        RenewalOrchestrator::new(
            self.store.clone(),
            self.locks.clone(),
            self.gateway.clone(),
            NotificationDispatcher::new(self.notifier.clone()),
            self.audit.clone(),
            &self.config,
        )
    }

    /// Store a plan and an auto-renewing ACTIVE subscription ending
    /// `ends_in` from now
    pub async fn seed(&self, ends_in: time::Duration, duration_days: u32) -> (Subscription, Plan) {
        let plan = plan(duration_days);
        let now = OffsetDateTime::now_utc();
        let sub = Subscription::new(
            Uuid::new_v4(),
            plan.id,
            now - time::Duration::days(i64::from(duration_days)),
            now + ends_in,
        );
        self.store.insert_plan(plan.clone()).await;
        self.store.insert_subscription(sub.clone()).await;
        (sub, plan)
    }

    pub async fn subscription(&self, id: Uuid) -> Subscription {
        self.store.get_subscription(id).await.unwrap().unwrap()
    }
}
