//! Renewal notifications
//!
//! Delivery is best effort. [`NotificationDispatcher`] logs failures and never
//! returns them, so a broken mail relay cannot hold up a status transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RenewalSucceeded,
    /// Charge failed, another attempt is scheduled
    RenewalRetryScheduled,
    /// Retries exhausted or terminal decline; subscription suspended
    RenewalFailed,
    SubscriptionReactivated,
    /// Informational "your plan expires in N days"
    ExpirationNotice,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::RenewalSucceeded => "renewal_succeeded",
            NotificationKind::RenewalRetryScheduled => "renewal_retry_scheduled",
            NotificationKind::RenewalFailed => "renewal_failed",
            NotificationKind::SubscriptionReactivated => "subscription_reactivated",
            NotificationKind::ExpirationNotice => "expiration_notice",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivery channel implemented outside the engine
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        kind: NotificationKind,
        business_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Best-effort front for a [`Notifier`]
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Send and report whether it was delivered. Failures are only logged.
    pub async fn dispatch(
        &self,
        kind: NotificationKind,
        business_id: Uuid,
        payload: serde_json::Value,
    ) -> bool {
        match self.notifier.send(kind, business_id, payload).await {
            Ok(()) => {
                tracing::debug!(
                    business_id = %business_id,
                    kind = kind.as_str(),
                    "Notification sent"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    business_id = %business_id,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to send notification"
                );
                false
            }
        }
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        business_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            business_id = %business_id,
            kind = kind.as_str(),
            payload = %payload,
            "Renewal notification"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    kind: NotificationKind,
    business_id: Uuid,
    payload: &'a serde_json::Value,
}

/// POSTs notifications as JSON to a webhook, retrying with backoff
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    attempts: usize,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            attempts: 3,
        }
    }

    async fn post_once(&self, body: &WebhookBody<'_>) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Delivery(format!(
                "webhook returned HTTP {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        business_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let body = WebhookBody {
            kind,
            business_id,
            payload: &payload,
        };
        // First try is immediate; retries follow the strategy
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.attempts.saturating_sub(1));

        Retry::spawn(strategy, || self.post_once(&body)).await
    }
}
