//! Billing error types

use thiserror::Error;
use uuid::Uuid;

use crate::models::SubscriptionStatus;

/// Result type for renewal engine operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the renewal engine
#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad parameters on a manual or administrative call; nothing was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another holder owns the renewal lock for this subscription
    #[error("Subscription {0} is already being processed")]
    LockBusy(Uuid),

    #[error("Transient gateway failure: {0}")]
    GatewayTransient(String),

    #[error("Terminal gateway failure: {0}")]
    GatewayTerminal(String),

    /// A scheduled run could not complete (e.g. the candidate set was unreadable)
    #[error("Scheduler run failed: {0}")]
    SchedulerFatal(String),

    #[error("Scheduler is not running")]
    SchedulerNotRunning,

    #[error("Work queue is closed")]
    QueueClosed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {subscription_id}: {from} -> {to}")]
    InvalidTransition {
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock backend error: {0}")]
    Lock(String),

    #[error("Cron error: {0}")]
    Cron(String),
}

impl BillingError {
    /// Whether the same operation may succeed on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::LockBusy(_)
                | BillingError::GatewayTransient(_)
                | BillingError::SchedulerFatal(_)
                | BillingError::Database(_)
                | BillingError::Lock(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(e: redis::RedisError) -> Self {
        BillingError::Lock(e.to_string())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for BillingError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        BillingError::Cron(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::LockBusy(Uuid::new_v4()).is_retryable());
        assert!(BillingError::SchedulerFatal("db down".into()).is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
        assert!(!BillingError::GatewayTerminal("declined".into()).is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let id = Uuid::nil();
        let err = BillingError::InvalidTransition {
            subscription_id: id,
            from: SubscriptionStatus::Suspended,
            to: SubscriptionStatus::Active,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid status transition for {}: SUSPENDED -> ACTIVE", id)
        );
    }
}
