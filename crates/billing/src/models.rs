//! Renewal domain types
//!
//! Subscriptions, plans, renewal attempts, cron job configuration and alerts.
//! Status and outcome enums serialize as their SCREAMING_SNAKE_CASE names, which
//! is also how they are stored.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Lifecycle status of a tenant subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    /// Renewal failed but retries remain; access is not yet revoked
    Grace,
    Suspended,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 6] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Grace,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "TRIAL",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Grace => "GRACE",
            SubscriptionStatus::Suspended => "SUSPENDED",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses the automated renewal path is allowed to charge
    pub fn is_renewable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Grace)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled
        )
    }

    /// Allowed automated transitions.
    ///
    /// SUSPENDED -> ACTIVE is deliberately absent; only an administrative
    /// reactivation may take that edge (see [`SubscriptionStatus::can_reactivate`]).
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        match (self, next) {
            (Trial, Active | Expired | Cancelled) => true,
            (Active, Active | Grace | Suspended | Expired | Cancelled) => true,
            (Grace, Active | Grace | Suspended | Expired | Cancelled) => true,
            (Suspended, Suspended | Expired | Cancelled) => true,
            _ => false,
        }
    }

    pub fn can_reactivate(&self) -> bool {
        matches!(self, SubscriptionStatus::Suspended)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BillingError::Validation(format!("Unknown subscription status: {}", s)))
    }
}

/// A tenant subscription to a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub business_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub auto_renew: bool,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    /// Opaque payment method reference handed to the gateway
    pub payment_method: Option<String>,
}

impl Subscription {
    /// Create an ACTIVE, auto-renewing subscription covering `[start, end)`
    pub fn new(business_id: Uuid, plan_id: Uuid, start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            business_id,
            plan_id,
            status: SubscriptionStatus::Active,
            start_date: start,
            end_date: end,
            auto_renew: true,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            payment_method: None,
        }
    }

    /// Whether the end date falls inside the renewal window measured from `now`
    pub fn within_window(&self, now: OffsetDateTime, days_ahead: u32) -> bool {
        self.end_date <= now + time::Duration::days(i64::from(days_ahead))
    }

    /// Whether a scheduled retry is still in the future
    pub fn retry_pending(&self, now: OffsetDateTime) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }
}

/// Plan reference data, read-only to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Price per period in minor units (cents)
    pub price_cents: i64,
    pub currency: String,
    pub duration_days: u32,
}

/// Final result of one renewal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Approved,
    FailedTransient,
    FailedTerminal,
    /// Gateway timeout/unreachable, lease loss, or a crash inside the worker
    Error,
}

impl AttemptOutcome {
    pub const ALL: [AttemptOutcome; 4] = [
        AttemptOutcome::Approved,
        AttemptOutcome::FailedTransient,
        AttemptOutcome::FailedTerminal,
        AttemptOutcome::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Approved => "APPROVED",
            AttemptOutcome::FailedTransient => "FAILED_TRANSIENT",
            AttemptOutcome::FailedTerminal => "FAILED_TERMINAL",
            AttemptOutcome::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptOutcome::ALL
            .into_iter()
            .find(|outcome| outcome.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BillingError::Validation(format!("Unknown attempt outcome: {}", s)))
    }
}

/// Append-only audit record of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub business_id: Uuid,
    /// 1-based attempt number within the billing period
    pub attempt_number: u32,
    pub amount_cents: i64,
    pub currency: String,
    pub outcome: AttemptOutcome,
    /// End date of the period this attempt tried to renew
    #[serde(with = "time::serde::rfc3339")]
    pub billing_period_end: OffsetDateTime,
    pub gateway_reference: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Scheduled jobs owned by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobName {
    AutoRenewalRun,
    ExpirationNotifications,
    RetryFailedPayments,
}

impl JobName {
    pub const ALL: [JobName; 3] = [
        JobName::AutoRenewalRun,
        JobName::ExpirationNotifications,
        JobName::RetryFailedPayments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::AutoRenewalRun => "AUTO_RENEWAL_RUN",
            JobName::ExpirationNotifications => "EXPIRATION_NOTIFICATIONS",
            JobName::RetryFailedPayments => "RETRY_FAILED_PAYMENTS",
        }
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobName {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobName::ALL
            .into_iter()
            .find(|job| job.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BillingError::Validation(format!("Unknown job name: {}", s)))
    }
}

/// Cadence and bookkeeping for one scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub job_name: JobName,
    /// Six-field cron expression (seconds first)
    pub schedule: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

impl CronJobConfig {
    pub fn new(job_name: JobName, schedule: impl Into<String>) -> Self {
        Self {
            job_name,
            schedule: schedule.into(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    RetriesExhausted,
    TerminalDecline,
    SystemicFailureRate,
    SchedulerFailure,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::RetriesExhausted => "RETRIES_EXHAUSTED",
            AlertType::TerminalDecline => "TERMINAL_DECLINE",
            AlertType::SystemicFailureRate => "SYSTEMIC_FAILURE_RATE",
            AlertType::SchedulerFailure => "SCHEDULER_FAILURE",
        }
    }
}

impl FromStr for AlertType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            AlertType::RetriesExhausted,
            AlertType::TerminalDecline,
            AlertType::SystemicFailureRate,
            AlertType::SchedulerFailure,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| BillingError::Validation(format!("Unknown alert type: {}", s)))
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// One subscription needs attention
    High,
    /// Failure pattern across many subscriptions, likely an outage
    Systemic,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::High => "HIGH",
            AlertSeverity::Systemic => "SYSTEMIC",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(AlertSeverity::High),
            "SYSTEMIC" => Ok(AlertSeverity::Systemic),
            _ => Err(BillingError::Validation(format!("Unknown alert severity: {}", s))),
        }
    }
}

/// Operational alert, read-only once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub related_subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        related_subscription_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            message: message.into(),
            related_subscription_id,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
