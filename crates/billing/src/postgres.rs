//! Postgres-backed [`RenewalStore`]
//!
//! Expects the following tables (managed by the migration collaborator):
//! `subscriptions`, `plans`, `renewal_attempts` (append-only),
//! `renewal_alerts` and `cron_job_configs`. Enum columns are TEXT holding the
//! SCREAMING_SNAKE_CASE names from [`crate::models`].

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Alert, AttemptOutcome, CronJobConfig, JobName, Plan, RenewalAttempt, Subscription,
    SubscriptionStatus,
};
use crate::store::{LogFilter, Page, PageRequest, RenewalStore, ScanCursor};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, business_id, plan_id, status, start_date, end_date, auto_renew,
    retry_count, last_attempt_at, next_retry_at, payment_method
"#;

const ATTEMPT_COLUMNS: &str = r#"
    id, subscription_id, business_id, attempt_number, amount_cents, currency,
    outcome, billing_period_end, gateway_reference, error_message, duration_ms,
    created_at
"#;

/// Shared WHERE clause for attempt filters, parameters $1..$5
const ATTEMPT_FILTER: &str = r#"
    WHERE ($1::timestamptz IS NULL OR created_at >= $1)
      AND ($2::timestamptz IS NULL OR created_at <= $2)
      AND ($3::text IS NULL OR outcome = $3)
      AND ($4::uuid IS NULL OR business_id = $4)
      AND ($5::uuid IS NULL OR subscription_id = $5)
"#;

/// Counters are INTEGER columns; a negative value means a corrupt row
fn unsigned_u32(id: Uuid, column: &str, value: i32) -> BillingResult<u32> {
    u32::try_from(value)
        .map_err(|_| BillingError::Database(format!("row {id} has negative {column} {value}")))
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    business_id: Uuid,
    plan_id: Uuid,
    status: String,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    auto_renew: bool,
    retry_count: i32,
    last_attempt_at: Option<OffsetDateTime>,
    next_retry_at: Option<OffsetDateTime>,
    payment_method: Option<String>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            business_id: row.business_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            auto_renew: row.auto_renew,
            retry_count: unsigned_u32(row.id, "retry_count", row.retry_count)?,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            payment_method: row.payment_method,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price_cents: i64,
    currency: String,
    duration_days: i32,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let duration_days = u32::try_from(row.duration_days).map_err(|_| {
            BillingError::Database(format!(
                "plan {} has negative duration {}",
                row.id, row.duration_days
            ))
        })?;
        Ok(Plan {
            id: row.id,
            name: row.name,
            price_cents: row.price_cents,
            currency: row.currency,
            duration_days,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    subscription_id: Uuid,
    business_id: Uuid,
    attempt_number: i32,
    amount_cents: i64,
    currency: String,
    outcome: String,
    billing_period_end: OffsetDateTime,
    gateway_reference: Option<String>,
    error_message: Option<String>,
    duration_ms: i64,
    created_at: OffsetDateTime,
}

impl TryFrom<AttemptRow> for RenewalAttempt {
    type Error = BillingError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(RenewalAttempt {
            id: row.id,
            subscription_id: row.subscription_id,
            business_id: row.business_id,
            attempt_number: unsigned_u32(row.id, "attempt_number", row.attempt_number)?,
            amount_cents: row.amount_cents,
            currency: row.currency,
            outcome: row.outcome.parse()?,
            billing_period_end: row.billing_period_end,
            gateway_reference: row.gateway_reference,
            error_message: row.error_message,
            duration_ms: u64::try_from(row.duration_ms).map_err(|_| {
                BillingError::Database(format!(
                    "row {} has negative duration_ms {}",
                    row.id, row.duration_ms
                ))
            })?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    alert_type: String,
    severity: String,
    message: String,
    related_subscription_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<AlertRow> for Alert {
    type Error = BillingError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            id: row.id,
            alert_type: row.alert_type.parse()?,
            severity: row.severity.parse()?,
            message: row.message,
            related_subscription_id: row.related_subscription_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CronRow {
    job_name: String,
    schedule: String,
    enabled: bool,
    last_run_at: Option<OffsetDateTime>,
    next_run_at: Option<OffsetDateTime>,
}

impl TryFrom<CronRow> for CronJobConfig {
    type Error = BillingError;

    fn try_from(row: CronRow) -> Result<Self, Self::Error> {
        Ok(CronJobConfig {
            job_name: row.job_name.parse()?,
            schedule: row.schedule,
            enabled: row.enabled,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Postgres store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run a subscription scan whose SQL takes `bounds` as the leading
    /// parameters, followed by the keyset cursor and the limit
    async fn fetch_subscriptions(
        &self,
        sql: &str,
        bounds: &[OffsetDateTime],
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        let mut query = sqlx::query_as::<_, SubscriptionRow>(sql);
        for bound in bounds {
            query = query.bind(*bound);
        }
        let rows = query
            .bind(after.map(|c| c.end_date))
            .bind(after.map(|c| c.id))
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl RenewalStore for PgStore {
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_subscription_for_business(
        &self,
        business_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE business_id = $1
              AND status NOT IN ('EXPIRED', 'CANCELLED')
            ORDER BY end_date DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        save_subscription(&self.pool, subscription).await
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, price_cents, currency, duration_days FROM plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn renewal_candidates(
        &self,
        now: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE auto_renew = true
              AND status IN ('ACTIVE', 'GRACE')
              AND end_date <= $2
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND ($3::timestamptz IS NULL OR (end_date, id) > ($3, $4))
            ORDER BY end_date ASC, id ASC
            LIMIT $5
            "#,
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_subscriptions(&sql, &[now, cutoff], after, limit).await
    }

    async fn expiring_subscriptions(
        &self,
        from: OffsetDateTime,
        cutoff: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('TRIAL', 'ACTIVE', 'GRACE')
              AND end_date >= $1
              AND end_date <= $2
              AND ($3::timestamptz IS NULL OR (end_date, id) > ($3, $4))
            ORDER BY end_date ASC, id ASC
            LIMIT $5
            "#,
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_subscriptions(&sql, &[from, cutoff], after, limit)
            .await
    }

    async fn retry_due(
        &self,
        now: OffsetDateTime,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE auto_renew = true
              AND status IN ('ACTIVE', 'GRACE')
              AND retry_count > 0
              AND next_retry_at <= $1
              AND ($2::timestamptz IS NULL OR (end_date, id) > ($2, $3))
            ORDER BY end_date ASC, id ASC
            LIMIT $4
            "#,
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_subscriptions(&sql, &[now], after, limit).await
    }

    async fn count_by_status(&self) -> BillingResult<HashMap<SubscriptionStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM subscriptions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, u64::try_from(count).unwrap_or(0))))
            .collect()
    }

    async fn commit_attempt(
        &self,
        attempt: &RenewalAttempt,
        subscription: Option<&Subscription>,
        alert: Option<&Alert>,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO renewal_attempts ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt.id)
        .bind(attempt.subscription_id)
        .bind(attempt.business_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(attempt.amount_cents)
        .bind(&attempt.currency)
        .bind(attempt.outcome.as_str())
        .bind(attempt.billing_period_end)
        .bind(&attempt.gateway_reference)
        .bind(&attempt.error_message)
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(attempt.created_at)
        .execute(&mut *tx)
        .await?;

        if let Some(sub) = subscription {
            save_subscription(&mut *tx, sub).await?;
        }

        if let Some(alert) = alert {
            insert_alert(&mut *tx, alert).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn has_approved_attempt(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM renewal_attempts
                WHERE subscription_id = $1
                  AND billing_period_end = $2
                  AND outcome = 'APPROVED'
            )
            "#,
        )
        .bind(subscription_id)
        .bind(billing_period_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn count_attempts_for_period(
        &self,
        subscription_id: Uuid,
        billing_period_end: OffsetDateTime,
    ) -> BillingResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM renewal_attempts
            WHERE subscription_id = $1 AND billing_period_end = $2
            "#,
        )
        .bind(subscription_id)
        .bind(billing_period_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_attempts(
        &self,
        filter: &LogFilter,
        page: PageRequest,
    ) -> BillingResult<Page<RenewalAttempt>> {
        let outcome = filter.outcome.map(|o| o.as_str());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM renewal_attempts {}",
            ATTEMPT_FILTER
        ))
        .bind(filter.from)
        .bind(filter.to)
        .bind(outcome)
        .bind(filter.business_id)
        .bind(filter.subscription_id)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM renewal_attempts
            {}
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#,
            ATTEMPT_COLUMNS, ATTEMPT_FILTER
        ))
        .bind(filter.from)
        .bind(filter.to)
        .bind(outcome)
        .bind(filter.business_id)
        .bind(filter.subscription_id)
        .bind(i64::from(page.per_page))
        .bind(to_i64(page.offset()))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: convert_all(rows)?,
            total: u64::try_from(total).unwrap_or(0),
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn count_attempts_by_outcome(
        &self,
        filter: &LogFilter,
    ) -> BillingResult<HashMap<AttemptOutcome, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT outcome, COUNT(*) FROM renewal_attempts {} GROUP BY outcome",
            ATTEMPT_FILTER
        ))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.outcome.map(|o| o.as_str()))
        .bind(filter.business_id)
        .bind(filter.subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(outcome, count)| Ok((outcome.parse()?, u64::try_from(count).unwrap_or(0))))
            .collect()
    }

    async fn insert_alert(&self, alert: &Alert) -> BillingResult<()> {
        insert_alert(&self.pool, alert).await
    }

    async fn list_alerts(&self, page: PageRequest) -> BillingResult<Page<Alert>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM renewal_alerts")
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, alert_type, severity, message, related_subscription_id, created_at
            FROM renewal_alerts
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(page.per_page))
        .bind(to_i64(page.offset()))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: convert_all(rows)?,
            total: u64::try_from(total).unwrap_or(0),
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn get_cron_config(&self, job: JobName) -> BillingResult<Option<CronJobConfig>> {
        let row: Option<CronRow> = sqlx::query_as(
            r#"
            SELECT job_name, schedule, enabled, last_run_at, next_run_at
            FROM cron_job_configs
            WHERE job_name = $1
            "#,
        )
        .bind(job.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(CronJobConfig::try_from).transpose()
    }

    async fn list_cron_configs(&self) -> BillingResult<Vec<CronJobConfig>> {
        let rows: Vec<CronRow> = sqlx::query_as(
            r#"
            SELECT job_name, schedule, enabled, last_run_at, next_run_at
            FROM cron_job_configs
            ORDER BY job_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn save_cron_config(&self, config: &CronJobConfig) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_job_configs (job_name, schedule, enabled, last_run_at, next_run_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_name) DO UPDATE
            SET schedule = EXCLUDED.schedule,
                enabled = EXCLUDED.enabled,
                last_run_at = EXCLUDED.last_run_at,
                next_run_at = EXCLUDED.next_run_at
            "#,
        )
        .bind(config.job_name.as_str())
        .bind(&config.schedule)
        .bind(config.enabled)
        .bind(config.last_run_at)
        .bind(config.next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn save_subscription<'e, E>(executor: E, sub: &Subscription) -> BillingResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(&format!(
        r#"
        INSERT INTO subscriptions ({})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            start_date = EXCLUDED.start_date,
            end_date = EXCLUDED.end_date,
            auto_renew = EXCLUDED.auto_renew,
            retry_count = EXCLUDED.retry_count,
            last_attempt_at = EXCLUDED.last_attempt_at,
            next_retry_at = EXCLUDED.next_retry_at,
            payment_method = EXCLUDED.payment_method,
            updated_at = NOW()
        "#,
        SUBSCRIPTION_COLUMNS
    ))
    .bind(sub.id)
    .bind(sub.business_id)
    .bind(sub.plan_id)
    .bind(sub.status.as_str())
    .bind(sub.start_date)
    .bind(sub.end_date)
    .bind(sub.auto_renew)
    .bind(i32::try_from(sub.retry_count).unwrap_or(i32::MAX))
    .bind(sub.last_attempt_at)
    .bind(sub.next_retry_at)
    .bind(&sub.payment_method)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_alert<'e, E>(executor: E, alert: &Alert) -> BillingResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO renewal_alerts (id, alert_type, severity, message, related_subscription_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(alert.id)
    .bind(alert.alert_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.message)
    .bind(alert.related_subscription_id)
    .bind(alert.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription_row() -> SubscriptionRow {
        let now = OffsetDateTime::now_utc();
        SubscriptionRow {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: "GRACE".into(),
            start_date: now - time::Duration::days(30),
            end_date: now,
            auto_renew: true,
            retry_count: 2,
            last_attempt_at: Some(now),
            next_retry_at: None,
            payment_method: Some("pm_card".into()),
        }
    }

    fn attempt_row() -> AttemptRow {
        let now = OffsetDateTime::now_utc();
        AttemptRow {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            attempt_number: 1,
            amount_cents: 4900,
            currency: "USD".into(),
            outcome: "FAILED_TERMINAL".into(),
            billing_period_end: now,
            gateway_reference: None,
            error_message: Some("card_declined".into()),
            duration_ms: 120,
            created_at: now,
        }
    }

    #[test]
    fn test_subscription_row_converts() {
        let row = subscription_row();
        let id = row.id;
        let sub = Subscription::try_from(row).unwrap();
        assert_eq!(sub.id, id);
        assert_eq!(sub.status, SubscriptionStatus::Grace);
        assert_eq!(sub.retry_count, 2);
    }

    #[test]
    fn test_subscription_row_rejects_negative_retry_count() {
        let row = SubscriptionRow {
            retry_count: -1,
            ..subscription_row()
        };
        assert!(matches!(
            Subscription::try_from(row),
            Err(BillingError::Database(msg)) if msg.contains("retry_count")
        ));
    }

    #[test]
    fn test_subscription_row_rejects_unknown_status() {
        let row = SubscriptionRow {
            status: "PAUSED".into(),
            ..subscription_row()
        };
        assert!(Subscription::try_from(row).is_err());
    }

    #[test]
    fn test_plan_row_rejects_negative_duration() {
        let row = PlanRow {
            id: Uuid::new_v4(),
            name: "Pro".into(),
            price_cents: 4900,
            currency: "USD".into(),
            duration_days: -30,
        };
        assert!(matches!(Plan::try_from(row), Err(BillingError::Database(_))));
    }

    #[test]
    fn test_attempt_row_converts() {
        let attempt = RenewalAttempt::try_from(attempt_row()).unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::FailedTerminal);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.duration_ms, 120);
    }

    #[test]
    fn test_attempt_row_rejects_out_of_range_counters() {
        let row = AttemptRow {
            attempt_number: -3,
            ..attempt_row()
        };
        assert!(matches!(
            RenewalAttempt::try_from(row),
            Err(BillingError::Database(msg)) if msg.contains("attempt_number")
        ));

        let row = AttemptRow {
            duration_ms: -1,
            ..attempt_row()
        };
        assert!(matches!(
            RenewalAttempt::try_from(row),
            Err(BillingError::Database(msg)) if msg.contains("duration_ms")
        ));
    }

    #[test]
    fn test_attempt_row_rejects_unknown_outcome() {
        let row = AttemptRow {
            outcome: "REFUNDED".into(),
            ..attempt_row()
        };
        assert!(RenewalAttempt::try_from(row).is_err());
    }

    #[test]
    fn test_alert_row_parses_enums() {
        let row = AlertRow {
            id: Uuid::new_v4(),
            alert_type: "BOGUS".into(),
            severity: "HIGH".into(),
            message: "x".into(),
            related_subscription_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(Alert::try_from(row).is_err());
    }

    #[test]
    fn test_cron_row_parses_job_name() {
        let row = CronRow {
            job_name: "AUTO_RENEWAL_RUN".into(),
            schedule: "0 0 * * * *".into(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        };
        let config = CronJobConfig::try_from(row).unwrap();
        assert_eq!(config.job_name, JobName::AutoRenewalRun);

        let row = CronRow {
            job_name: "NIGHTLY_CLEANUP".into(),
            schedule: "0 0 * * * *".into(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        };
        assert!(CronJobConfig::try_from(row).is_err());
    }
}
