//! Candidate selection
//!
//! Scans are keyset-paginated on `(end_date, id)`, most urgent first, so a
//! tick reads at most `page_size * max_pages` rows no matter how large the
//! table gets.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::RenewalConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::Subscription;
use crate::notify::{NotificationDispatcher, NotificationKind};
use crate::store::{RenewalStore, ScanCursor};

/// Longest look-ahead accepted from callers
pub const MAX_DAYS_AHEAD: u32 = 365;

/// One page of scan results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPage {
    pub items: Vec<Subscription>,
    /// Cursor for the following page, `None` when this page was the last
    pub next: Option<ScanCursor>,
}

impl ScanPage {
    fn from_rows(items: Vec<Subscription>, page_size: usize) -> Self {
        let next = if items.len() >= page_size {
            items.last().map(ScanCursor::after)
        } else {
            None
        };
        Self { items, next }
    }
}

/// Result of an expiration-notice run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NoticeReport {
    pub scanned: usize,
    pub delivered: usize,
}

fn validate_days(days: u32) -> BillingResult<()> {
    if days > MAX_DAYS_AHEAD {
        return Err(BillingError::Validation(format!(
            "days ahead must be at most {}",
            MAX_DAYS_AHEAD
        )));
    }
    Ok(())
}

pub struct ExpirationScanner {
    store: Arc<dyn RenewalStore>,
    notifier: NotificationDispatcher,
    page_size: usize,
    max_pages: usize,
}

impl ExpirationScanner {
    pub fn new(
        store: Arc<dyn RenewalStore>,
        notifier: NotificationDispatcher,
        config: &RenewalConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            page_size: config.page_size.max(1),
            max_pages: config.max_pages_per_tick.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Auto-renewing ACTIVE/GRACE subscriptions ending within `days_ahead`,
    /// leaving out those waiting on a scheduled retry
    pub async fn scan_for_renewal(
        &self,
        days_ahead: u32,
        cursor: Option<ScanCursor>,
    ) -> BillingResult<ScanPage> {
        validate_days(days_ahead)?;
        let now = OffsetDateTime::now_utc();
        let cutoff = now + time::Duration::days(i64::from(days_ahead));
        let rows = self
            .store
            .renewal_candidates(now, cutoff, cursor, self.page_size)
            .await?;
        Ok(ScanPage::from_rows(rows, self.page_size))
    }

    /// Subscriptions whose scheduled retry has come due
    pub async fn scan_retry_due(&self, cursor: Option<ScanCursor>) -> BillingResult<ScanPage> {
        let rows = self
            .store
            .retry_due(OffsetDateTime::now_utc(), cursor, self.page_size)
            .await?;
        Ok(ScanPage::from_rows(rows, self.page_size))
    }

    /// Live subscriptions ending within `days`, regardless of auto-renew
    pub async fn expiring_within(
        &self,
        days: u32,
        cursor: Option<ScanCursor>,
    ) -> BillingResult<ScanPage> {
        validate_days(days)?;
        let now = OffsetDateTime::now_utc();
        let rows = self
            .store
            .expiring_subscriptions(
                now,
                now + time::Duration::days(i64::from(days)),
                cursor,
                self.page_size,
            )
            .await?;
        Ok(ScanPage::from_rows(rows, self.page_size))
    }

    /// Send "expires in N days" notices without touching the orchestrator.
    ///
    /// Covers the one-day slice ending `notice_days` from now, so a daily
    /// run notifies each subscription once.
    pub async fn scan_for_notification_only(&self, notice_days: u32) -> BillingResult<NoticeReport> {
        if notice_days == 0 {
            return Err(BillingError::Validation(
                "notice days must be at least 1".into(),
            ));
        }
        validate_days(notice_days)?;

        let now = OffsetDateTime::now_utc();
        let cutoff = now + time::Duration::days(i64::from(notice_days));
        let from = cutoff - time::Duration::DAY;

        let mut report = NoticeReport::default();
        let mut cursor = None;
        for _ in 0..self.max_pages {
            let rows = self
                .store
                .expiring_subscriptions(from, cutoff, cursor, self.page_size)
                .await?;
            let page = ScanPage::from_rows(rows, self.page_size);

            for sub in &page.items {
                report.scanned += 1;
                let days_remaining = (sub.end_date - now).whole_days().max(0);
                let delivered = self
                    .notifier
                    .dispatch(
                        NotificationKind::ExpirationNotice,
                        sub.business_id,
                        serde_json::json!({
                            "subscription_id": sub.id,
                            "end_date": sub.end_date.unix_timestamp(),
                            "days_remaining": days_remaining,
                            "auto_renew": sub.auto_renew,
                        }),
                    )
                    .await;
                if delivered {
                    report.delivered += 1;
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(report),
            }
        }

        tracing::warn!(
            scanned = report.scanned,
            max_pages = self.max_pages,
            "Expiration notice scan hit the page limit"
        );
        Ok(report)
    }
}
