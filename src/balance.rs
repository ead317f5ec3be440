use axum::http::StatusCode;
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::UsageLimits;
use crate::error::HttpFailure;
use crate::models::{GenerationStatus, SourceType};
use crate::state::{HistoryRecord, InMemoryDb, User};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("User {0} not found.")]
    UnknownUser(String),
    #[error("Insufficient credits to start generation.")]
    Insufficient { required: i64, available: i64 },
}

impl HttpFailure for BalanceError {
    fn status(&self) -> StatusCode {
        match self {
            BalanceError::UnknownUser(_) => StatusCode::NOT_FOUND,
            BalanceError::Insufficient { .. } => StatusCode::PAYMENT_REQUIRED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            BalanceError::UnknownUser(_) => "NOT_FOUND",
            BalanceError::Insufficient { .. } => "INSUFFICIENT_CREDITS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub external_user_id: String,
    pub session_id: String,
    pub status: GenerationStatus,
    pub source_type: SourceType,
    pub question_count: u32,
    pub cost: i64,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMeter {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub used: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceInfoResponse {
    pub current_credits: i64,
    pub total_credits_in_period: i64,
    pub period_start_date: DateTime<Utc>,
    pub period_end_date: DateTime<Utc>,
    pub usage_meters: Vec<UsageMeter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub date: DateTime<Utc>,
    pub status: GenerationStatus,
    pub source_type: SourceType,
    pub question_count: u32,
    pub cost: i64,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub current_page: u32,
    pub total_pages: u32,
    pub page_size: u32,
    pub total_items: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryItem>,
    pub pagination: PaginationInfo,
}

/// First day of the month containing `now` and the last day of that month,
/// both at midnight UTC.
pub fn current_period(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let first = today.with_day(1).unwrap_or(today);
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(first);
    (midnight(first), midnight(last))
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

impl InMemoryDb {
    /// Checks and decrements under one write lock so concurrent starts
    /// cannot overdraw the balance.
    pub async fn debit(&self, external_id: &str, amount: i64) -> Result<i64, BalanceError> {
        let remaining = {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(external_id)
                .ok_or_else(|| BalanceError::UnknownUser(external_id.to_string()))?;
            if user.balance < amount {
                return Err(BalanceError::Insufficient { required: amount, available: user.balance });
            }
            user.balance -= amount;
            user.balance
        };
        info!(user = %external_id, amount, remaining, "credits debited");
        self.persist_or_warn("debit").await;
        Ok(remaining)
    }

    pub async fn credit(&self, external_id: &str, amount: i64) -> Result<i64, BalanceError> {
        let balance = {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(external_id)
                .ok_or_else(|| BalanceError::UnknownUser(external_id.to_string()))?;
            user.balance += amount;
            user.balance
        };
        info!(user = %external_id, amount, balance, "credits refunded");
        self.persist_or_warn("credit").await;
        Ok(balance)
    }

    pub async fn record_history(&self, record: NewHistoryRecord) -> HistoryRecord {
        let entry = HistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: record.external_user_id,
            session_id: record.session_id,
            date: Utc::now(),
            status: record.status,
            source_type: record.source_type,
            question_count: record.question_count,
            cost: record.cost,
            outcome: record.outcome,
        };
        self.history.write().await.push(entry.clone());
        self.persist_or_warn("record_history").await;
        entry
    }

    /// Newest first. `page` is 1-based.
    pub async fn history_page(&self, external_id: &str, page: u32, limit: u32) -> HistoryResponse {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let history = self.history.read().await;
        let mine: Vec<&HistoryRecord> = history.iter().rev().filter(|h| h.user_id == external_id).collect();
        let total_items = mine.len() as u32;
        let total_pages = total_items.div_ceil(limit);
        let skip = ((page - 1) as usize).saturating_mul(limit as usize);
        let items = mine
            .into_iter()
            .skip(skip)
            .take(limit as usize)
            .map(|h| HistoryItem {
                id: h.id.clone(),
                date: h.date,
                status: h.status,
                source_type: h.source_type,
                question_count: h.question_count,
                cost: h.cost,
                outcome: h.outcome.clone(),
            })
            .collect();
        HistoryResponse {
            history: items,
            pagination: PaginationInfo {
                current_page: page,
                total_pages,
                page_size: limit,
                total_items,
            },
        }
    }

    pub async fn usage_meters(&self, user: &User, limits: UsageLimits, now: DateTime<Utc>) -> Vec<UsageMeter> {
        let (period_start, _) = current_period(now);
        let since = match user.usage_reset_at {
            Some(reset) if reset > period_start => reset,
            _ => period_start,
        };
        let history = self.history.read().await;
        SourceType::ALL
            .iter()
            .map(|source| {
                let used = history
                    .iter()
                    .filter(|h| h.user_id == user.external_id && h.source_type == *source && h.date >= since)
                    .count() as u32;
                let limit = match source {
                    SourceType::Text => limits.text,
                    SourceType::Image => limits.image,
                    SourceType::Pdf => limits.pdf,
                };
                UsageMeter { source_type: *source, used, limit }
            })
            .collect()
    }

    pub async fn reset_usage(&self, external_id: &str) -> Result<(), BalanceError> {
        {
            let mut users = self.users.write().await;
            let user = users
                .get_mut(external_id)
                .ok_or_else(|| BalanceError::UnknownUser(external_id.to_string()))?;
            user.usage_reset_at = Some(Utc::now());
        }
        info!(user = %external_id, "monthly usage reset");
        self.persist_or_warn("reset_usage").await;
        Ok(())
    }
}

pub async fn balance_info(db: &InMemoryDb, user: &User, period_credits: i64, limits: UsageLimits) -> BalanceInfoResponse {
    let now = Utc::now();
    let (period_start_date, period_end_date) = current_period(now);
    BalanceInfoResponse {
        current_credits: user.balance,
        total_credits_in_period: period_credits,
        period_start_date,
        period_end_date,
        usage_meters: db.usage_meters(user, limits, now).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limits() -> UsageLimits {
        UsageLimits { text: 50, image: 20, pdf: 10 }
    }

    fn record(user: &str, source_type: SourceType) -> NewHistoryRecord {
        NewHistoryRecord {
            external_user_id: user.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            status: GenerationStatus::Completed,
            source_type,
            question_count: 3,
            cost: 9,
            outcome: "3 questions generated successfully.".into(),
        }
    }

    #[test]
    fn period_spans_the_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 2, 17, 13, 5, 0).unwrap();
        let (start, end) = current_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());

        let december = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let (_, end) = current_period(december);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn debit_refuses_overdraw_and_credit_restores() {
        let db = InMemoryDb::new(None);
        db.create_user("user_a", None, 10).await;
        assert_eq!(db.debit("user_a", 7).await, Ok(3));
        assert_eq!(
            db.debit("user_a", 4).await,
            Err(BalanceError::Insufficient { required: 4, available: 3 })
        );
        assert_eq!(db.credit("user_a", 7).await, Ok(10));
        assert!(matches!(db.debit("ghost", 1).await, Err(BalanceError::UnknownUser(_))));
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let db = std::sync::Arc::new(InMemoryDb::new(None));
        db.create_user("user_a", None, 10).await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move { db.debit("user_a", 3).await.is_ok() }));
        }
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(db.find_user("user_a").await.unwrap().balance, 1);
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let db = InMemoryDb::new(None);
        for i in 0..5u32 {
            let mut r = record("user_a", SourceType::Text);
            r.question_count = i;
            db.record_history(r).await;
        }
        db.record_history(record("user_b", SourceType::Pdf)).await;

        let page1 = db.history_page("user_a", 1, 2).await;
        assert_eq!(page1.pagination.total_items, 5);
        assert_eq!(page1.pagination.total_pages, 3);
        assert_eq!(page1.history.iter().map(|h| h.question_count).collect::<Vec<_>>(), vec![4, 3]);

        let page3 = db.history_page("user_a", 3, 2).await;
        assert_eq!(page3.history.len(), 1);
        assert_eq!(page3.history[0].question_count, 0);

        let empty = db.history_page("nobody", 1, 10).await;
        assert_eq!(empty.pagination.total_pages, 0);
        assert!(empty.history.is_empty());
    }

    #[tokio::test]
    async fn usage_meters_count_since_reset() {
        let db = InMemoryDb::new(None);
        db.create_user("user_a", None, 100).await;
        db.record_history(record("user_a", SourceType::Text)).await;
        db.record_history(record("user_a", SourceType::Pdf)).await;
        db.record_history(record("user_a", SourceType::Pdf)).await;

        let user = db.find_user("user_a").await.unwrap();
        let meters = db.usage_meters(&user, limits(), Utc::now()).await;
        let used: Vec<u32> = meters.iter().map(|m| m.used).collect();
        assert_eq!(used, vec![1, 0, 2]);
        assert_eq!(meters[2].limit, 10);

        db.reset_usage("user_a").await.unwrap();
        let user = db.find_user("user_a").await.unwrap();
        let meters = db.usage_meters(&user, limits(), Utc::now()).await;
        assert!(meters.iter().all(|m| m.used == 0));
        assert_eq!(db.reset_usage("ghost").await, Err(BalanceError::UnknownUser("ghost".into())));
    }
}
