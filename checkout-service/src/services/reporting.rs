//! Read-side aggregates for the admin back-office and the user dashboard.

use crate::error::PaymentError;
use crate::models::{ItemKind, TransactionStatus};
use crate::services::repository::{EntitlementStore, ItemCatalog, TransactionStore};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;

const TOP_ITEMS: i64 = 5;
const RECENT_TRANSACTIONS: i64 = 20;
const REVENUE_MONTHS: u32 = 12;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    /// Minor units.
    pub total_revenue: i64,
    pub transactions: StatusCounts,
    pub total_items: i64,
    pub total_enrollments: i64,
    pub top_items: Vec<TopItem>,
    pub recent_transactions: Vec<RecentTransaction>,
    pub revenue_by_month: Vec<MonthRevenue>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopItem {
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub total_enrollments: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTransaction {
    pub merchant_transaction_id: String,
    pub user_id: String,
    pub user_email: String,
    pub item_id: String,
    pub amount: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonthRevenue {
    /// `YYYY-MM`
    pub month: String,
    pub revenue: i64,
    pub count: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDashboard {
    pub enrolled_count: usize,
    pub completed_count: usize,
    pub average_progress: i32,
    /// Sum of the user's SUCCESS transactions, minor units.
    pub total_spent: i64,
}

pub struct Reporting {
    transactions: Arc<dyn TransactionStore>,
    catalog: Arc<dyn ItemCatalog>,
    entitlements: Arc<dyn EntitlementStore>,
}

impl Reporting {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        catalog: Arc<dyn ItemCatalog>,
        entitlements: Arc<dyn EntitlementStore>,
    ) -> Self {
        Self {
            transactions,
            catalog,
            entitlements,
        }
    }

    pub async fn analytics(&self, now: DateTime<Utc>) -> Result<Analytics, PaymentError> {
        let summary = self.transactions.status_summary().await?;
        let total_items = self.catalog.count_items().await?;
        let total_enrollments = self.entitlements.total_enrollments().await?;

        let top_items = self
            .catalog
            .top_items(TOP_ITEMS)
            .await?
            .into_iter()
            .map(|item| TopItem {
                id: item.id,
                kind: item.kind,
                title: item.title,
                total_enrollments: item.total_enrollments,
            })
            .collect();

        let recent_transactions = self
            .transactions
            .list_recent(RECENT_TRANSACTIONS)
            .await?
            .into_iter()
            .map(|tx| RecentTransaction {
                merchant_transaction_id: tx.id,
                user_id: tx.user_id,
                user_email: tx.user_email,
                item_id: tx.item_id,
                amount: tx.amount,
                status: tx.status,
                created_at: tx.created_at,
            })
            .collect();

        let revenue_by_month = self
            .transactions
            .revenue_by_month(revenue_window_start(now))
            .await?
            .into_iter()
            .map(|m| MonthRevenue {
                month: format!("{:04}-{:02}", m.year, m.month),
                revenue: m.revenue,
                count: m.count,
            })
            .collect();

        Ok(Analytics {
            total_revenue: summary.revenue,
            transactions: StatusCounts {
                pending: summary.pending,
                success: summary.success,
                failed: summary.failed,
            },
            total_items,
            total_enrollments,
            top_items,
            recent_transactions,
            revenue_by_month,
        })
    }

    pub async fn dashboard(&self, user_id: &str) -> Result<UserDashboard, PaymentError> {
        let enrollments = self.entitlements.list_for_user(user_id).await?;
        let total_spent = self
            .transactions
            .list_for_user(user_id)
            .await?
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Success)
            .map(|tx| tx.amount)
            .sum();

        let completed_count = enrollments.iter().filter(|e| e.progress >= 100).count();
        let average_progress = if enrollments.is_empty() {
            0
        } else {
            let sum: i64 = enrollments.iter().map(|e| i64::from(e.progress)).sum();
            (sum as f64 / enrollments.len() as f64).round() as i32
        };

        Ok(UserDashboard {
            enrolled_count: enrollments.len(),
            completed_count,
            average_progress,
            total_spent,
        })
    }
}

/// First instant of the month `REVENUE_MONTHS - 1` months before `now`.
fn revenue_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let months_back = REVENUE_MONTHS as i32 - 1;
    let total = now.year() * 12 + now.month0() as i32 - months_back;
    let (year, month) = (total.div_euclid(12), total.rem_euclid(12) as u32 + 1);

    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| now - Duration::days(365))
}
