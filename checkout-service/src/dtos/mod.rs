use crate::models::{ItemKind, ItemRef, TransactionStatus, UserEnrollment};
use crate::services::payments::{PaymentIntent, PaymentRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[serde(alias = "courseId")]
    #[validate(length(max = 128))]
    pub item_id: Option<String>,
    /// Minor units (paise).
    pub amount: Option<i64>,
    #[validate(email)]
    pub user_email: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    #[validate(length(max = 120))]
    pub user_name: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    #[validate(length(min = 10, max = 15))]
    pub user_phone: Option<String>,
}

/// Checkout forms post empty strings for untouched optional fields.
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

impl From<InitiatePaymentRequest> for PaymentIntent {
    fn from(req: InitiatePaymentRequest) -> Self {
        Self {
            item_id: req.item_id,
            amount: req.amount,
            user_email: req.user_email,
            user_name: req.user_name,
            user_phone: req.user_phone,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub success: bool,
    pub payment_url: String,
    pub merchant_transaction_id: String,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub status: TransactionStatus,
    pub payment: PaymentView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub slug: String,
}

impl From<ItemRef> for ItemView {
    fn from(item: ItemRef) -> Self {
        Self {
            id: item.id,
            kind: item.kind,
            title: item.title,
            slug: item.slug,
        }
    }
}

/// A transaction as shown to its owner. Audit payloads are not exposed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub merchant_transaction_id: String,
    pub status: TransactionStatus,
    /// True when a stale PENDING is being shown as FAILED.
    pub expired: bool,
    pub item_id: String,
    pub item: Option<ItemView>,
    pub amount: i64,
    pub currency: String,
    pub user_email: String,
    pub gateway_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentRecord> for PaymentView {
    fn from(record: PaymentRecord) -> Self {
        let tx = record.transaction;
        Self {
            merchant_transaction_id: tx.id,
            status: record.status,
            expired: record.expired,
            item_id: tx.item_id,
            item: record.item.map(ItemView::from),
            amount: tx.amount,
            currency: tx.currency,
            user_email: tx.user_email,
            gateway_transaction_id: tx.gateway_transaction_id,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentView {
    pub item: ItemView,
    pub enrolled_at: DateTime<Utc>,
    pub progress: i32,
}

impl From<UserEnrollment> for EnrollmentView {
    fn from(e: UserEnrollment) -> Self {
        Self {
            item: e.item.into(),
            enrolled_at: e.enrolled_at,
            progress: e.progress,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResponse {
    pub has_access: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ProgressRequest {
    #[validate(range(min = 0, max = 100))]
    pub progress: i32,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub success: bool,
    pub progress: i32,
}
