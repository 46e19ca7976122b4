use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

/// One payment attempt, keyed by the merchant transaction id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: Option<String>,
    pub user_phone: Option<String>,
    pub item_id: String,
    /// Minor currency units (paise).
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    /// Raw pay-request response, kept for audit.
    pub initiation_response: Option<serde_json::Value>,
    /// Raw status-check response, or the verification error, kept for audit.
    pub gateway_response: Option<serde_json::Value>,
    #[serde(default)]
    pub entitlement_granted: bool,
    /// Why a paid grant cannot complete, e.g. `item_missing`. Set rows are
    /// left out of reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_blocked: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new_pending(
        user_id: &str,
        item_id: &str,
        amount: i64,
        currency: &str,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_merchant_transaction_id(now),
            user_id: user_id.to_string(),
            user_email: contact.email,
            user_name: contact.name,
            user_phone: contact.phone,
            item_id: item_id.to_string(),
            amount,
            currency: currency.to_string(),
            status: TransactionStatus::Pending,
            gateway_transaction_id: None,
            initiation_response: None,
            gateway_response: None,
            entitlement_granted: false,
            grant_blocked: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// `TXN_<unix millis>_<8 hex chars>`: sortable by creation time, random tail
/// against same-millisecond collisions.
pub fn generate_merchant_transaction_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("TXN_{}_{:08x}", now.timestamp_millis(), suffix)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Course,
    LiveProgram,
}

/// A purchasable course or live program with its embedded enrollments.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CatalogItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub slug: String,
    pub price: i64,
    pub discounted_price: Option<i64>,
    pub is_published: bool,
    #[serde(default)]
    pub enrolled_users: Vec<Enrollment>,
    #[serde(default)]
    pub total_enrollments: i64,
}

impl CatalogItem {
    pub fn payable_price(&self) -> i64 {
        self.discounted_price.unwrap_or(self.price)
    }

    pub fn enrollment_for(&self, user_id: &str) -> Option<&Enrollment> {
        self.enrolled_users.iter().find(|e| e.user_id == user_id)
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            id: self.id.clone(),
            kind: self.kind,
            title: self.title.clone(),
            slug: self.slug.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Enrollment {
    pub user_id: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub enrolled_at: DateTime<Utc>,
    /// Percentage, 0 to 100.
    #[serde(default)]
    pub progress: i32,
}

/// Display fields of an item, without its enrollment list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    pub slug: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: ItemKind,
    pub title: String,
    #[serde(default)]
    pub total_enrollments: i64,
}

/// An entitlement seen from the user's side.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEnrollment {
    pub item: ItemRef,
    pub enrolled_at: DateTime<Utc>,
    pub progress: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
    /// Sum of SUCCESS amounts, minor units.
    pub revenue: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyRevenue {
    pub year: i32,
    pub month: u32,
    pub revenue: i64,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merchant_transaction_id_format() {
        let now = Utc::now();
        let id = generate_merchant_transaction_id(now);
        let parts: Vec<&str> = id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TXN");
        assert_eq!(parts[1], now.timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_payable_price_prefers_discount() {
        let mut item = CatalogItem {
            id: "course-1".to_string(),
            kind: ItemKind::Course,
            title: "Rust".to_string(),
            slug: "rust".to_string(),
            price: 1999,
            discounted_price: None,
            is_published: true,
            enrolled_users: vec![],
            total_enrollments: 0,
        };
        assert_eq!(item.payable_price(), 1999);

        item.discounted_price = Some(999);
        assert_eq!(item.payable_price(), 999);
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(TransactionStatus::Success).unwrap(),
            serde_json::json!("SUCCESS")
        );
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
    }
}
