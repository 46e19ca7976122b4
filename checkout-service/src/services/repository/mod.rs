//! Storage ports for transactions, the item catalog and entitlements.
//!
//! Both backends enforce the two write-side guarantees the payment flow relies
//! on: a transaction leaves PENDING at most once ([`TransactionStore::finalize`])
//! and a (user, item) entitlement is inserted at most once
//! ([`EntitlementStore::grant`]).

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::models::{
    CatalogItem, ItemRef, ItemSummary, MonthlyRevenue, StatusSummary, Transaction,
    TransactionStatus, UserEnrollment,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Duplicate transaction id: {0}")]
    Duplicate(String),
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<mongodb::bson::document::ValueAccessError> for StoreError {
    fn from(err: mongodb::bson::document::ValueAccessError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for service_core::error::AppError {
    fn from(err: StoreError) -> Self {
        service_core::error::AppError::DatabaseError(anyhow::Error::new(err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Terminal write for a transaction.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// This call moved the row out of PENDING.
    Transitioned(Transaction),
    /// The row was already terminal; nothing was written.
    AlreadyFinal(Transaction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    AlreadyPresent,
    ItemMissing,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails when the id is already taken.
    async fn insert(&self, tx: &Transaction) -> StoreResult<()>;

    async fn find(&self, id: &str) -> StoreResult<Option<Transaction>>;

    /// Store the raw pay-request response. Only applies while PENDING.
    async fn attach_initiation_response(
        &self,
        id: &str,
        response: serde_json::Value,
    ) -> StoreResult<()>;

    /// Compare-and-set `PENDING -> status`. `None` when the id is unknown.
    async fn finalize(&self, id: &str, update: Finalization)
        -> StoreResult<Option<FinalizeOutcome>>;

    async fn mark_entitlement_granted(&self, id: &str) -> StoreResult<()>;

    /// Record why the grant for a SUCCESS row cannot complete.
    async fn mark_grant_blocked(&self, id: &str, reason: &str) -> StoreResult<()>;

    /// Newest first.
    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Transaction>>;

    /// SUCCESS transactions whose entitlement grant has not been recorded and
    /// is not blocked, oldest update first.
    async fn list_ungranted_successes(&self, limit: i64) -> StoreResult<Vec<Transaction>>;

    async fn list_recent(&self, limit: i64) -> StoreResult<Vec<Transaction>>;

    async fn status_summary(&self) -> StoreResult<StatusSummary>;

    /// SUCCESS revenue grouped by calendar month, oldest first.
    async fn revenue_by_month(&self, since: DateTime<Utc>) -> StoreResult<Vec<MonthlyRevenue>>;

    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn get_item(&self, item_id: &str) -> StoreResult<Option<CatalogItem>>;

    async fn item_refs(&self, ids: &[String]) -> StoreResult<HashMap<String, ItemRef>>;

    async fn count_items(&self) -> StoreResult<i64>;

    /// Ordered by enrollment count, descending.
    async fn top_items(&self, limit: i64) -> StoreResult<Vec<ItemSummary>>;
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn has_entitlement(&self, user_id: &str, item_id: &str) -> StoreResult<bool>;

    /// Insert the (user, item) enrollment and bump the item's counter in one
    /// atomic write; a second grant for the same pair changes nothing.
    async fn grant(
        &self,
        user_id: &str,
        item_id: &str,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<GrantOutcome>;

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<UserEnrollment>>;

    /// Returns false when the user holds no entitlement for the item.
    async fn update_progress(&self, user_id: &str, item_id: &str, progress: i32)
        -> StoreResult<bool>;

    async fn total_enrollments(&self) -> StoreResult<i64>;
}
