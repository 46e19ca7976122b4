use super::{
    EntitlementStore, Finalization, FinalizeOutcome, GrantOutcome, ItemCatalog, StoreError,
    StoreResult, TransactionStore,
};
use crate::models::{
    CatalogItem, Enrollment, ItemRef, ItemSummary, MonthlyRevenue, StatusSummary, Transaction,
    TransactionStatus, UserEnrollment,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};

/// Process-local backend. Each write holds the entry's shard lock, which gives
/// the same single-writer guarantees as the Mongo conditional updates.
#[derive(Default)]
pub struct MemoryStore {
    transactions: DashMap<String, Transaction>,
    items: DashMap<String, CatalogItem>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a catalog item. The catalog is owned elsewhere; this
    /// backend is seeded at startup and by tests.
    pub fn upsert_item(&self, item: CatalogItem) {
        self.items.insert(item.id.clone(), item);
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        match self.transactions.entry(tx.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(tx.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.get(id).map(|tx| tx.clone()))
    }

    async fn attach_initiation_response(
        &self,
        id: &str,
        response: serde_json::Value,
    ) -> StoreResult<()> {
        if let Some(mut tx) = self.transactions.get_mut(id) {
            if tx.status == TransactionStatus::Pending {
                tx.initiation_response = Some(response);
                tx.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        update: Finalization,
    ) -> StoreResult<Option<FinalizeOutcome>> {
        let Some(mut tx) = self.transactions.get_mut(id) else {
            return Ok(None);
        };

        if tx.status.is_terminal() {
            return Ok(Some(FinalizeOutcome::AlreadyFinal(tx.clone())));
        }

        tx.status = update.status;
        tx.gateway_transaction_id = update.gateway_transaction_id;
        tx.gateway_response = Some(update.gateway_response);
        tx.updated_at = Utc::now();
        Ok(Some(FinalizeOutcome::Transitioned(tx.clone())))
    }

    async fn mark_entitlement_granted(&self, id: &str) -> StoreResult<()> {
        if let Some(mut tx) = self.transactions.get_mut(id) {
            tx.entitlement_granted = true;
            tx.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_grant_blocked(&self, id: &str, reason: &str) -> StoreResult<()> {
        if let Some(mut tx) = self.transactions.get_mut(id) {
            tx.grant_blocked = Some(reason.to_string());
            tx.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .map(|tx| tx.clone())
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txs)
    }

    async fn list_ungranted_successes(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| {
                tx.status == TransactionStatus::Success
                    && !tx.entitlement_granted
                    && tx.grant_blocked.is_none()
            })
            .map(|tx| tx.clone())
            .collect();
        txs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        txs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(txs)
    }

    async fn list_recent(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self.transactions.iter().map(|tx| tx.clone()).collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        txs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(txs)
    }

    async fn status_summary(&self) -> StoreResult<StatusSummary> {
        let mut summary = StatusSummary::default();
        for tx in self.transactions.iter() {
            match tx.status {
                TransactionStatus::Pending => summary.pending += 1,
                TransactionStatus::Success => {
                    summary.success += 1;
                    summary.revenue += tx.amount;
                }
                TransactionStatus::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    async fn revenue_by_month(&self, since: DateTime<Utc>) -> StoreResult<Vec<MonthlyRevenue>> {
        let mut months: BTreeMap<(i32, u32), (i64, i64)> = BTreeMap::new();
        for tx in self.transactions.iter() {
            if tx.status != TransactionStatus::Success || tx.created_at < since {
                continue;
            }
            let entry = months
                .entry((tx.created_at.year(), tx.created_at.month()))
                .or_default();
            entry.0 += tx.amount;
            entry.1 += 1;
        }
        Ok(months
            .into_iter()
            .map(|((year, month), (revenue, count))| MonthlyRevenue {
                year,
                month,
                revenue,
                count,
            })
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ItemCatalog for MemoryStore {
    async fn get_item(&self, item_id: &str) -> StoreResult<Option<CatalogItem>> {
        Ok(self.items.get(item_id).map(|item| item.clone()))
    }

    async fn item_refs(&self, ids: &[String]) -> StoreResult<HashMap<String, ItemRef>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.items.get(id).map(|item| (id.clone(), item.item_ref())))
            .collect())
    }

    async fn count_items(&self) -> StoreResult<i64> {
        Ok(self.items.len() as i64)
    }

    async fn top_items(&self, limit: i64) -> StoreResult<Vec<ItemSummary>> {
        let mut summaries: Vec<ItemSummary> = self
            .items
            .iter()
            .map(|item| ItemSummary {
                id: item.id.clone(),
                kind: item.kind,
                title: item.title.clone(),
                total_enrollments: item.total_enrollments,
            })
            .collect();
        summaries.sort_by(|a, b| b.total_enrollments.cmp(&a.total_enrollments));
        summaries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(summaries)
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn has_entitlement(&self, user_id: &str, item_id: &str) -> StoreResult<bool> {
        Ok(self
            .items
            .get(item_id)
            .is_some_and(|item| item.enrollment_for(user_id).is_some()))
    }

    async fn grant(
        &self,
        user_id: &str,
        item_id: &str,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<GrantOutcome> {
        let Some(mut item) = self.items.get_mut(item_id) else {
            return Ok(GrantOutcome::ItemMissing);
        };

        if item.enrollment_for(user_id).is_some() {
            return Ok(GrantOutcome::AlreadyPresent);
        }

        item.enrolled_users.push(Enrollment {
            user_id: user_id.to_string(),
            enrolled_at,
            progress: 0,
        });
        item.total_enrollments += 1;
        Ok(GrantOutcome::Granted)
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<UserEnrollment>> {
        let mut enrollments: Vec<UserEnrollment> = self
            .items
            .iter()
            .filter_map(|item| {
                item.enrollment_for(user_id).map(|e| UserEnrollment {
                    item: item.item_ref(),
                    enrolled_at: e.enrolled_at,
                    progress: e.progress,
                })
            })
            .collect();
        enrollments.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        Ok(enrollments)
    }

    async fn update_progress(
        &self,
        user_id: &str,
        item_id: &str,
        progress: i32,
    ) -> StoreResult<bool> {
        let Some(mut item) = self.items.get_mut(item_id) else {
            return Ok(false);
        };
        match item.enrolled_users.iter_mut().find(|e| e.user_id == user_id) {
            Some(enrollment) => {
                enrollment.progress = progress;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn total_enrollments(&self) -> StoreResult<i64> {
        Ok(self.items.iter().map(|item| item.total_enrollments).sum())
    }
}
