use super::{
    EntitlementStore, Finalization, FinalizeOutcome, GrantOutcome, ItemCatalog, StoreError,
    StoreResult, TransactionStore,
};
use crate::models::{
    CatalogItem, ItemRef, ItemSummary, MonthlyRevenue, StatusSummary, Transaction,
    TransactionStatus, UserEnrollment,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteError, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use std::collections::HashMap;

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code, .. })) if *code == DUPLICATE_KEY
    )
}

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    transactions: Collection<Transaction>,
    items: Collection<CatalogItem>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            transactions: db.collection("transactions"),
            items: db.collection("catalog_items"),
        }
    }

    pub async fn init_indexes(&self) -> StoreResult<()> {
        let user_history_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_history_idx".to_string())
                    .build(),
            )
            .build();

        let user_status_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_status_idx".to_string())
                    .build(),
            )
            .build();

        let grant_backlog_index = IndexModel::builder()
            .keys(doc! { "status": 1, "entitlement_granted": 1 })
            .options(
                IndexOptions::builder()
                    .name("grant_backlog_idx".to_string())
                    .build(),
            )
            .build();

        self.transactions
            .create_indexes(
                [user_history_index, user_status_index, grant_backlog_index],
                None,
            )
            .await?;

        let enrolled_user_index = IndexModel::builder()
            .keys(doc! { "enrolled_users.user_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("enrolled_user_idx".to_string())
                    .build(),
            )
            .build();

        let popularity_index = IndexModel::builder()
            .keys(doc! { "total_enrollments": -1 })
            .options(
                IndexOptions::builder()
                    .name("popularity_idx".to_string())
                    .build(),
            )
            .build();

        self.items
            .create_indexes([enrolled_user_index, popularity_index], None)
            .await?;

        tracing::info!("Checkout service indexes initialized");
        Ok(())
    }
}

fn status_bson(status: TransactionStatus) -> Bson {
    Bson::String(status.as_str().to_string())
}

/// `$sum` yields Int32 or Int64 depending on the inputs.
fn number(doc: &Document, key: &str) -> i64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        _ => 0,
    }
}

#[async_trait]
impl TransactionStore for MongoStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        match self.transactions.insert_one(tx, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Duplicate(tx.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.find_one(doc! { "_id": id }, None).await?)
    }

    async fn attach_initiation_response(
        &self,
        id: &str,
        response: serde_json::Value,
    ) -> StoreResult<()> {
        let filter = doc! { "_id": id, "status": status_bson(TransactionStatus::Pending) };
        let update = doc! {
            "$set": {
                "initiation_response": to_bson(&response)?,
                "updated_at": BsonDateTime::now(),
            }
        };
        self.transactions.update_one(filter, update, None).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        update: Finalization,
    ) -> StoreResult<Option<FinalizeOutcome>> {
        let filter = doc! { "_id": id, "status": status_bson(TransactionStatus::Pending) };
        let set = doc! {
            "$set": {
                "status": status_bson(update.status),
                "gateway_transaction_id": to_bson(&update.gateway_transaction_id)?,
                "gateway_response": to_bson(&update.gateway_response)?,
                "updated_at": BsonDateTime::now(),
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        if let Some(tx) = self
            .transactions
            .find_one_and_update(filter, set, options)
            .await?
        {
            return Ok(Some(FinalizeOutcome::Transitioned(tx)));
        }

        Ok(self.find(id).await?.map(FinalizeOutcome::AlreadyFinal))
    }

    async fn mark_entitlement_granted(&self, id: &str) -> StoreResult<()> {
        let update = doc! {
            "$set": { "entitlement_granted": true, "updated_at": BsonDateTime::now() }
        };
        self.transactions
            .update_one(doc! { "_id": id }, update, None)
            .await?;
        Ok(())
    }

    async fn mark_grant_blocked(&self, id: &str, reason: &str) -> StoreResult<()> {
        let update = doc! {
            "$set": { "grant_blocked": reason, "updated_at": BsonDateTime::now() }
        };
        self.transactions
            .update_one(doc! { "_id": id }, update, None)
            .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Transaction>> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();
        let cursor = self
            .transactions
            .find(doc! { "user_id": user_id }, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_ungranted_successes(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let filter = doc! {
            "status": status_bson(TransactionStatus::Success),
            "entitlement_granted": { "$ne": true },
            // Matches rows where the field is absent too.
            "grant_blocked": Bson::Null,
        };
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": 1 })
            .limit(limit)
            .build();
        let cursor = self.transactions.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_recent(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(limit)
            .build();
        let cursor = self.transactions.find(doc! {}, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn status_summary(&self) -> StoreResult<StatusSummary> {
        let pipeline = vec![doc! {
            "$group": {
                "_id": "$status",
                "count": { "$sum": 1 },
                "amount": { "$sum": "$amount" },
            }
        }];

        let mut cursor = self.transactions.aggregate(pipeline, None).await?;
        let mut summary = StatusSummary::default();
        while let Some(row) = cursor.try_next().await? {
            let count = number(&row, "count");
            match row.get_str("_id").unwrap_or_default() {
                "PENDING" => summary.pending = count,
                "SUCCESS" => {
                    summary.success = count;
                    summary.revenue = number(&row, "amount");
                }
                "FAILED" => summary.failed = count,
                _ => {}
            }
        }
        Ok(summary)
    }

    async fn revenue_by_month(&self, since: DateTime<Utc>) -> StoreResult<Vec<MonthlyRevenue>> {
        let pipeline = vec![
            doc! {
                "$match": {
                    "status": status_bson(TransactionStatus::Success),
                    "created_at": { "$gte": BsonDateTime::from_chrono(since) },
                }
            },
            doc! {
                "$group": {
                    "_id": {
                        "year": { "$year": "$created_at" },
                        "month": { "$month": "$created_at" },
                    },
                    "revenue": { "$sum": "$amount" },
                    "count": { "$sum": 1 },
                }
            },
            doc! { "$sort": { "_id.year": 1, "_id.month": 1 } },
        ];

        let mut cursor = self.transactions.aggregate(pipeline, None).await?;
        let mut months = Vec::new();
        while let Some(row) = cursor.try_next().await? {
            let key = row.get_document("_id")?;
            months.push(MonthlyRevenue {
                year: key.get_i32("year")?,
                month: u32::try_from(key.get_i32("month")?).unwrap_or_default(),
                revenue: number(&row, "revenue"),
                count: number(&row, "count"),
            });
        }
        Ok(months)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ItemCatalog for MongoStore {
    async fn get_item(&self, item_id: &str) -> StoreResult<Option<CatalogItem>> {
        Ok(self.items.find_one(doc! { "_id": item_id }, None).await?)
    }

    async fn item_refs(&self, ids: &[String]) -> StoreResult<HashMap<String, ItemRef>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let options = FindOptions::builder()
            .projection(doc! { "kind": 1, "title": 1, "slug": 1 })
            .build();
        let cursor = self
            .items
            .clone_with_type::<ItemRef>()
            .find(doc! { "_id": { "$in": ids.to_vec() } }, options)
            .await?;
        let refs: Vec<ItemRef> = cursor.try_collect().await?;
        Ok(refs.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    async fn count_items(&self) -> StoreResult<i64> {
        let count = self.items.count_documents(doc! {}, None).await?;
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn top_items(&self, limit: i64) -> StoreResult<Vec<ItemSummary>> {
        let options = FindOptions::builder()
            .projection(doc! { "kind": 1, "title": 1, "total_enrollments": 1 })
            .sort(doc! { "total_enrollments": -1 })
            .limit(limit)
            .build();
        let cursor = self
            .items
            .clone_with_type::<ItemSummary>()
            .find(doc! {}, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl EntitlementStore for MongoStore {
    async fn has_entitlement(&self, user_id: &str, item_id: &str) -> StoreResult<bool> {
        let count = self
            .items
            .count_documents(
                doc! { "_id": item_id, "enrolled_users.user_id": user_id },
                None,
            )
            .await?;
        Ok(count > 0)
    }

    async fn grant(
        &self,
        user_id: &str,
        item_id: &str,
        enrolled_at: DateTime<Utc>,
    ) -> StoreResult<GrantOutcome> {
        // Single-document update: the filter and the $push are applied
        // atomically, so only one writer can insert the pair.
        let filter = doc! {
            "_id": item_id,
            "enrolled_users.user_id": { "$ne": user_id },
        };
        let update = doc! {
            "$push": {
                "enrolled_users": {
                    "user_id": user_id,
                    "enrolled_at": BsonDateTime::from_chrono(enrolled_at),
                    "progress": 0,
                }
            },
            "$inc": { "total_enrollments": 1 },
        };

        let result = self.items.update_one(filter, update, None).await?;
        if result.modified_count == 1 {
            return Ok(GrantOutcome::Granted);
        }

        let exists = self
            .items
            .count_documents(doc! { "_id": item_id }, None)
            .await?
            > 0;
        Ok(if exists {
            GrantOutcome::AlreadyPresent
        } else {
            GrantOutcome::ItemMissing
        })
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<UserEnrollment>> {
        let cursor = self
            .items
            .find(doc! { "enrolled_users.user_id": user_id }, None)
            .await?;
        let items: Vec<CatalogItem> = cursor.try_collect().await?;

        let mut enrollments: Vec<UserEnrollment> = items
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
        let result = self
            .items
            .update_one(
                doc! { "_id": item_id, "enrolled_users.user_id": user_id },
                doc! { "$set": { "enrolled_users.$.progress": progress } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn total_enrollments(&self) -> StoreResult<i64> {
        let pipeline = vec![doc! {
            "$group": { "_id": Bson::Null, "total": { "$sum": "$total_enrollments" } }
        }];
        let mut cursor = self.items.aggregate(pipeline, None).await?;
        Ok(match cursor.try_next().await? {
            Some(row) => number(&row, "total"),
            None => 0,
        })
    }
}
