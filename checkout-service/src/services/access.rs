use crate::error::PaymentError;
use crate::models::UserEnrollment;
use crate::services::repository::{EntitlementStore, ItemCatalog, StoreResult};
use std::sync::Arc;

/// Answers whether a user may consume an item, and tracks their progress in it.
pub struct AccessGate {
    catalog: Arc<dyn ItemCatalog>,
    entitlements: Arc<dyn EntitlementStore>,
}

impl AccessGate {
    pub fn new(catalog: Arc<dyn ItemCatalog>, entitlements: Arc<dyn EntitlementStore>) -> Self {
        Self {
            catalog,
            entitlements,
        }
    }

    pub async fn has_access(&self, user_id: &str, item_id: &str) -> StoreResult<bool> {
        self.entitlements.has_entitlement(user_id, item_id).await
    }

    /// Like [`AccessGate::has_access`], but an unknown item is an error.
    pub async fn item_access(&self, user_id: &str, item_id: &str) -> Result<bool, PaymentError> {
        self.require_item(item_id).await?;
        Ok(self.has_access(user_id, item_id).await?)
    }

    pub async fn enrollments(&self, user_id: &str) -> Result<Vec<UserEnrollment>, PaymentError> {
        Ok(self.entitlements.list_for_user(user_id).await?)
    }

    pub async fn record_progress(
        &self,
        user_id: &str,
        item_id: &str,
        progress: i32,
    ) -> Result<(), PaymentError> {
        if !(0..=100).contains(&progress) {
            return Err(PaymentError::Validation(
                "Progress must be between 0 and 100".to_string(),
            ));
        }
        self.require_item(item_id).await?;

        if !self
            .entitlements
            .update_progress(user_id, item_id, progress)
            .await?
        {
            return Err(PaymentError::Forbidden(
                "Not enrolled in this item".to_string(),
            ));
        }

        tracing::debug!(user_id = %user_id, item_id = %item_id, progress, "Progress updated");
        Ok(())
    }

    async fn require_item(&self, item_id: &str) -> Result<(), PaymentError> {
        match self.catalog.get_item(item_id).await? {
            Some(_) => Ok(()),
            None => Err(PaymentError::NotFound("Item not found".to_string())),
        }
    }
}
