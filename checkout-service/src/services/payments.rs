//! Payment lifecycle: initiation, callback verification and entitlement grant.
//!
//! A transaction moves `PENDING -> SUCCESS` or `PENDING -> FAILED` exactly
//! once. Only the gateway's status API decides which; the callback body is a
//! hint naming the transaction to re-verify. The caller whose finalize wins
//! the compare-and-set grants the entitlement, and a SUCCESS row whose grant
//! was never recorded is retried by later callbacks and by [`PaymentOrchestrator::reconcile`].

use crate::config::PaymentSettings;
use crate::error::PaymentError;
use crate::models::{Contact, ItemRef, Transaction, TransactionStatus};
use crate::services::phonepe::{CallbackNotice, InitiationRequest, PaymentGateway};
use crate::services::repository::{
    EntitlementStore, Finalization, FinalizeOutcome, GrantOutcome, ItemCatalog, TransactionStore,
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;

pub const RECONCILE_BATCH: i64 = 100;

/// Recorded on a paid transaction whose item was deleted before the grant.
pub const GRANT_BLOCKED_ITEM_MISSING: &str = "item_missing";

/// Initiation input as received; presence is checked here, not by the caller.
#[derive(Debug, Clone, Default)]
pub struct PaymentIntent {
    pub item_id: Option<String>,
    pub amount: Option<i64>,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub user_phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub payment_url: String,
    pub merchant_transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub success: bool,
    pub status: TransactionStatus,
}

/// A transaction as presented to its owner.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub transaction: Transaction,
    /// Stored status, except that a stale PENDING reads as FAILED.
    pub status: TransactionStatus,
    pub expired: bool,
    pub item: Option<ItemRef>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    pub granted: usize,
    pub already_present: usize,
    pub item_missing: usize,
    pub errors: usize,
}

pub struct PaymentOrchestrator {
    transactions: Arc<dyn TransactionStore>,
    catalog: Arc<dyn ItemCatalog>,
    entitlements: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    settings: PaymentSettings,
}

impl PaymentOrchestrator {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        catalog: Arc<dyn ItemCatalog>,
        entitlements: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            transactions,
            catalog,
            entitlements,
            gateway,
            settings,
        }
    }

    pub async fn initiate_payment(
        &self,
        user_id: &str,
        intent: PaymentIntent,
    ) -> Result<InitiatedPayment, PaymentError> {
        let (Some(item_id), Some(amount), Some(user_email)) = (
            non_empty(intent.item_id),
            intent.amount,
            non_empty(intent.user_email),
        ) else {
            return Err(PaymentError::Validation("Missing required fields".to_string()));
        };

        if amount <= 0 {
            return Err(PaymentError::Validation(
                "Amount must be positive".to_string(),
            ));
        }

        let item = self
            .catalog
            .get_item(&item_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound("Item not found".to_string()))?;

        if !item.is_published {
            return Err(PaymentError::Validation(
                "Item is not available for purchase".to_string(),
            ));
        }
        if amount != item.payable_price() {
            return Err(PaymentError::Validation(format!(
                "Amount does not match the item price of {}",
                item.payable_price()
            )));
        }

        // Fast path only; the storage-level uniqueness in `grant` is the real guard.
        if self.entitlements.has_entitlement(user_id, &item.id).await? {
            return Err(PaymentError::AlreadyEnrolled);
        }

        let tx = Transaction::new_pending(
            user_id,
            &item.id,
            amount,
            &self.settings.currency,
            Contact {
                email: user_email,
                name: non_empty(intent.user_name),
                phone: non_empty(intent.user_phone),
            },
            Utc::now(),
        );
        self.transactions.insert(&tx).await?;
        counter!("payments_initiated_total").increment(1);

        tracing::info!(
            transaction_id = %tx.id,
            user_id = %user_id,
            item_id = %tx.item_id,
            amount = tx.amount,
            "Payment transaction created"
        );

        let request = InitiationRequest {
            merchant_transaction_id: tx.id.clone(),
            user_id: user_id.to_string(),
            amount: tx.amount,
            phone: tx.user_phone.clone(),
        };

        let initiation = match self.gateway.initiate(&request).await {
            Ok(initiation) => initiation,
            Err(e) => {
                counter!("gateway_errors_total", "operation" => "initiate").increment(1);
                tracing::error!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Gateway initiation failed; transaction left pending"
                );
                return Err(e.into());
            }
        };

        self.transactions
            .attach_initiation_response(&tx.id, initiation.raw)
            .await?;

        Ok(InitiatedPayment {
            payment_url: initiation.redirect_url,
            merchant_transaction_id: tx.id,
        })
    }

    pub async fn handle_callback(
        &self,
        body: &serde_json::Value,
    ) -> Result<CallbackOutcome, PaymentError> {
        let notice = CallbackNotice::parse(body);

        tracing::info!(
            transaction_id = ?notice.merchant_transaction_id,
            claimed_code = ?notice.code,
            "Payment callback received"
        );

        let id = notice.merchant_transaction_id.ok_or_else(|| {
            PaymentError::Validation("Callback does not name a transaction".to_string())
        })?;

        let tx = self.transactions.find(&id).await?.ok_or_else(|| {
            tracing::warn!(transaction_id = %id, "Callback for unknown transaction");
            PaymentError::NotFound("Payment not found".to_string())
        })?;

        let outcome = if tx.status.is_terminal() {
            FinalizeOutcome::AlreadyFinal(tx)
        } else {
            let update = self.verify(&id).await;
            self.transactions
                .finalize(&id, update)
                .await?
                .ok_or_else(|| PaymentError::NotFound("Payment not found".to_string()))?
        };

        let tx = match outcome {
            FinalizeOutcome::Transitioned(tx) => {
                counter!("payments_finalized_total", "status" => tx.status.as_str()).increment(1);
                tracing::info!(
                    transaction_id = %tx.id,
                    status = tx.status.as_str(),
                    gateway_transaction_id = ?tx.gateway_transaction_id,
                    "Payment finalized"
                );
                if tx.status == TransactionStatus::Success {
                    self.grant_entitlement(&tx).await?;
                }
                tx
            }
            FinalizeOutcome::AlreadyFinal(tx) => {
                tracing::info!(
                    transaction_id = %tx.id,
                    status = tx.status.as_str(),
                    "Callback for already finalized payment"
                );
                if tx.status == TransactionStatus::Success && !tx.entitlement_granted {
                    self.grant_entitlement(&tx).await?;
                }
                tx
            }
        };

        Ok(CallbackOutcome {
            success: tx.status == TransactionStatus::Success,
            status: tx.status,
        })
    }

    /// Ask the gateway for the outcome. A failed verification is a failed
    /// payment.
    async fn verify(&self, id: &str) -> Finalization {
        match self.gateway.verify(id).await {
            Ok(status) => Finalization {
                status: if status.is_success() {
                    TransactionStatus::Success
                } else {
                    TransactionStatus::Failed
                },
                gateway_transaction_id: status.gateway_transaction_id,
                gateway_response: status.raw,
            },
            Err(e) => {
                counter!("gateway_errors_total", "operation" => "verify").increment(1);
                tracing::warn!(
                    transaction_id = %id,
                    error = %e,
                    timeout = e.is_timeout(),
                    "Payment verification failed; marking transaction failed"
                );
                Finalization {
                    status: TransactionStatus::Failed,
                    gateway_transaction_id: None,
                    gateway_response: e.audit_payload(),
                }
            }
        }
    }

    async fn grant_entitlement(&self, tx: &Transaction) -> Result<GrantOutcome, PaymentError> {
        let outcome = self
            .entitlements
            .grant(&tx.user_id, &tx.item_id, Utc::now())
            .await?;

        match outcome {
            GrantOutcome::Granted => {
                counter!("entitlements_granted_total").increment(1);
                tracing::info!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    item_id = %tx.item_id,
                    "Entitlement granted"
                );
                self.transactions.mark_entitlement_granted(&tx.id).await?;
            }
            GrantOutcome::AlreadyPresent => {
                tracing::info!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    item_id = %tx.item_id,
                    "Entitlement already present"
                );
                self.transactions.mark_entitlement_granted(&tx.id).await?;
            }
            GrantOutcome::ItemMissing => {
                tracing::error!(
                    transaction_id = %tx.id,
                    user_id = %tx.user_id,
                    item_id = %tx.item_id,
                    "Paid item no longer exists; entitlement not granted"
                );
                self.transactions
                    .mark_grant_blocked(&tx.id, GRANT_BLOCKED_ITEM_MISSING)
                    .await?;
            }
        }

        Ok(outcome)
    }

    /// Owner-scoped read. Another user's transaction reads as not found.
    pub async fn get_status(
        &self,
        transaction_id: &str,
        user_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        let tx = self
            .transactions
            .find(transaction_id)
            .await?
            .filter(|tx| tx.user_id == user_id)
            .ok_or_else(|| PaymentError::NotFound("Payment not found".to_string()))?;

        let mut items = self.catalog.item_refs(&[tx.item_id.clone()]).await?;
        let item = items.remove(&tx.item_id);
        Ok(self.present(tx, item, Utc::now()))
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<PaymentRecord>, PaymentError> {
        let txs = self.transactions.list_for_user(user_id).await?;

        let mut item_ids: Vec<String> = txs.iter().map(|tx| tx.item_id.clone()).collect();
        item_ids.sort();
        item_ids.dedup();
        let items = self.catalog.item_refs(&item_ids).await?;

        let now = Utc::now();
        Ok(txs
            .into_iter()
            .map(|tx| {
                let item = items.get(&tx.item_id).cloned();
                self.present(tx, item, now)
            })
            .collect())
    }

    /// Grant entitlements for SUCCESS transactions whose grant never committed.
    /// Rows that cannot be granted are marked blocked, so each pass makes
    /// progress past them.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PaymentError> {
        let backlog = self
            .transactions
            .list_ungranted_successes(RECONCILE_BATCH)
            .await?;

        let mut report = ReconcileReport {
            examined: backlog.len(),
            ..Default::default()
        };

        for tx in &backlog {
            match self.grant_entitlement(tx).await {
                Ok(GrantOutcome::Granted) => report.granted += 1,
                Ok(GrantOutcome::AlreadyPresent) => report.already_present += 1,
                Ok(GrantOutcome::ItemMissing) => report.item_missing += 1,
                Err(e) => {
                    tracing::error!(transaction_id = %tx.id, error = %e, "Reconciliation grant failed");
                    report.errors += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                granted = report.granted,
                errors = report.errors,
                "Entitlement reconciliation finished"
            );
        }
        Ok(report)
    }

    fn present(&self, tx: Transaction, item: Option<ItemRef>, now: DateTime<Utc>) -> PaymentRecord {
        let expired = tx.status == TransactionStatus::Pending
            && now - tx.created_at > Duration::minutes(self.settings.pending_expiry_minutes);
        let status = if expired {
            TransactionStatus::Failed
        } else {
            tx.status
        };

        PaymentRecord {
            transaction: tx,
            status,
            expired,
            item,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
