mod common;

use chrono::{Duration, Utc};
use checkout_service::error::PaymentError;
use checkout_service::models::{Contact, Transaction, TransactionStatus};
use checkout_service::services::payments::{
    PaymentIntent, GRANT_BLOCKED_ITEM_MISSING, RECONCILE_BATCH,
};
use checkout_service::services::repository::{Finalization, FinalizeOutcome};
use checkout_service::services::{EntitlementStore, ItemCatalog, TransactionStore};
use common::{
    course, TestApp, VerifyScript, COURSE_ID, COURSE_PRICE, OTHER_USER_ID, TEST_USER_ID,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::Ordering;

fn intent(item_id: &str, amount: i64) -> PaymentIntent {
    PaymentIntent {
        item_id: Some(item_id.to_string()),
        amount: Some(amount),
        user_email: Some("a@x.com".to_string()),
        user_name: Some("Asha".to_string()),
        user_phone: None,
    }
}

fn callback_for(id: &str) -> serde_json::Value {
    json!({ "merchantTransactionId": id, "code": "PAYMENT_SUCCESS" })
}

async fn initiate(app: &TestApp) -> String {
    app.state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, COURSE_PRICE))
        .await
        .expect("Initiation should succeed")
        .merchant_transaction_id
}

#[tokio::test]
async fn initiation_creates_pending_transaction_with_redirect() {
    let app = TestApp::with_course().await;

    let initiated = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, COURSE_PRICE))
        .await
        .unwrap();

    assert!(initiated.merchant_transaction_id.starts_with("TXN_"));
    assert_eq!(
        initiated.payment_url,
        format!("https://mercury.test/pay/{}", initiated.merchant_transaction_id)
    );

    let tx = app
        .store
        .find(&initiated.merchant_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.amount, COURSE_PRICE);
    assert_eq!(tx.currency, "INR");
    assert_eq!(tx.user_phone, None);
    assert!(tx.initiation_response.is_some());
}

#[tokio::test]
async fn missing_fields_are_rejected_without_writing() {
    let app = TestApp::with_course().await;

    let result = app
        .state
        .payments
        .initiate_payment(
            TEST_USER_ID,
            PaymentIntent {
                item_id: Some(COURSE_ID.to_string()),
                amount: Some(COURSE_PRICE),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(result, Err(PaymentError::Validation(ref m)) if m == "Missing required fields"));
    assert!(TransactionStore::list_for_user(&*app.store, TEST_USER_ID).await.unwrap().is_empty());
    assert_eq!(app.gateway.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_item_is_not_found() {
    let app = TestApp::with_course().await;

    let result = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent("no-such-course", COURSE_PRICE))
        .await;

    assert!(matches!(result, Err(PaymentError::NotFound(_))));
}

#[tokio::test]
async fn amount_must_match_payable_price() {
    let app = TestApp::new();
    let mut item = course(COURSE_ID, 1999);
    item.discounted_price = Some(999);
    app.seed_item(item);

    let wrong = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, 1999))
        .await;
    assert!(matches!(wrong, Err(PaymentError::Validation(_))));

    let right = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, 999))
        .await;
    assert!(right.is_ok());
}

#[tokio::test]
async fn unpublished_item_cannot_be_bought() {
    let app = TestApp::new();
    let mut item = course(COURSE_ID, COURSE_PRICE);
    item.is_published = false;
    app.seed_item(item);

    let result = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, COURSE_PRICE))
        .await;

    assert!(matches!(result, Err(PaymentError::Validation(_))));
}

#[tokio::test]
async fn gateway_initiation_failure_leaves_pending_row() {
    let app = TestApp::with_course().await;
    app.gateway.fail_initiation();

    let result = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, COURSE_PRICE))
        .await;
    assert!(matches!(result, Err(PaymentError::Gateway(_))));

    let txs = TransactionStore::list_for_user(&*app.store, TEST_USER_ID).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].status, TransactionStatus::Pending);
    assert!(txs[0].initiation_response.is_none());
}

#[tokio::test]
async fn verified_success_grants_entitlement_once() {
    let app = TestApp::with_course().await;
    let id = initiate(&app).await;

    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status, TransactionStatus::Success);

    let tx = app.store.find(&id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Success);
    assert_eq!(tx.gateway_transaction_id, Some(format!("T{}", id)));
    assert!(tx.entitlement_granted);
    assert!(app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());

    let item = app.store.get_item(COURSE_ID).await.unwrap().unwrap();
    assert_eq!(item.total_enrollments, 1);
    assert_eq!(item.enrolled_users.len(), 1);
}

#[tokio::test]
async fn repeated_callback_does_not_reverify_or_regrant() {
    let app = TestApp::with_course().await;
    let id = initiate(&app).await;

    app.state.payments.handle_callback(&callback_for(&id)).await.unwrap();
    let again = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();

    assert!(again.success);
    assert_eq!(app.gateway.verify_count(), 1);
    let item = app.store.get_item(COURSE_ID).await.unwrap().unwrap();
    assert_eq!(item.total_enrollments, 1);
}

#[tokio::test]
async fn callback_claim_is_not_trusted_over_verification() {
    let app = TestApp::with_course().await;
    app.gateway.set_verify(VerifyScript::Declined);
    let id = initiate(&app).await;

    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, TransactionStatus::Failed);
    assert!(!app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());
}

#[tokio::test]
async fn verification_error_fails_closed_with_audit() {
    let app = TestApp::with_course().await;
    app.gateway.set_verify(VerifyScript::Error);
    let id = initiate(&app).await;

    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();
    assert_eq!(outcome.status, TransactionStatus::Failed);

    let tx = app.store.find(&id).await.unwrap().unwrap();
    let audit = tx.gateway_response.expect("Failure should be recorded");
    assert_eq!(audit["error"], "verification_failed");
    assert!(audit["message"].as_str().unwrap().contains("connection reset"));

    // A later success report cannot revive a FAILED transaction.
    app.gateway.set_verify(VerifyScript::Success);
    let later = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();
    assert_eq!(later.status, TransactionStatus::Failed);
    assert!(!app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());
}

#[tokio::test]
async fn callback_without_transaction_id_is_rejected() {
    let app = TestApp::with_course().await;

    let result = app
        .state
        .payments
        .handle_callback(&json!({ "code": "PAYMENT_SUCCESS" }))
        .await;

    assert!(matches!(result, Err(PaymentError::Validation(_))));
    assert_eq!(app.gateway.verify_count(), 0);
}

#[tokio::test]
async fn callback_for_unknown_transaction_is_not_found() {
    let app = TestApp::with_course().await;

    let result = app
        .state
        .payments
        .handle_callback(&callback_for("TXN_0_deadbeef"))
        .await;

    assert!(matches!(result, Err(PaymentError::NotFound(_))));
    assert_eq!(app.gateway.verify_count(), 0);
}

#[tokio::test]
async fn encoded_callback_body_is_understood() {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let app = TestApp::with_course().await;
    let id = initiate(&app).await;

    let inner = json!({
        "success": true,
        "code": "PAYMENT_SUCCESS",
        "data": { "merchantTransactionId": id, "transactionId": "T1" }
    });
    let body = json!({ "response": STANDARD.encode(inner.to_string()) });

    let outcome = app.state.payments.handle_callback(&body).await.unwrap();
    assert!(outcome.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callbacks_grant_exactly_once() {
    let app = TestApp::with_course().await;
    let id = initiate(&app).await;

    let body = callback_for(&id);
    let attempts = (0..8).map(|_| app.state.payments.handle_callback(&body));
    let outcomes = join_all(attempts).await;

    for outcome in outcomes {
        let outcome = outcome.expect("Every racer should get an answer");
        assert!(outcome.success);
    }

    let item = app.store.get_item(COURSE_ID).await.unwrap().unwrap();
    assert_eq!(item.total_enrollments, 1);
    assert_eq!(item.enrolled_users.len(), 1);
}

#[tokio::test]
async fn two_paid_transactions_yield_one_entitlement() {
    let app = TestApp::with_course().await;
    let first = initiate(&app).await;
    let second = initiate(&app).await;

    app.state.payments.handle_callback(&callback_for(&first)).await.unwrap();
    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&second))
        .await
        .unwrap();
    assert!(outcome.success);

    let item = app.store.get_item(COURSE_ID).await.unwrap().unwrap();
    assert_eq!(item.total_enrollments, 1);
    assert!(app.store.find(&second).await.unwrap().unwrap().entitlement_granted);
}

#[tokio::test]
async fn already_enrolled_user_cannot_initiate() {
    let app = TestApp::with_course().await;
    app.store.grant(TEST_USER_ID, COURSE_ID, Utc::now()).await.unwrap();

    let result = app
        .state
        .payments
        .initiate_payment(TEST_USER_ID, intent(COURSE_ID, COURSE_PRICE))
        .await;

    assert!(matches!(result, Err(PaymentError::AlreadyEnrolled)));
    assert!(TransactionStore::list_for_user(&*app.store, TEST_USER_ID)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(app.gateway.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_pending_reads_failed_but_can_still_finalize() {
    let app = TestApp::with_course().await;
    let tx = Transaction::new_pending(
        TEST_USER_ID,
        COURSE_ID,
        COURSE_PRICE,
        "INR",
        Contact {
            email: "a@x.com".to_string(),
            ..Default::default()
        },
        Utc::now() - Duration::hours(2),
    );
    app.store.insert(&tx).await.unwrap();

    let record = app.state.payments.get_status(&tx.id, TEST_USER_ID).await.unwrap();
    assert!(record.expired);
    assert_eq!(record.status, TransactionStatus::Failed);
    assert_eq!(
        app.store.find(&tx.id).await.unwrap().unwrap().status,
        TransactionStatus::Pending
    );

    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&tx.id))
        .await
        .unwrap();
    assert!(outcome.success);

    let record = app.state.payments.get_status(&tx.id, TEST_USER_ID).await.unwrap();
    assert!(!record.expired);
    assert_eq!(record.status, TransactionStatus::Success);
}

#[tokio::test]
async fn status_is_scoped_to_owner() {
    let app = TestApp::with_course().await;
    let id = initiate(&app).await;

    let mine = app.state.payments.get_status(&id, TEST_USER_ID).await.unwrap();
    assert_eq!(mine.item.map(|i| i.title), Some(format!("Course {}", COURSE_ID)));

    let theirs = app.state.payments.get_status(&id, OTHER_USER_ID).await;
    assert!(matches!(theirs, Err(PaymentError::NotFound(_))));
}

#[tokio::test]
async fn history_is_newest_first() {
    let app = TestApp::with_course().await;
    let first = initiate(&app).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = initiate(&app).await;

    let history = app.state.payments.history(TEST_USER_ID).await.unwrap();
    let ids: Vec<_> = history.iter().map(|r| r.transaction.id.clone()).collect();
    assert_eq!(ids, vec![second, first]);
    assert!(app.state.payments.history(OTHER_USER_ID).await.unwrap().is_empty());
}

/// Leaves a SUCCESS row whose grant never ran, as after a crash between the
/// two writes.
async fn success_without_grant(app: &TestApp) -> String {
    let id = initiate(app).await;
    let outcome = app
        .store
        .finalize(
            &id,
            Finalization {
                status: TransactionStatus::Success,
                gateway_transaction_id: Some("T1".to_string()),
                gateway_response: json!({ "code": "PAYMENT_SUCCESS" }),
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Some(FinalizeOutcome::Transitioned(_))));
    id
}

#[tokio::test]
async fn reconcile_grants_missing_entitlements() {
    let app = TestApp::with_course().await;
    let id = success_without_grant(&app).await;
    assert!(!app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());

    let report = app.state.payments.reconcile().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.granted, 1);
    assert!(app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());
    assert!(app.store.find(&id).await.unwrap().unwrap().entitlement_granted);

    let second = app.state.payments.reconcile().await.unwrap();
    assert_eq!(second.examined, 0);
}

#[tokio::test]
async fn item_missing_rows_do_not_starve_the_backlog() {
    let app = TestApp::with_course().await;
    let paid_at = Utc::now() - Duration::hours(1);

    let mut blocked = Vec::new();
    for _ in 0..RECONCILE_BATCH {
        let tx = Transaction::new_pending(
            OTHER_USER_ID,
            "deleted-course",
            COURSE_PRICE,
            "INR",
            Contact {
                email: "b@x.com".to_string(),
                ..Default::default()
            },
            paid_at,
        );
        app.store.insert(&tx).await.unwrap();
        app.store
            .finalize(
                &tx.id,
                Finalization {
                    status: TransactionStatus::Success,
                    gateway_transaction_id: None,
                    gateway_response: json!({ "code": "PAYMENT_SUCCESS" }),
                },
            )
            .await
            .unwrap();
        blocked.push(tx.id);
    }
    let id = success_without_grant(&app).await;

    let first = app.state.payments.reconcile().await.unwrap();
    assert_eq!(first.item_missing, RECONCILE_BATCH as usize);
    assert_eq!(first.granted, 0);

    let second = app.state.payments.reconcile().await.unwrap();
    assert_eq!(second.examined, 1);
    assert_eq!(second.granted, 1);
    assert!(app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());
    assert!(app.store.find(&id).await.unwrap().unwrap().entitlement_granted);

    let row = app.store.find(&blocked[0]).await.unwrap().unwrap();
    assert_eq!(row.grant_blocked.as_deref(), Some(GRANT_BLOCKED_ITEM_MISSING));
    assert!(!row.entitlement_granted);
}

#[tokio::test]
async fn later_callback_recovers_missing_grant() {
    let app = TestApp::with_course().await;
    let id = success_without_grant(&app).await;

    let outcome = app
        .state
        .payments
        .handle_callback(&callback_for(&id))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(app.gateway.verify_count(), 0);
    assert!(app.store.has_entitlement(TEST_USER_ID, COURSE_ID).await.unwrap());
}
