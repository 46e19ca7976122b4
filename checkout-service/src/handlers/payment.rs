use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use service_core::extract::JsonBody;
use service_core::middleware::AuthUser;
use validator::Validate;

use crate::{
    dtos::{
        CallbackResponse, InitiatePaymentRequest, InitiatePaymentResponse, PaymentStatusResponse,
        PaymentView,
    },
    startup::AppState,
};

pub async fn initiate(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    JsonBody(payload): JsonBody<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>, AppError> {
    payload.validate()?;

    let initiated = state
        .payments
        .initiate_payment(&identity.user_id, payload.into())
        .await?;

    Ok(Json(InitiatePaymentResponse {
        success: true,
        payment_url: initiated.payment_url,
        merchant_transaction_id: initiated.merchant_transaction_id,
    }))
}

/// Gateway server-to-server notification. Unauthenticated; the body only
/// names the transaction to re-verify.
pub async fn callback(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<serde_json::Value>,
) -> Result<Json<CallbackResponse>, AppError> {
    let outcome = state.payments.handle_callback(&body).await?;
    Ok(Json(CallbackResponse {
        success: outcome.success,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(transaction_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let record = state
        .payments
        .get_status(&transaction_id, &identity.user_id)
        .await?;

    Ok(Json(PaymentStatusResponse {
        status: record.status,
        payment: record.into(),
    }))
}

pub async fn history(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<PaymentView>>, AppError> {
    let records = state.payments.history(&identity.user_id).await?;
    Ok(Json(records.into_iter().map(PaymentView::from).collect()))
}
