use axum::{extract::State, Json};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::AdminUser;

use crate::{
    services::{payments::ReconcileReport, reporting::Analytics},
    startup::AppState,
};

pub async fn analytics(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Analytics>, AppError> {
    Ok(Json(state.reporting.analytics(Utc::now()).await?))
}

pub async fn reconcile(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> Result<Json<ReconcileReport>, AppError> {
    tracing::info!(admin_id = %admin.user_id, "Manual entitlement reconciliation requested");
    Ok(Json(state.payments.reconcile().await?))
}
