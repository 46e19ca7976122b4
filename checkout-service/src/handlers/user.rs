use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use service_core::extract::JsonBody;
use service_core::middleware::AuthUser;
use validator::Validate;

use crate::{
    dtos::{AccessResponse, EnrollmentView, ProgressRequest, ProgressResponse},
    services::reporting::UserDashboard,
    startup::AppState,
};

pub async fn enrollments(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<EnrollmentView>>, AppError> {
    let enrollments = state.access.enrollments(&identity.user_id).await?;
    Ok(Json(
        enrollments.into_iter().map(EnrollmentView::from).collect(),
    ))
}

pub async fn item_access(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(item_id): Path<String>,
) -> Result<Json<AccessResponse>, AppError> {
    let has_access = state.access.item_access(&identity.user_id, &item_id).await?;
    Ok(Json(AccessResponse { has_access }))
}

pub async fn update_progress(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(item_id): Path<String>,
    JsonBody(payload): JsonBody<ProgressRequest>,
) -> Result<Json<ProgressResponse>, AppError> {
    payload.validate()?;

    state
        .access
        .record_progress(&identity.user_id, &item_id, payload.progress)
        .await?;

    Ok(Json(ProgressResponse {
        success: true,
        progress: payload.progress,
    }))
}

pub async fn dashboard(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<UserDashboard>, AppError> {
    Ok(Json(state.reporting.dashboard(&identity.user_id).await?))
}
