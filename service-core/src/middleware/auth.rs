//! Bearer authentication for the HTTP surface.
//!
//! [`require_identity`] verifies the `Authorization: Bearer` token once per
//! request and stores the resulting [`VerifiedIdentity`] in the request
//! extensions. Handlers then take [`AuthUser`] or [`AdminUser`] as arguments.

use crate::error::AppError;
use crate::identity::{IdentityVerifier, VerifiedIdentity};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

pub async fn require_identity<S>(
    State(state): State<S>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<IdentityVerifier> + Clone + Send + Sync + 'static,
{
    let token = bearer_token(&req)?;
    let identity = state.as_ref().verify(token)?;

    tracing::debug!(user_id = %identity.user_id, role = ?identity.role, "Authenticated request");

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn bearer_token(req: &Request) -> Result<&str, AppError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing bearer token")))?
        .to_str()
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid authorization header")))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing bearer token")))
}

/// Any authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub VerifiedIdentity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<VerifiedIdentity>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}

/// An authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub VerifiedIdentity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser(identity) = AuthUser::from_request_parts(parts, state).await?;
        if !identity.is_admin() {
            return Err(AppError::Forbidden(anyhow::anyhow!("Admin access required")));
        }
        Ok(AdminUser(identity))
    }
}
