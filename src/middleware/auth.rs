use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};

use crate::{auth::PrincipalResolver, errors::AppError, handlers::AppState, models::Principal};

/// Caller identity resolved from an `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| {
                AppError::Auth("Authorization header is required".to_string()).into_response()
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Auth("Authorization header format must be Bearer {token}".to_string())
                .into_response()
        })?;

        let principal = state.jwt.resolve(token).map_err(|e| {
            tracing::debug!("Rejected bearer token: {}", e);
            e.into_response()
        })?;

        Ok(AuthenticatedUser(principal))
    }
}
