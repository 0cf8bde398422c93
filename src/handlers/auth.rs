use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
};
use serde_json::json;

use crate::{
    auth::PasswordService,
    errors::{AppError, Result},
    handlers::AppState,
    models::{AuthResponse, LoginRequest, RegisterRequest, UserResponse},
};

#[utoipa::path(
    post,
    path = "/api/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered"),
        (status = 400, description = "Invalid username, password or request body"),
        (status = 409, description = "Username already exists")
    )
)]
pub async fn register(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let Json(request) = payload?;
    PasswordService::validate_username(&request.username)?;
    PasswordService::validate_password(&request.password)?;

    if state.users.find_by_username(&request.username).is_some() {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }

    let cost = state.config.bcrypt_cost;
    let password = request.password;
    let password_hash =
        tokio::task::spawn_blocking(move || PasswordService::hash_password(&password, cost))
            .await
            .map_err(anyhow::Error::from)??;

    let user = state.users.create_user(&request.username, password_hash)?;

    if let Err(e) = state
        .storage
        .provision(user.id, state.config.default_quota_bytes)
    {
        state.users.remove(&user.username);
        return Err(e.into());
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User registered successfully",
            "data": UserResponse::from(user)
        })),
    ))
}

#[utoipa::path(
    post,
    path = "/api/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Access token issued", body = AuthResponse),
        (status = 400, description = "Invalid request body"),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    payload: std::result::Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>> {
    let Json(request) = payload?;
    let user = state
        .users
        .find_by_username(&request.username)
        .ok_or_else(|| AppError::Auth("Invalid credentials".to_string()))?;

    let password = request.password;
    let password_hash = user.password_hash.clone();
    let verified = tokio::task::spawn_blocking(move || {
        PasswordService::verify_password(&password, &password_hash)
    })
    .await
    .map_err(anyhow::Error::from)??;

    if !verified {
        tracing::warn!(username = %user.username, "Failed login attempt");
        return Err(AppError::Auth("Invalid credentials".to_string()));
    }

    let (token, expires_at) = state.jwt.generate_access_token(user.id, &user.username)?;
    tracing::info!(user_id = %user.id, "User logged in");

    Ok(Json(AuthResponse {
        token,
        token_type: "Bearer".to_string(),
        expires_at,
    }))
}
