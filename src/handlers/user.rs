use axum::{extract::State, response::Json};

use crate::{
    errors::Result,
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::StorageInfoResponse,
};

#[utoipa::path(
    get,
    path = "/api/storage/remaining",
    tag = "user_storage_info",
    responses(
        (status = 200, description = "Quota, used and remaining bytes", body = StorageInfoResponse),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer_auth" = []))
)]
pub async fn remaining_storage(
    State(state): State<AppState>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> Result<Json<StorageInfoResponse>> {
    let storage_info = state.storage.remaining_quota(&principal)?;

    tracing::info!(
        user_id = %principal.user_id,
        used_bytes = storage_info.used_bytes,
        remaining_bytes = storage_info.remaining_bytes,
        "Remaining storage"
    );

    Ok(Json(StorageInfoResponse {
        username: principal.username,
        storage_info,
    }))
}
