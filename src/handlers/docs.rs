use axum::{response::Json, routing::get, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::handlers::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health::liveness,
        crate::handlers::auth::register,
        crate::handlers::auth::login,
        crate::handlers::files::upload_file,
        crate::handlers::files::list_files,
        crate::handlers::user::remaining_storage,
    ),
    components(
        schemas(
            crate::models::RegisterRequest,
            crate::models::LoginRequest,
            crate::models::UserResponse,
            crate::models::AuthResponse,
            crate::models::FileRecord,
            crate::models::QuotaUsage,
            crate::models::StorageInfoResponse,
            crate::handlers::files::UploadForm,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "files", description = "File upload and listing"),
        (name = "user_storage_info", description = "Storage accounting"),
        (name = "auth", description = "Registration and login"),
        (name = "health", description = "Health check endpoints")
    ),
    info(
        title = "File Vault API",
        version = "0.1.0",
        description = "Quota-enforced file storage with per-user metadata"
    )
)]
pub struct ApiDoc;

/// Registers the JWT bearer scheme referenced by protected endpoints.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_docs_router() -> Router<AppState> {
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}
