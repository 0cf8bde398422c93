use axum::{
    extract::{Multipart, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use utoipa::{IntoParams, ToSchema};

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::{FileRecord, PageRequest},
};

/// Multipart body accepted by the upload endpoint.
#[derive(ToSchema)]
pub struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "files",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File stored", body = FileRecord),
        (status = 400, description = "No file or invalid filename"),
        (status = 401, description = "Missing or invalid token"),
        (status = 403, description = "Storage quota exceeded"),
        (status = 500, description = "Failed to save file")
    ),
    security(("bearer_auth" = []))
)]
pub async fn upload_file(
    State(state): State<AppState>,
    AuthenticatedUser(principal): AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<Json<FileRecord>> {
    let mut upload: Option<(String, axum::body::Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("No file uploaded".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read file: {}", e)))?;
        upload = Some((filename, data));
        break;
    }

    let (filename, data) =
        upload.ok_or_else(|| AppError::Validation("No file uploaded".to_string()))?;

    let record = state
        .storage
        .upload(&principal, &filename, data.len() as u64, &data[..])
        .await?;

    Ok(Json(record))
}

/// Raw query values; anything unparsable falls back to the defaults.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListFilesQuery {
    /// Page number (default: 1)
    #[param(value_type = Option<i64>)]
    pub page: Option<String>,
    /// Number of items per page (default: 10)
    #[serde(rename = "pageSize")]
    #[param(value_type = Option<i64>)]
    pub page_size: Option<String>,
}

impl ListFilesQuery {
    pub fn to_page_request(&self, default_page_size: u64) -> PageRequest {
        PageRequest::with_default_size(
            parse_or_zero(self.page.as_deref()),
            parse_or_zero(self.page_size.as_deref()),
            default_page_size,
        )
    }
}

fn parse_or_zero(value: Option<&str>) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

#[utoipa::path(
    get,
    path = "/api/files",
    tag = "files",
    params(ListFilesQuery),
    responses(
        (status = 200, description = "One page of the caller's files in upload order"),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_files(
    State(state): State<AppState>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<serde_json::Value>> {
    let request = query.to_page_request(state.config.default_page_size);
    tracing::debug!(
        user_id = %principal.user_id,
        page = request.page,
        page_size = request.page_size,
        "Listing files"
    );

    let page = state.storage.list_files(&principal, request)?;

    Ok(Json(json!({ "paginated_response": page })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: Option<&str>, page_size: Option<&str>) -> ListFilesQuery {
        ListFilesQuery {
            page: page.map(str::to_string),
            page_size: page_size.map(str::to_string),
        }
    }

    #[test]
    fn test_query_parsing_falls_back_to_defaults() {
        assert_eq!(
            query(Some("3"), Some("5")).to_page_request(10),
            PageRequest { page: 3, page_size: 5 }
        );
        assert_eq!(
            query(Some("abc"), Some("-4")).to_page_request(10),
            PageRequest { page: 1, page_size: 10 }
        );
        assert_eq!(
            query(None, Some("0")).to_page_request(7),
            PageRequest { page: 1, page_size: 7 }
        );
    }
}
