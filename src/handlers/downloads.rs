use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::error;

use crate::errors::ServiceError;
use crate::services::downloads::{DownloadView, SignedUrl};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SignedParams {
    pub sig: String,
    pub exp: i64,
}

pub async fn create_access(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_item_id): Path<i64>,
) -> ApiResult<Vec<DownloadView>> {
    let grants = state
        .services
        .downloads
        .create_access(user.user_id, order_item_id)
        .await?;
    Ok(Json(ApiResponse::success(grants)))
}

pub async fn list_for_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_item_id): Path<i64>,
) -> ApiResult<Vec<DownloadView>> {
    let grants = state
        .services
        .downloads
        .list_for_item(user.user_id, order_item_id)
        .await?;
    Ok(Json(ApiResponse::success(grants)))
}

pub async fn list_downloads(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<DownloadView>> {
    let grants = state.services.downloads.list_for_user(user.user_id).await?;
    Ok(Json(ApiResponse::success(grants)))
}

pub async fn generate_url(
    State(state): State<AppState>,
    user: AuthUser,
    Path((order_item_id, file_id)): Path<(i64, i64)>,
) -> ApiResult<SignedUrl> {
    let url = state
        .services
        .downloads
        .generate_url(user.user_id, order_item_id, file_id)
        .await?;
    Ok(Json(ApiResponse::success(url)))
}

/// Redeems a signed URL and streams the file as an attachment.
pub async fn serve_download(
    State(state): State<AppState>,
    user: AuthUser,
    Path(token): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<Response, ServiceError> {
    let served = state
        .services
        .downloads
        .process(&token, &params.sig, params.exp, user.user_id)
        .await?;

    let bytes = tokio::fs::read(&served.file.file_path).await.map_err(|e| {
        error!(file_id = served.file.id, error = %e, "stored file unreadable");
        ServiceError::NotFound(format!("file {}", served.file.id))
    })?;

    let mut headers = HeaderMap::new();
    let content_type = served
        .file
        .file_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    let disposition = format!(
        "attachment; filename=\"{}\"",
        served.file.file_name.replace('"', "")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert("x-downloads-remaining", HeaderValue::from(served.remaining));

    Ok((StatusCode::OK, headers, bytes).into_response())
}
