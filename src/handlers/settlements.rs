use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

use crate::entities::settlement::{self, SettlementStatus};
use crate::services::settlements::SettlementSummary;
use super::page_of;
use crate::services::Page;
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SettlementListQuery {
    pub status: Option<SettlementStatus>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

pub async fn list_own(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SettlementListQuery>,
) -> ApiResult<Page<settlement::Model>> {
    user.require_seller()?;
    let page = state
        .services
        .settlements
        .list(Some(user.user_id), query.status, page_of(query.page, query.limit))
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn summary(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<SettlementSummary> {
    user.require_seller()?;
    let summary = state.services.settlements.summary(user.user_id).await?;
    Ok(Json(ApiResponse::success(summary)))
}

pub async fn get_own(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<settlement::Model> {
    user.require_seller()?;
    let found = state.services.settlements.get(id, user.user_id).await?;
    Ok(Json(ApiResponse::success(found)))
}
