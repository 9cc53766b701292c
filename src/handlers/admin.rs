//! Operator endpoints. Every handler starts with `require_admin`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::entities::coupon::{self, CouponStatus};
use crate::entities::order::{self, OrderStatus};
use crate::entities::{order_item, settlement};
use crate::errors::ServiceError;
use crate::services::coupons::{CreateCouponRequest, UpdateCouponRequest};
use crate::services::settlements::{CreateSettlementRequest, ProcessSettlementRequest};
use super::page_of;
use crate::services::Page;
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct CouponListQuery {
    pub status: Option<CouponStatus>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SettlementListAdminQuery {
    pub seller_id: Option<i64>,
    pub status: Option<settlement::SettlementStatus>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PendingItemsQuery {
    pub seller_id: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<StatusUpdate>,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    let order = state.services.orders.update_status(id, payload.status).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Pulls the carrier's latest scan and records delivery when reported.
pub async fn refresh_shipping(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    let order = state.services.shipping.update_shipping_status(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn create_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateCouponRequest>,
) -> Result<(StatusCode, Json<ApiResponse<coupon::Model>>), ServiceError> {
    user.require_admin()?;
    let created = state.services.coupons.create(user.user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn list_coupons(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<CouponListQuery>,
) -> ApiResult<Page<coupon::Model>> {
    user.require_admin()?;
    let page = state
        .services
        .coupons
        .list(query.status, page_of(query.page, query.limit))
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<coupon::Model> {
    user.require_admin()?;
    Ok(Json(ApiResponse::success(state.services.coupons.get(id).await?)))
}

pub async fn update_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateCouponRequest>,
) -> ApiResult<coupon::Model> {
    user.require_admin()?;
    let updated = state.services.coupons.update(id, payload).await?;
    Ok(Json(ApiResponse::success(updated)))
}

pub async fn delete_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServiceError> {
    user.require_admin()?;
    state.services.coupons.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_settlement(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateSettlementRequest>,
) -> Result<(StatusCode, Json<ApiResponse<settlement::Model>>), ServiceError> {
    user.require_admin()?;
    let created = state.services.settlements.create(payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn list_settlements(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SettlementListAdminQuery>,
) -> ApiResult<Page<settlement::Model>> {
    user.require_admin()?;
    let page = state
        .services
        .settlements
        .list(query.seller_id, query.status, page_of(query.page, query.limit))
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_settlement(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<settlement::Model> {
    user.require_admin()?;
    Ok(Json(ApiResponse::success(state.services.settlements.get(id, 0).await?)))
}

/// Lines a settlement for the given seller and period would pick up.
pub async fn pending_settlement_items(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PendingItemsQuery>,
) -> ApiResult<Vec<order_item::Model>> {
    user.require_admin()?;
    let items = state
        .services
        .settlements
        .pending_items(query.seller_id, query.period_start, query.period_end)
        .await?;
    Ok(Json(ApiResponse::success(items)))
}

pub async fn process_settlement(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<ProcessSettlementRequest>,
) -> ApiResult<settlement::Model> {
    user.require_admin()?;
    let processed = state
        .services
        .settlements
        .process(id, user.user_id, payload)
        .await?;
    Ok(Json(ApiResponse::success(processed)))
}
