use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

use crate::entities::order;
use crate::errors::ServiceError;
use crate::services::orders::{CancelOrderRequest, CheckoutRequest, OrderDetail};
use crate::services::{Page, PageRequest};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

/// Converts the caller's cart into a pending order.
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderDetail>>), ServiceError> {
    let order = state.services.orders.checkout(user.user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageRequest>,
) -> ApiResult<Page<order::Model>> {
    let orders = state.services.orders.list_orders(user.user_id, page).await?;
    Ok(Json(ApiResponse::success(orders)))
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<OrderDetail> {
    let order = state.services.orders.get_order(user.user_id, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn get_order_by_number(
    State(state): State<AppState>,
    user: AuthUser,
    Path(number): Path<String>,
) -> ApiResult<OrderDetail> {
    let order = state
        .services
        .orders
        .get_order_by_number(user.user_id, &number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<CancelOrderRequest>,
) -> ApiResult<order::Model> {
    let order = state
        .services
        .orders
        .cancel_order(user.user_id, id, payload.reason)
        .await?;
    Ok(Json(ApiResponse::with_message(order, "order cancelled")))
}

pub async fn list_seller_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(page): Query<PageRequest>,
) -> ApiResult<Page<order::Model>> {
    user.require_seller()?;
    let orders = state
        .services
        .orders
        .list_seller_orders(user.user_id, page)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}
