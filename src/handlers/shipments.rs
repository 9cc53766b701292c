use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::entities::order;
use crate::services::shipping::{CarrierInfo, RegisterShippingRequest, TrackingView};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

pub async fn carriers(State(state): State<AppState>) -> ApiResult<Vec<CarrierInfo>> {
    Ok(Json(ApiResponse::success(state.services.shipping.carriers())))
}

pub async fn track_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
) -> ApiResult<TrackingView> {
    let view = state.services.shipping.track(user.user_id, order_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

pub async fn register_shipping(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
    Json(payload): Json<RegisterShippingRequest>,
) -> ApiResult<order::Model> {
    user.require_seller()?;
    let order = state
        .services
        .shipping
        .register_tracking(user.user_id, order_id, payload)
        .await?;
    Ok(Json(ApiResponse::with_message(order, "shipping registered")))
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
) -> ApiResult<order::Model> {
    user.require_seller()?;
    let order = state
        .services
        .shipping
        .mark_delivered(user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
