use axum::{
    extract::{Path, State},
    response::Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use validator::Validate;

use crate::entities::{coupon, order};
use crate::services::coupons::{AppliedCoupon, CouponValidation};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub order_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
}

/// Eligibility check without side effects. An ineligible coupon is a
/// successful response with `valid: false`.
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> ApiResult<CouponValidation> {
    payload.validate()?;
    let result = state
        .services
        .coupons
        .validate(user.user_id, &payload.code, payload.order_amount)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn public_coupons(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<Vec<coupon::Model>> {
    let coupons = state.services.coupons.list_public().await?;
    Ok(Json(ApiResponse::success(coupons)))
}

pub async fn apply_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
    Json(payload): Json<ApplyCouponRequest>,
) -> ApiResult<AppliedCoupon> {
    payload.validate()?;
    let applied = state
        .services
        .coupons
        .apply(user.user_id, order_id, &payload.code)
        .await?;
    Ok(Json(ApiResponse::with_message(applied, "coupon applied")))
}

pub async fn remove_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
) -> ApiResult<order::Model> {
    let order = state.services.coupons.remove(user.user_id, order_id).await?;
    Ok(Json(ApiResponse::with_message(order, "coupon removed")))
}
