use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;

use crate::services::cart::{AddToCart, CartValidation, CartView};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct UpdateQuantity {
    pub quantity: i32,
}

pub async fn get_cart(State(state): State<AppState>, user: AuthUser) -> ApiResult<CartView> {
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Lines that can be checked out as they stand, and why the others cannot.
pub async fn validate_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<CartValidation> {
    let report = state.services.cart.validate(user.user_id).await?;
    Ok(Json(ApiResponse::success(report)))
}

pub async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddToCart>,
) -> ApiResult<CartView> {
    state.services.cart.add(user.user_id, payload).await?;
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// A quantity of zero or less removes the line.
pub async fn update_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<i64>,
    Json(payload): Json<UpdateQuantity>,
) -> ApiResult<CartView> {
    state
        .services
        .cart
        .update_quantity(user.user_id, product_id, payload.quantity)
        .await?;
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn remove_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<i64>,
) -> ApiResult<CartView> {
    state.services.cart.remove(user.user_id, product_id).await?;
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}
