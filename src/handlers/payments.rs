use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use crate::entities::payment::{self, PgProvider};
use crate::errors::ServiceError;
use crate::services::payments::{
    CancelPaymentRequest, CompletePaymentRequest, PreparePaymentRequest, PreparePaymentResponse,
};
use crate::{auth::AuthUser, ApiResponse, ApiResult, AppState};

pub async fn providers(State(state): State<AppState>) -> ApiResult<Vec<PgProvider>> {
    Ok(Json(ApiResponse::success(state.services.payments.providers())))
}

/// Opens a payment attempt and returns what the client needs to launch the
/// provider's payment window.
pub async fn prepare_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<PreparePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PreparePaymentResponse>>), ServiceError> {
    let prepared = state.services.payments.prepare(user.user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(prepared))))
}

pub async fn complete_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CompletePaymentRequest>,
) -> ApiResult<payment::Model> {
    let payment = state.services.payments.complete(user.user_id, payload).await?;
    Ok(Json(ApiResponse::success(payment)))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<CancelPaymentRequest>,
) -> ApiResult<payment::Model> {
    let payment = state
        .services
        .payments
        .cancel(user.user_id, id, payload)
        .await?;
    Ok(Json(ApiResponse::with_message(payment, "payment cancelled")))
}

pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<payment::Model> {
    let payment = state.services.payments.get_payment(user.user_id, id).await?;
    Ok(Json(ApiResponse::success(payment)))
}

pub async fn get_order_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<i64>,
) -> ApiResult<payment::Model> {
    let payment = state
        .services
        .payments
        .get_payment_by_order(user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(payment)))
}
