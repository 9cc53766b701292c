use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use bytes::Bytes;
use tracing::warn;

use crate::entities::payment::PgProvider;
use crate::errors::ServiceError;
use crate::services::payments::{verify_webhook_signature, WebhookOutcome};
use crate::{ApiResponse, ApiResult, AppState};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

// POST /api/v1/payments/webhooks/:provider
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookOutcome> {
    let provider: PgProvider = provider
        .parse()
        .map_err(|_| ServiceError::NotFound(format!("payment provider {}", provider)))?;

    if let Some(secret) = state.config.gateways.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_webhook_signature(secret, &body, signature) {
            warn!(%provider, "payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let outcome = state
        .services
        .payments
        .handle_webhook(provider, &body)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}
