//! Marketplace ledger
//!
//! Transaction backend for a multi-seller marketplace: cart to order
//! conversion, coupons, payment gateway orchestration, seller settlements,
//! digital downloads and shipment tracking.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod request_context;
pub mod services;

use axum::{
    extract::FromRef,
    http::{HeaderValue, Method},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::auth::JwtKeys;
use crate::request_context::{RequestSpanMaker, REQUEST_ID_HEADER};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub jwt: Arc<JwtKeys>,
    pub services: handlers::AppServices,
}

impl FromRef<AppState> for Arc<JwtKeys> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: request_context::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    use handlers::{
        admin, cart, coupons, downloads, orders, payment_webhooks, payments, settlements,
        shipments,
    };

    let buyer = Router::new()
        .route("/cart", get(cart::get_cart).post(cart::add_to_cart))
        .route("/cart/validate", get(cart::validate_cart))
        .route(
            "/cart/:product_id",
            put(cart::update_cart_item).delete(cart::remove_cart_item),
        )
        .route("/orders", post(orders::checkout).get(orders::list_orders))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/number/:number", get(orders::get_order_by_number))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route(
            "/orders/:id/coupon",
            post(coupons::apply_coupon).delete(coupons::remove_coupon),
        )
        .route("/orders/:id/payment", get(payments::get_order_payment))
        .route("/orders/:id/tracking", get(shipments::track_order))
        .route("/coupons/validate", post(coupons::validate_coupon))
        .route("/coupons/public", get(coupons::public_coupons))
        .route("/payments/providers", get(payments::providers))
        .route("/payments/prepare", post(payments::prepare_payment))
        .route("/payments/complete", post(payments::complete_payment))
        .route("/payments/:id/cancel", post(payments::cancel_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route(
            "/order-items/:id/downloads",
            post(downloads::create_access).get(downloads::list_for_item),
        )
        .route(
            "/order-items/:id/files/:file_id/url",
            post(downloads::generate_url),
        )
        .route("/downloads", get(downloads::list_downloads))
        .route("/downloads/:token", get(downloads::serve_download))
        .route("/shipping/carriers", get(shipments::carriers));

    let seller = Router::new()
        .route("/seller/orders", get(orders::list_seller_orders))
        .route("/seller/orders/:id/shipping", post(shipments::register_shipping))
        .route("/seller/orders/:id/delivered", post(shipments::mark_delivered))
        .route("/seller/settlements", get(settlements::list_own))
        .route("/seller/settlements/summary", get(settlements::summary))
        .route("/seller/settlements/:id", get(settlements::get_own));

    let admin = Router::new()
        .route("/admin/orders/:id/status", put(admin::update_order_status))
        .route("/admin/orders/:id/shipping/refresh", post(admin::refresh_shipping))
        .route(
            "/admin/coupons",
            post(admin::create_coupon).get(admin::list_coupons),
        )
        .route(
            "/admin/coupons/:id",
            get(admin::get_coupon)
                .put(admin::update_coupon)
                .delete(admin::delete_coupon),
        )
        .route(
            "/admin/settlements",
            post(admin::create_settlement).get(admin::list_settlements),
        )
        .route("/admin/settlements/pending", get(admin::pending_settlement_items))
        .route("/admin/settlements/:id", get(admin::get_settlement))
        .route(
            "/admin/settlements/:id/process",
            post(admin::process_settlement),
        );

    // Provider callbacks carry no caller token; they are signature-checked instead.
    let webhooks = Router::new().route(
        "/payments/webhooks/:provider",
        post(payment_webhooks::payment_webhook),
    );

    Router::new()
        .merge(buyer)
        .merge(seller)
        .merge(admin)
        .merge(webhooks)
}

fn cors_layer(config: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins()
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    if origins.is_empty() {
        base.allow_origin(Any)
    } else {
        base.allow_origin(origins)
    }
}

/// Full application router with request-id, tracing, timeout and CORS layers.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api_v1_routes())
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(TraceLayer::new_for_http().make_span_with(RequestSpanMaker))
        .layer(axum::middleware::from_fn(request_context::scope_request))
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .with_state(state)
}
