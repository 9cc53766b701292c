//! Payment provider adapters.
//!
//! Each provider implements [`Gateway`]; the payment service looks the
//! adapter up in a [`GatewayRegistry`] keyed by [`PgProvider`] and never
//! talks to a provider directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::GatewaysConfig;
use crate::entities::payment::{PaymentMethod, PaymentStatus, PgProvider};
use crate::errors::ServiceError;

pub mod inicis;
pub mod kakaopay;
pub mod tosspayments;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway not registered: {0}")]
    NotRegistered(PgProvider),
    #[error("invalid payment amount")]
    InvalidAmount,
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("payment not found at provider")]
    PaymentNotFound,
    #[error("cancel rejected by provider: {0}")]
    CancelRejected(String),
    #[error("invalid webhook payload")]
    InvalidWebhook,
    #[error("provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotRegistered(p) => {
                ServiceError::InvalidInput(format!("payment provider {} is not enabled", p))
            }
            GatewayError::InvalidAmount => ServiceError::InvalidInput(err.to_string()),
            GatewayError::InvalidWebhook => ServiceError::InvalidInput(err.to_string()),
            GatewayError::PaymentFailed(_) | GatewayError::CancelRejected(_) => {
                ServiceError::PaymentFailed(err.to_string())
            }
            GatewayError::PaymentNotFound
            | GatewayError::Transport(_)
            | GatewayError::Decode(_) => ServiceError::ExternalServiceError(err.to_string()),
        }
    }
}

/// Order context handed to a provider when opening its payment window.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub order_id: i64,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub product_name: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub buyer_phone: String,
    pub payment_method: PaymentMethod,
    pub return_url: String,
    pub cancel_url: String,
    pub notify_url: Option<String>,
}

/// Launch data for the client-side payment window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepareResponse {
    pub pg_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_scheme: Option<String>,
    /// Provider transaction opened at prepare time, when the provider issues one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_tid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteRequest {
    pub order_id: i64,
    pub pg_tid: String,
    pub pg_order_id: String,
    pub amount: Decimal,
    /// Provider callback parameters as received by the client, if any.
    pub raw_response: Option<String>,
    /// Transaction stored when the payment was prepared.
    pub ready_tid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDetails {
    pub company: String,
    pub number: String,
    pub card_type: String,
    pub install_month: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAccount {
    pub bank_name: String,
    pub account_number: String,
    pub holder: String,
    pub due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CompleteResponse {
    pub success: bool,
    pub pg_tid: String,
    pub pg_order_id: String,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    /// `Paid`, or `Ready` while a virtual-account deposit is outstanding.
    pub status: PaymentStatus,
    pub card: Option<CardDetails>,
    pub vbank: Option<VirtualAccount>,
    pub pg_fee: Option<Decimal>,
    pub message: Option<String>,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub pg_tid: String,
    pub pg_order_id: String,
    pub cancel_amount: Decimal,
    pub total_amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CancelResponse {
    pub success: bool,
    pub cancelled_amount: Decimal,
    pub remaining_amount: Decimal,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub raw_response: Option<String>,
}

/// Provider callback normalised to our payment states.
#[derive(Debug, Clone)]
pub struct WebhookResult {
    pub event_type: String,
    pub pg_tid: Option<String>,
    pub pg_order_id: Option<String>,
    pub amount: Option<Decimal>,
    pub status: PaymentStatus,
    pub vbank: Option<VirtualAccount>,
    pub raw: String,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn provider(&self) -> PgProvider;

    async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse, GatewayError>;

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, GatewayError>;

    async fn cancel(&self, req: &CancelRequest) -> Result<CancelResponse, GatewayError>;

    async fn handle_webhook(&self, payload: &[u8]) -> Result<WebhookResult, GatewayError>;

    /// Confirms with the provider that `pg_tid` was charged exactly `amount`.
    async fn verify(&self, pg_tid: &str, amount: Decimal) -> Result<(), GatewayError>;
}

#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PgProvider, Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every provider that has a config section.
    pub fn from_config(config: &GatewaysConfig) -> Result<Self, GatewayError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut registry = Self::new();
        if let Some(toss) = &config.toss {
            registry.register(Arc::new(tosspayments::TossPaymentsGateway::new(
                toss.clone(),
                timeout,
            )?));
        }
        if let Some(inicis) = &config.inicis {
            registry.register(Arc::new(inicis::InicisGateway::new(inicis.clone())));
        }
        if let Some(kakao) = &config.kakaopay {
            registry.register(Arc::new(kakaopay::KakaoPayGateway::new(
                kakao.clone(),
                timeout,
            )?));
        }
        info!(providers = ?registry.providers(), "payment gateways registered");
        Ok(registry)
    }

    pub fn register(&mut self, gateway: Arc<dyn Gateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn get(&self, provider: PgProvider) -> Result<Arc<dyn Gateway>, GatewayError> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or(GatewayError::NotRegistered(provider))
    }

    /// Registered providers, sorted by name.
    pub fn providers(&self) -> Vec<PgProvider> {
        let mut providers: Vec<_> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.to_string());
        providers
    }
}

/// Provider-side order id: `{prefix}_{order_number}_{nanos mod 10^6}`.
pub(crate) fn provider_order_id(prefix: &str, order_number: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        order_number,
        Utc::now().timestamp_subsec_nanos() % 1_000_000
    )
}

/// Whole-unit amount as providers expect it on the wire.
pub(crate) fn whole_amount(amount: Decimal) -> i64 {
    amount.round_dp(0).to_i64().unwrap_or_default()
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
