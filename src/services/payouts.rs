//! Seller payout transfer, invoked when a settlement is processed.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::SettlementConfig;
use crate::errors::ServiceError;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("payout rejected: {0}")]
    Rejected(String),
    #[error("payout endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<PayoutError> for ServiceError {
    fn from(err: PayoutError) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutInstruction {
    pub settlement_id: i64,
    pub seller_id: i64,
    pub amount: Decimal,
    pub bank_name: Option<String>,
    pub bank_account: Option<String>,
    pub bank_holder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PayoutReceipt {
    pub reference: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Payout: Send + Sync {
    async fn send(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, PayoutError>;
}

/// Operator-confirmed transfer: the money moves outside the system and the
/// settlement records an operator reference.
#[derive(Debug, Default, Clone)]
pub struct ManualPayout;

#[async_trait]
impl Payout for ManualPayout {
    async fn send(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, PayoutError> {
        Ok(PayoutReceipt {
            reference: format!(
                "MANUAL-{}-{}",
                instruction.settlement_id,
                Utc::now().format("%Y%m%d%H%M%S")
            ),
        })
    }
}

/// Posts the instruction as JSON to a transfer endpoint, which answers with
/// `{"reference": "..."}`.
pub struct HttpPayout {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPayout {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PayoutError> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl Payout for HttpPayout {
    #[instrument(skip(self, instruction), fields(settlement_id = instruction.settlement_id))]
    async fn send(&self, instruction: &PayoutInstruction) -> Result<PayoutReceipt, PayoutError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", format!("settlement-{}", instruction.settlement_id))
            .json(instruction)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PayoutError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        let receipt = response.json::<PayoutReceipt>().await?;
        info!(reference = %receipt.reference, "payout accepted");
        Ok(receipt)
    }
}

/// `HttpPayout` when an endpoint is configured, manual confirmation otherwise.
pub fn payout_from_config(config: &SettlementConfig) -> Result<Arc<dyn Payout>, PayoutError> {
    Ok(match &config.payout_endpoint {
        Some(endpoint) => Arc::new(HttpPayout::new(
            endpoint.clone(),
            Duration::from_secs(config.payout_timeout_secs),
        )?),
        None => Arc::new(ManualPayout),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instruction() -> PayoutInstruction {
        PayoutInstruction {
            settlement_id: 7,
            seller_id: 3,
            amount: dec!(91700),
            bank_name: Some("KB".into()),
            bank_account: Some("123-456".into()),
            bank_holder: Some("Seller".into()),
        }
    }

    #[tokio::test]
    async fn manual_payouts_reference_the_settlement() {
        let receipt = ManualPayout.send(&instruction()).await.unwrap();
        assert!(receipt.reference.starts_with("MANUAL-7-"));
    }

    #[tokio::test]
    async fn http_payout_returns_the_remote_reference() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payouts"))
            .and(header("Idempotency-Key", "settlement-7"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"reference": "TR-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let payout = HttpPayout::new(format!("{}/payouts", server.uri()), Duration::from_secs(5)).unwrap();
        let receipt = payout.send(&instruction()).await.unwrap();
        assert_eq!(receipt.reference, "TR-1");
    }

    #[tokio::test]
    async fn http_payout_surfaces_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("account closed"))
            .mount(&server)
            .await;

        let payout = HttpPayout::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = payout.send(&instruction()).await.unwrap_err();
        assert!(matches!(&err, PayoutError::Rejected(msg) if msg.contains("account closed")));
        assert!(ServiceError::from(err).is_retryable());
    }

    #[test]
    fn config_without_endpoint_uses_manual_payouts() {
        assert!(payout_from_config(&SettlementConfig::default()).is_ok());
    }
}
