use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{instrument, warn};

use super::{
    http_client, provider_order_id, whole_amount, CancelRequest, CancelResponse, CardDetails,
    CompleteRequest, CompleteResponse, Gateway, GatewayError, PrepareRequest, PrepareResponse,
    VirtualAccount, WebhookResult,
};
use crate::entities::payment::{PaymentMethod, PaymentStatus, PgProvider};

/// Estimated card fee; Toss reports actual fees separately.
const ESTIMATED_FEE_RATE: Decimal = dec!(0.029);

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TossConfig {
    /// Handed to the browser widget
    pub client_key: String,
    pub secret_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.tosspayments.com".to_string()
}

pub struct TossPaymentsGateway {
    config: TossConfig,
    client: reqwest::Client,
}

impl TossPaymentsGateway {
    pub fn new(config: TossConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn read_payment(
        &self,
        response: reqwest::Response,
        on_error: fn(String) -> GatewayError,
    ) -> Result<(TossPayment, String), GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let reason = serde_json::from_str::<TossError>(&body)
                .map(|e| format!("{} - {}", e.code, e.message))
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(on_error(reason));
        }
        let payment = serde_json::from_str::<TossPayment>(&body)
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok((payment, body))
    }
}

#[async_trait]
impl Gateway for TossPaymentsGateway {
    fn provider(&self) -> PgProvider {
        PgProvider::Tosspayments
    }

    async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        // The payment window is opened by the browser widget; we only hand out its parameters.
        let pg_order_id = provider_order_id("TOSS", &req.order_number);
        let extra = [
            ("clientKey", self.config.client_key.clone()),
            ("orderId", pg_order_id.clone()),
            ("amount", whole_amount(req.amount).to_string()),
            ("orderName", req.product_name.clone()),
            ("customerName", req.buyer_name.clone()),
            ("customerEmail", req.buyer_email.clone()),
            ("successUrl", req.return_url.clone()),
            ("failUrl", req.cancel_url.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(PrepareResponse {
            pg_order_id,
            merchant_id: Some(self.config.client_key.clone()),
            extra,
            ..Default::default()
        })
    }

    #[instrument(skip(self, req), fields(pg_order_id = %req.pg_order_id))]
    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/payments/confirm"))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .json(&json!({
                "paymentKey": req.pg_tid,
                "orderId": req.pg_order_id,
                "amount": whole_amount(req.amount),
            }))
            .send()
            .await?;

        let (payment, raw) = self.read_payment(response, GatewayError::PaymentFailed).await?;
        Ok(payment.into_complete_response(raw))
    }

    #[instrument(skip(self, req), fields(pg_tid = %req.pg_tid))]
    async fn cancel(&self, req: &CancelRequest) -> Result<CancelResponse, GatewayError> {
        let mut body = json!({ "cancelReason": req.reason });
        if req.cancel_amount > Decimal::ZERO && req.cancel_amount < req.total_amount {
            body["cancelAmount"] = json!(whole_amount(req.cancel_amount));
        }

        let response = self
            .client
            .post(self.url(&format!("/v1/payments/{}/cancel", req.pg_tid)))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .json(&body)
            .send()
            .await?;

        let (payment, raw) = self.read_payment(response, GatewayError::CancelRejected).await?;
        let cancelled: Decimal = payment.cancels.iter().map(|c| c.cancel_amount).sum();

        Ok(CancelResponse {
            success: true,
            cancelled_amount: cancelled,
            remaining_amount: payment.total_amount - cancelled,
            cancelled_at: payment.canceled_at.as_deref().and_then(parse_time),
            raw_response: Some(raw),
        })
    }

    async fn handle_webhook(&self, payload: &[u8]) -> Result<WebhookResult, GatewayError> {
        let webhook: TossWebhook =
            serde_json::from_slice(payload).map_err(|_| GatewayError::InvalidWebhook)?;
        let data = webhook.data;

        let (status, vbank) = match webhook.event_type.as_str() {
            "PAYMENT_STATUS_CHANGED" => match data.status.as_deref() {
                Some("DONE") => (PaymentStatus::Paid, None),
                Some("CANCELED") => (PaymentStatus::Cancelled, None),
                Some("WAITING_FOR_DEPOSIT") => (
                    PaymentStatus::Ready,
                    data.virtual_account.as_ref().map(TossVirtualAccount::to_account),
                ),
                Some("PARTIAL_CANCELED") => (PaymentStatus::PartialCancelled, None),
                _ => (PaymentStatus::Failed, None),
            },
            "DEPOSIT_CALLBACK" => (PaymentStatus::Paid, None),
            other => {
                warn!(event_type = other, "unsupported toss webhook");
                return Err(GatewayError::InvalidWebhook);
            }
        };

        Ok(WebhookResult {
            event_type: webhook.event_type,
            pg_tid: data.payment_key,
            pg_order_id: data.order_id,
            amount: data.total_amount,
            status,
            vbank,
            raw: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    async fn verify(&self, pg_tid: &str, amount: Decimal) -> Result<(), GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payments/{}", pg_tid)))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::PaymentNotFound);
        }
        let payment: TossPayment = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        if payment.total_amount != amount {
            return Err(GatewayError::InvalidAmount);
        }
        if convert_status(&payment.status) != PaymentStatus::Paid {
            return Err(GatewayError::PaymentFailed(format!(
                "payment is {} at the provider",
                payment.status
            )));
        }
        Ok(())
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn convert_method(method: &str) -> PaymentMethod {
    match method {
        "카드" | "CARD" => PaymentMethod::Card,
        "계좌이체" | "TRANSFER" => PaymentMethod::Bank,
        "가상계좌" | "VIRTUAL_ACCOUNT" => PaymentMethod::Virtual,
        "휴대폰" | "MOBILE_PHONE" => PaymentMethod::Phone,
        _ => PaymentMethod::Card,
    }
}

fn convert_status(status: &str) -> PaymentStatus {
    match status {
        "DONE" => PaymentStatus::Paid,
        "CANCELED" => PaymentStatus::Cancelled,
        "PARTIAL_CANCELED" => PaymentStatus::PartialCancelled,
        "WAITING_FOR_DEPOSIT" => PaymentStatus::Ready,
        _ => PaymentStatus::Failed,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossPayment {
    payment_key: String,
    order_id: String,
    status: String,
    #[serde(default)]
    method: Option<String>,
    total_amount: Decimal,
    #[serde(default)]
    canceled_at: Option<String>,
    #[serde(default)]
    card: Option<TossCard>,
    #[serde(default)]
    virtual_account: Option<TossVirtualAccount>,
    #[serde(default)]
    cancels: Vec<TossCancel>,
}

impl TossPayment {
    fn into_complete_response(self, raw: String) -> CompleteResponse {
        let status = convert_status(&self.status);
        CompleteResponse {
            success: matches!(status, PaymentStatus::Paid | PaymentStatus::Ready),
            pg_tid: self.payment_key,
            pg_order_id: self.order_id,
            amount: self.total_amount,
            payment_method: self.method.as_deref().map(convert_method).unwrap_or(PaymentMethod::Card),
            status,
            card: self.card.map(|c| CardDetails {
                company: c.issuer_code,
                number: c.number,
                card_type: c.card_type,
                install_month: c.installment_plan_months,
            }),
            vbank: self.virtual_account.as_ref().map(TossVirtualAccount::to_account),
            pg_fee: Some((self.total_amount * ESTIMATED_FEE_RATE).round_dp(2)),
            message: Some(self.status),
            raw_response: Some(raw),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossCard {
    #[serde(default)]
    issuer_code: String,
    #[serde(default)]
    number: String,
    #[serde(default)]
    installment_plan_months: i32,
    #[serde(default)]
    card_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossVirtualAccount {
    #[serde(default)]
    account_number: String,
    #[serde(default)]
    bank_code: String,
    #[serde(default)]
    customer_name: String,
    #[serde(default)]
    due_date: Option<String>,
}

impl TossVirtualAccount {
    fn to_account(&self) -> VirtualAccount {
        VirtualAccount {
            bank_name: self.bank_code.clone(),
            account_number: self.account_number.clone(),
            holder: self.customer_name.clone(),
            due: self.due_date.as_deref().and_then(parse_time),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossCancel {
    cancel_amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct TossError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossWebhook {
    event_type: String,
    #[serde(default)]
    data: TossWebhookData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TossWebhookData {
    payment_key: Option<String>,
    order_id: Option<String>,
    status: Option<String>,
    total_amount: Option<Decimal>,
    virtual_account: Option<TossVirtualAccount>,
}
