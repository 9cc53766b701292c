use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::{
    http_client, provider_order_id, whole_amount, CancelRequest, CancelResponse, CardDetails,
    CompleteRequest, CompleteResponse, Gateway, GatewayError, PrepareRequest, PrepareResponse,
    WebhookResult,
};
use crate::entities::payment::{PaymentMethod, PaymentStatus, PgProvider};

const FEE_RATE: Decimal = dec!(0.033);
const MAX_ITEM_NAME: usize = 100;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KakaoPayConfig {
    /// Merchant code; `TC0ONETIME` selects the test environment.
    pub cid: String,
    pub admin_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://kapi.kakao.com".to_string()
}

/// KakaoPay single payment.
///
/// `ready` returns a transaction id that `approve` needs alongside the
/// `pg_token` the buyer brings back. The id is handed back as the prepared
/// payment's `pg_tid` and stored with it, so approval works from any process.
pub struct KakaoPayGateway {
    config: KakaoPayConfig,
    client: reqwest::Client,
}

impl KakaoPayGateway {
    pub fn new(config: KakaoPayConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        on_error: fn(String) -> GatewayError,
    ) -> Result<(T, String), GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.config.api_base.trim_end_matches('/'), path))
            .header("Authorization", format!("KakaoAK {}", self.config.admin_key))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let reason = serde_json::from_str::<KakaoError>(&body)
                .map(|e| format!("{} - {}", e.code, e.msg))
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(on_error(reason));
        }
        let parsed = serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok((parsed, body))
    }
}

/// Appends `pg_order_id` to the approval URL so the callback can find its payment.
fn approval_url(return_url: &str, pg_order_id: &str) -> String {
    match Url::parse(return_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("pg_order_id", pg_order_id);
            url.into()
        }
        Err(_) => return_url.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    // KakaoPay reports local times without an offset.
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| (t - chrono::Duration::hours(9)).and_utc())
}

#[async_trait]
impl Gateway for KakaoPayGateway {
    fn provider(&self) -> PgProvider {
        PgProvider::Kakaopay
    }

    #[instrument(skip(self, req), fields(order_id = req.order_id))]
    async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        let pg_order_id = provider_order_id("KAKAO", &req.order_number);
        let form = [
            ("cid", self.config.cid.clone()),
            ("partner_order_id", pg_order_id.clone()),
            ("partner_user_id", req.order_id.to_string()),
            ("item_name", truncate(&req.product_name, MAX_ITEM_NAME)),
            ("quantity", "1".to_string()),
            ("total_amount", whole_amount(req.amount).to_string()),
            ("tax_free_amount", "0".to_string()),
            ("approval_url", approval_url(&req.return_url, &pg_order_id)),
            ("cancel_url", req.cancel_url.clone()),
            ("fail_url", req.cancel_url.clone()),
        ];

        let (ready, _) = self
            .post_form::<KakaoReady>("/v1/payment/ready", &form, GatewayError::PaymentFailed)
            .await?;
        debug!(%pg_order_id, tid = %ready.tid, "kakaopay payment ready");

        let extra = BTreeMap::from([
            ("android_app_scheme".to_string(), ready.android_app_scheme.clone()),
            ("ios_app_scheme".to_string(), ready.ios_app_scheme),
        ]);

        Ok(PrepareResponse {
            pg_order_id,
            redirect_url: Some(ready.next_redirect_pc_url),
            mobile_url: Some(ready.next_redirect_mobile_url),
            app_scheme: Some(ready.next_redirect_app_url),
            pg_tid: Some(ready.tid),
            extra,
            ..Default::default()
        })
    }

    #[instrument(skip(self, req), fields(pg_order_id = %req.pg_order_id))]
    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, GatewayError> {
        let tid = req
            .ready_tid
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::PaymentNotFound)?;

        // `pg_tid` carries the pg_token handed to the approval URL.
        let form = [
            ("cid", self.config.cid.clone()),
            ("tid", tid),
            ("partner_order_id", req.pg_order_id.clone()),
            ("partner_user_id", req.order_id.to_string()),
            ("pg_token", req.pg_tid.clone()),
        ];
        let (approved, raw) = self
            .post_form::<KakaoApprove>("/v1/payment/approve", &form, GatewayError::PaymentFailed)
            .await?;

        let total = Decimal::from(approved.amount.total);
        Ok(CompleteResponse {
            success: true,
            pg_tid: approved.tid,
            pg_order_id: approved.partner_order_id,
            amount: total,
            payment_method: PaymentMethod::Card,
            status: PaymentStatus::Paid,
            card: approved.card_info.map(|c| CardDetails {
                company: c.kakaopay_purchase_corp,
                number: String::new(),
                card_type: c.card_type,
                install_month: c.install_month,
            }),
            vbank: None,
            pg_fee: Some((total * FEE_RATE).round_dp(2)),
            message: None,
            raw_response: Some(raw),
        })
    }

    #[instrument(skip(self, req), fields(pg_tid = %req.pg_tid))]
    async fn cancel(&self, req: &CancelRequest) -> Result<CancelResponse, GatewayError> {
        let amount = if req.cancel_amount > Decimal::ZERO {
            req.cancel_amount
        } else {
            req.total_amount
        };
        let form = [
            ("cid", self.config.cid.clone()),
            ("tid", req.pg_tid.clone()),
            ("cancel_amount", whole_amount(amount).to_string()),
            ("cancel_tax_free_amount", "0".to_string()),
        ];
        let (cancelled, raw) = self
            .post_form::<KakaoCancel>("/v1/payment/cancel", &form, GatewayError::CancelRejected)
            .await?;

        Ok(CancelResponse {
            success: true,
            cancelled_amount: Decimal::from(cancelled.canceled_amount.total),
            remaining_amount: Decimal::from(cancelled.amount.total - cancelled.canceled_amount.total),
            cancelled_at: cancelled.canceled_at.as_deref().and_then(parse_time),
            raw_response: Some(raw),
        })
    }

    /// KakaoPay has no push notifications; status is confirmed via `verify`.
    async fn handle_webhook(&self, _payload: &[u8]) -> Result<WebhookResult, GatewayError> {
        Err(GatewayError::InvalidWebhook)
    }

    async fn verify(&self, pg_tid: &str, amount: Decimal) -> Result<(), GatewayError> {
        let form = [("cid", self.config.cid.clone()), ("tid", pg_tid.to_string())];
        let (order, _) = self
            .post_form::<KakaoOrder>("/v1/payment/order", &form, |_| GatewayError::PaymentNotFound)
            .await?;
        if Decimal::from(order.amount.total) != amount {
            return Err(GatewayError::InvalidAmount);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct KakaoReady {
    tid: String,
    #[serde(default)]
    next_redirect_pc_url: String,
    #[serde(default)]
    next_redirect_mobile_url: String,
    #[serde(default)]
    next_redirect_app_url: String,
    #[serde(default)]
    android_app_scheme: String,
    #[serde(default)]
    ios_app_scheme: String,
}

#[derive(Debug, Default, Deserialize)]
struct KakaoAmount {
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Deserialize)]
struct KakaoCardInfo {
    #[serde(default)]
    kakaopay_purchase_corp: String,
    #[serde(default)]
    card_type: String,
    #[serde(default)]
    install_month: i32,
}

#[derive(Debug, Deserialize)]
struct KakaoApprove {
    tid: String,
    partner_order_id: String,
    amount: KakaoAmount,
    #[serde(default)]
    card_info: Option<KakaoCardInfo>,
}

#[derive(Debug, Deserialize)]
struct KakaoCancel {
    amount: KakaoAmount,
    canceled_amount: KakaoAmount,
    #[serde(default)]
    canceled_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KakaoOrder {
    #[serde(default)]
    amount: KakaoAmount,
}

#[derive(Debug, Deserialize)]
struct KakaoError {
    code: i64,
    msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(api_base: String) -> KakaoPayGateway {
        KakaoPayGateway::new(
            KakaoPayConfig {
                cid: "TC0ONETIME".into(),
                admin_key: "admin".into(),
                api_base,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn prepare_request() -> PrepareRequest {
        PrepareRequest {
            order_id: 42,
            order_number: "20240101120000000042".into(),
            amount: dec!(12000),
            currency: "KRW".into(),
            product_name: "Font license".into(),
            buyer_name: "Lee".into(),
            buyer_email: "lee@example.com".into(),
            buyer_phone: String::new(),
            payment_method: PaymentMethod::Card,
            return_url: "https://shop.example.com/pay/kakao?x=1".into(),
            cancel_url: "https://shop.example.com/pay/cancel".into(),
            notify_url: None,
        }
    }

    async fn mount_ready(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/payment/ready"))
            .and(header("authorization", "KakaoAK admin"))
            .and(body_string_contains("partner_user_id=42"))
            .and(body_string_contains("total_amount=12000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tid": "T1001",
                "next_redirect_pc_url": "https://online-pay.kakao.com/pc",
                "next_redirect_mobile_url": "https://online-pay.kakao.com/mobile",
                "next_redirect_app_url": "https://online-pay.kakao.com/app",
                "android_app_scheme": "kakaotalk://a",
                "ios_app_scheme": "kakaotalk://i"
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn ready_then_approve() {
        let server = MockServer::start().await;
        mount_ready(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/payment/approve"))
            .and(body_string_contains("tid=T1001"))
            .and(body_string_contains("partner_user_id=42"))
            .and(body_string_contains("pg_token=tok_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tid": "T1001",
                "partner_order_id": "ignored",
                "amount": {"total": 12000},
                "card_info": {"kakaopay_purchase_corp": "Shinhan", "card_type": "credit", "install_month": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let prepared = gateway(server.uri()).prepare(&prepare_request()).await.unwrap();
        assert_eq!(prepared.redirect_url.as_deref(), Some("https://online-pay.kakao.com/pc"));
        assert_eq!(prepared.pg_tid.as_deref(), Some("T1001"));

        // approval goes through a fresh instance holding no state from ready
        let res = gateway(server.uri())
            .complete(&CompleteRequest {
                order_id: 42,
                pg_tid: "tok_1".into(),
                pg_order_id: prepared.pg_order_id.clone(),
                amount: dec!(12000),
                raw_response: None,
                ready_tid: prepared.pg_tid.clone(),
            })
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.pg_tid, "T1001");
        assert_eq!(res.card.unwrap().company, "Shinhan");
        assert_eq!(res.pg_fee, Some(dec!(396)));
    }

    #[tokio::test]
    async fn approve_without_ready_tid_is_not_found() {
        let gw = gateway("http://unused".into());
        let res = gw
            .complete(&CompleteRequest {
                pg_tid: "tok".into(),
                pg_order_id: "KAKAO_x_1".into(),
                amount: dec!(1),
                raw_response: None,
                ..Default::default()
            })
            .await;
        assert!(matches!(res, Err(GatewayError::PaymentNotFound)));
    }

    #[tokio::test]
    async fn ready_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment/ready"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"code": -780, "msg": "approval failure"})))
            .mount(&server)
            .await;

        match gateway(server.uri()).prepare(&prepare_request()).await {
            Err(GatewayError::PaymentFailed(msg)) => assert!(msg.contains("-780")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_reports_remaining() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment/cancel"))
            .and(body_string_contains("cancel_amount=2000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "amount": {"total": 12000},
                "canceled_amount": {"total": 2000},
                "canceled_at": "2024-05-01T10:00:00"
            })))
            .mount(&server)
            .await;

        let res = gateway(server.uri())
            .cancel(&CancelRequest {
                pg_tid: "T1001".into(),
                pg_order_id: "KAKAO_1_1".into(),
                cancel_amount: dec!(2000),
                total_amount: dec!(12000),
                reason: "partial".into(),
            })
            .await
            .unwrap();
        assert_eq!(res.cancelled_amount, dec!(2000));
        assert_eq!(res.remaining_amount, dec!(10000));
        assert_eq!(res.cancelled_at.unwrap().to_rfc3339(), "2024-05-01T01:00:00+00:00");
    }

    #[tokio::test]
    async fn verify_and_webhooks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"amount": {"total": 5000}})))
            .mount(&server)
            .await;

        let gw = gateway(server.uri());
        assert!(gw.verify("T1", dec!(5000)).await.is_ok());
        assert!(matches!(gw.verify("T1", dec!(5001)).await, Err(GatewayError::InvalidAmount)));
        assert!(matches!(gw.handle_webhook(b"{}").await, Err(GatewayError::InvalidWebhook)));
    }

    #[test]
    fn approval_url_keeps_existing_query() {
        assert_eq!(
            approval_url("https://shop.example.com/cb?x=1", "KAKAO_1_2"),
            "https://shop.example.com/cb?x=1&pg_order_id=KAKAO_1_2"
        );
        assert_eq!(approval_url("not a url", "id"), "not a url");
    }
}
