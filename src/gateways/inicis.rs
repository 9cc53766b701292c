use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;
use url::Url;

use super::{
    provider_order_id, whole_amount, CancelRequest, CancelResponse, CardDetails, CompleteRequest,
    CompleteResponse, Gateway, GatewayError, PrepareRequest, PrepareResponse, VirtualAccount,
    WebhookResult,
};
use crate::entities::payment::{PaymentMethod, PaymentStatus, PgProvider};

const FEE_RATE: Decimal = dec!(0.033);
const KST_OFFSET_SECS: i32 = 9 * 3600;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InicisConfig {
    /// MID
    pub merchant_id: String,
    pub sign_key: String,
    #[serde(default)]
    pub sandbox: bool,
}

/// KG Inicis standard payment.
///
/// The payment window posts its result back to the client, which forwards
/// the callback parameters as `CompleteRequest::raw_response`. Cancellation
/// is acknowledged locally; refunds are executed from the merchant console.
pub struct InicisGateway {
    config: InicisConfig,
}

impl InicisGateway {
    pub fn new(config: InicisConfig) -> Self {
        Self { config }
    }

    fn base_url(&self) -> &'static str {
        if self.config.sandbox {
            "https://stgstdpay.inicis.com"
        } else {
            "https://stdpay.inicis.com"
        }
    }

    fn signature(&self, pg_order_id: &str, amount: Decimal, timestamp: &str) -> String {
        sign(
            &self.config.merchant_id,
            pg_order_id,
            whole_amount(amount),
            timestamp,
            &self.config.sign_key,
        )
    }

    fn m_key(&self) -> String {
        hex::encode(Sha256::digest(self.config.sign_key.as_bytes()))
    }
}

/// `sha256(mid + oid + price + timestamp + signKey)` as lowercase hex.
fn sign(mid: &str, oid: &str, price: i64, timestamp: &str, sign_key: &str) -> String {
    let data = format!("{}{}{}{}{}", mid, oid, price, timestamp, sign_key);
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn pay_method_code(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Card => "Card",
        PaymentMethod::Bank => "DirectBank",
        PaymentMethod::Virtual => "VBank",
        PaymentMethod::Phone => "HPP",
    }
}

fn method_from_code(code: &str) -> PaymentMethod {
    match code {
        "DirectBank" => PaymentMethod::Bank,
        "VBank" => PaymentMethod::Virtual,
        "HPP" => PaymentMethod::Phone,
        _ => PaymentMethod::Card,
    }
}

fn card_name(code: &str) -> &'static str {
    match code {
        "01" => "KEB",
        "02" | "08" => "Lotte",
        "03" | "07" => "Hyundai",
        "04" | "12" => "Samsung",
        "06" => "Shinhan",
        "11" => "BC",
        "13" => "Kwangju Bank",
        "14" => "Jeonbuk Bank",
        "15" => "Jeju Bank",
        "21" => "KB Kookmin",
        "22" => "NH Nonghyup",
        "23" => "Woori",
        "24" => "Citi",
        "25" => "KDB",
        "26" => "Suhyup",
        _ => "Card",
    }
}

/// Keeps the first and last four digits of a card number.
pub fn mask_card_number(number: &str) -> String {
    if number.len() < 8 {
        return number.to_string();
    }
    let digits: String = number.chars().filter(|c| *c != '-').collect();
    if digits.len() >= 16 {
        format!("{}-****-****-{}", &digits[..4], &digits[12..])
    } else {
        format!("****-****-****-{}", &digits[digits.len().saturating_sub(4)..])
    }
}

/// Callback parameters are flat; numbers are normalised to strings.
fn callback_params(raw: Option<&str>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = raw.and_then(|r| serde_json::from_str::<Value>(r).ok()) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Number(n) => Some((k, n.to_string())),
            _ => None,
        })
        .collect()
}

fn card_details(params: &BTreeMap<String, String>) -> Option<CardDetails> {
    let code = params.get("CARD_Code")?;
    Some(CardDetails {
        company: card_name(code).to_string(),
        number: params
            .get("CARD_Num")
            .map(|n| mask_card_number(n))
            .unwrap_or_default(),
        card_type: if params.get("CARD_CheckFlag").map(String::as_str) == Some("1") {
            "check".into()
        } else {
            "credit".into()
        },
        install_month: params
            .get("CARD_Quota")
            .and_then(|q| q.parse().ok())
            .unwrap_or(0),
    })
}

/// `VACT_Date` (yyyyMMdd) and optional `VACT_Time` (HHmmss), Korea time.
fn vbank_due(date: Option<&String>, time: Option<&String>) -> Option<DateTime<Utc>> {
    let date = date?;
    let time = time.map(String::as_str).unwrap_or("235959");
    let naive = NaiveDateTime::parse_from_str(&format!("{}{}", date, time), "%Y%m%d%H%M%S").ok()?;
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS)?;
    naive
        .and_local_timezone(kst)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn vbank_details(params: &BTreeMap<String, String>) -> Option<VirtualAccount> {
    let number = params.get("VACT_Num")?;
    Some(VirtualAccount {
        bank_name: params
            .get("VACT_BankName")
            .or_else(|| params.get("VACT_BankCode"))
            .cloned()
            .unwrap_or_default(),
        account_number: number.clone(),
        holder: params.get("VACT_Name").cloned().unwrap_or_default(),
        due: vbank_due(params.get("VACT_Date"), params.get("VACT_Time")),
    })
}

#[async_trait]
impl Gateway for InicisGateway {
    fn provider(&self) -> PgProvider {
        PgProvider::Inicis
    }

    async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        let pg_order_id = provider_order_id("INI", &req.order_number);
        let timestamp = (Utc::now() + chrono::Duration::seconds(i64::from(KST_OFFSET_SECS)))
            .format("%Y%m%d%H%M%S")
            .to_string();
        let signature = self.signature(&pg_order_id, req.amount, &timestamp);
        let m_key = self.m_key();
        let method = pay_method_code(req.payment_method);
        let price = whole_amount(req.amount).to_string();

        let params = [
            ("gopaymethod", method),
            ("mid", self.config.merchant_id.as_str()),
            ("oid", pg_order_id.as_str()),
            ("price", price.as_str()),
            ("goodname", req.product_name.as_str()),
            ("buyername", req.buyer_name.as_str()),
            ("buyertel", req.buyer_phone.as_str()),
            ("buyeremail", req.buyer_email.as_str()),
            ("returnUrl", req.return_url.as_str()),
            ("closeUrl", req.cancel_url.as_str()),
            ("timestamp", timestamp.as_str()),
            ("signature", signature.as_str()),
            ("mKey", m_key.as_str()),
        ];

        let build = |path: &str| {
            Url::parse_with_params(&format!("{}{}", self.base_url(), path), &params)
                .map(String::from)
                .map_err(|e| GatewayError::Decode(e.to_string()))
        };

        Ok(PrepareResponse {
            redirect_url: Some(build("/stdpay/ini_stdpay.php")?),
            mobile_url: Some(build("/mobile/INIpayMobile.php")?),
            merchant_id: Some(self.config.merchant_id.clone()),
            signature: Some(signature.clone()),
            timestamp: Some(timestamp.clone()),
            extra: BTreeMap::from([
                ("mKey".to_string(), m_key.clone()),
                ("gopaymethod".to_string(), method.to_string()),
            ]),
            pg_order_id,
            ..Default::default()
        })
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, GatewayError> {
        self.verify(&req.pg_tid, req.amount).await?;

        let params = callback_params(req.raw_response.as_deref());
        let base = CompleteResponse {
            success: false,
            pg_tid: params.get("tid").cloned().unwrap_or_else(|| req.pg_tid.clone()),
            pg_order_id: params
                .get("MOID")
                .cloned()
                .unwrap_or_else(|| req.pg_order_id.clone()),
            amount: req.amount,
            payment_method: PaymentMethod::Card,
            status: PaymentStatus::Failed,
            card: None,
            vbank: None,
            pg_fee: None,
            message: params.get("resultMsg").cloned(),
            raw_response: req.raw_response.clone(),
        };

        if let Some(code) = params.get("resultCode") {
            if code != "0000" {
                return Ok(base);
            }
        }

        if let Some(total) = params.get("TotPrice") {
            let reported = Decimal::from_str(total).map_err(|_| GatewayError::InvalidAmount)?;
            if reported != req.amount {
                return Err(GatewayError::InvalidAmount);
            }
        }

        let payment_method = params
            .get("payMethod")
            .map(|m| method_from_code(m))
            .unwrap_or(PaymentMethod::Card);

        let (status, card, vbank) = if payment_method == PaymentMethod::Virtual {
            (PaymentStatus::Ready, None, vbank_details(&params))
        } else {
            (PaymentStatus::Paid, card_details(&params), None)
        };

        Ok(CompleteResponse {
            success: true,
            payment_method,
            status,
            card,
            vbank,
            pg_fee: Some((req.amount * FEE_RATE).round_dp(2)),
            ..base
        })
    }

    async fn cancel(&self, req: &CancelRequest) -> Result<CancelResponse, GatewayError> {
        if req.cancel_amount <= Decimal::ZERO || req.cancel_amount > req.total_amount {
            return Err(GatewayError::InvalidAmount);
        }
        let now = Utc::now();
        Ok(CancelResponse {
            success: true,
            cancelled_amount: req.cancel_amount,
            remaining_amount: req.total_amount - req.cancel_amount,
            cancelled_at: Some(now),
            raw_response: Some(
                serde_json::json!({
                    "resultCode": "00",
                    "tid": req.pg_tid,
                    "cancelAmount": whole_amount(req.cancel_amount),
                })
                .to_string(),
            ),
        })
    }

    async fn handle_webhook(&self, payload: &[u8]) -> Result<WebhookResult, GatewayError> {
        let data: Value = serde_json::from_slice(payload).map_err(|_| GatewayError::InvalidWebhook)?;
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

        let event_type = text("type").ok_or(GatewayError::InvalidWebhook)?;
        let (status, vbank) = match event_type.as_str() {
            "paid" | "vbank_paid" => (PaymentStatus::Paid, None),
            "cancelled" => (PaymentStatus::Cancelled, None),
            "vbank_issued" => (
                PaymentStatus::Ready,
                Some(VirtualAccount {
                    bank_name: text("vbankName").unwrap_or_default(),
                    account_number: text("vbankNum").unwrap_or_default(),
                    holder: text("vbankHolder").unwrap_or_default(),
                    due: None,
                }),
            ),
            _ => return Err(GatewayError::InvalidWebhook),
        };

        let amount = match data.get("price") {
            Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
            Some(Value::String(s)) => Decimal::from_str(s).ok(),
            _ => None,
        };

        Ok(WebhookResult {
            event_type,
            pg_tid: text("tid"),
            pg_order_id: text("oid"),
            amount,
            status,
            vbank,
            raw: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    async fn verify(&self, _pg_tid: &str, amount: Decimal) -> Result<(), GatewayError> {
        if amount <= Decimal::ZERO {
            return Err(GatewayError::InvalidAmount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> InicisGateway {
        InicisGateway::new(InicisConfig {
            merchant_id: "INIpayTest".into(),
            sign_key: "SU5JTElURV9UUklQTEVERVNfS0VZU1RS".into(),
            sandbox: true,
        })
    }

    fn prepare_request() -> PrepareRequest {
        PrepareRequest {
            order_id: 5,
            order_number: "20240101120000000001".into(),
            amount: dec!(1000),
            currency: "KRW".into(),
            product_name: "Sticker pack".into(),
            buyer_name: "Kim".into(),
            buyer_email: "kim@example.com".into(),
            buyer_phone: "010-0000-0000".into(),
            payment_method: PaymentMethod::Card,
            return_url: "https://shop.example.com/pay/return".into(),
            cancel_url: "https://shop.example.com/pay/close".into(),
            notify_url: None,
        }
    }

    #[test]
    fn signature_matches_known_vector() {
        assert_eq!(
            sign(
                "INIpayTest",
                "INI_20240101_5",
                1000,
                "20240101120000",
                "SU5JTElURV9UUklQTEVERVNfS0VZU1RS"
            ),
            "c0ffdc40f715dded37f38d281bcda2dceece7b583542e8b9bed09a38032d4333"
        );
        assert_eq!(
            gateway().m_key(),
            "3a9503069192f207491d4b19bd743fc249a761ed94246c8c42fed06c3cd15a33"
        );
    }

    #[tokio::test]
    async fn prepare_builds_signed_sandbox_urls() {
        let gw = gateway();
        let res = gw.prepare(&prepare_request()).await.unwrap();
        assert!(res.pg_order_id.starts_with("INI_20240101120000000001_"));

        let url = Url::parse(res.redirect_url.as_deref().unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("stgstdpay.inicis.com"));
        let query: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["oid"], res.pg_order_id);
        assert_eq!(query["price"], "1000");
        assert_eq!(query["gopaymethod"], "Card");
        let expected = gw.signature(&res.pg_order_id, dec!(1000), &query["timestamp"]);
        assert_eq!(query["signature"], expected);
        assert_eq!(res.signature.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn complete_reads_card_callback() {
        let raw = json!({
            "resultCode": "0000",
            "tid": "INIMX_123",
            "MOID": "INI_1_1",
            "TotPrice": "1000",
            "payMethod": "Card",
            "CARD_Code": "06",
            "CARD_Num": "1234567812345678",
            "CARD_Quota": "03",
            "CARD_CheckFlag": "1"
        });
        let res = gateway()
            .complete(&CompleteRequest {
                pg_tid: "INIMX_123".into(),
                pg_order_id: "INI_1_1".into(),
                amount: dec!(1000),
                raw_response: Some(raw.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.status, PaymentStatus::Paid);
        let card = res.card.unwrap();
        assert_eq!(card.company, "Shinhan");
        assert_eq!(card.number, "1234-****-****-5678");
        assert_eq!(card.card_type, "check");
        assert_eq!(card.install_month, 3);
        assert_eq!(res.pg_fee, Some(dec!(33)));
    }

    #[tokio::test]
    async fn complete_virtual_account_is_ready() {
        let raw = json!({
            "resultCode": "0000",
            "payMethod": "VBank",
            "VACT_Num": "110-123-456",
            "VACT_BankName": "Shinhan",
            "VACT_Name": "Market",
            "VACT_Date": "20240105",
            "VACT_Time": "235959"
        });
        let res = gateway()
            .complete(&CompleteRequest {
                pg_tid: "INIMX_9".into(),
                pg_order_id: "INI_9_1".into(),
                amount: dec!(1000),
                raw_response: Some(raw.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(res.status, PaymentStatus::Ready);
        let vbank = res.vbank.unwrap();
        assert_eq!(vbank.account_number, "110-123-456");
        assert_eq!(vbank.due.unwrap().to_rfc3339(), "2024-01-05T14:59:59+00:00");
    }

    #[tokio::test]
    async fn failed_result_code_is_unsuccessful() {
        let raw = json!({"resultCode": "01", "resultMsg": "card declined"});
        let res = gateway()
            .complete(&CompleteRequest {
                pg_tid: "t".into(),
                pg_order_id: "o".into(),
                amount: dec!(1000),
                raw_response: Some(raw.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!res.success);
        assert_eq!(res.message.as_deref(), Some("card declined"));
    }

    #[tokio::test]
    async fn reported_total_must_match() {
        let raw = json!({"resultCode": "0000", "TotPrice": 900});
        let err = gateway()
            .complete(&CompleteRequest {
                pg_tid: "t".into(),
                pg_order_id: "o".into(),
                amount: dec!(1000),
                raw_response: Some(raw.to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAmount));
    }

    #[tokio::test]
    async fn webhook_types() {
        let gw = gateway();
        let paid = gw
            .handle_webhook(json!({"type": "vbank_paid", "tid": "T1", "oid": "O1", "price": 1000}).to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert_eq!(paid.amount, Some(dec!(1000)));

        let issued = gw
            .handle_webhook(json!({"type": "vbank_issued", "oid": "O1", "vbankNum": "999"}).to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(issued.status, PaymentStatus::Ready);
        assert_eq!(issued.vbank.unwrap().account_number, "999");

        assert!(matches!(
            gw.handle_webhook(br#"{"type":"refund_requested"}"#).await,
            Err(GatewayError::InvalidWebhook)
        ));
    }

    #[test]
    fn card_masking() {
        assert_eq!(mask_card_number("1234-5678-1234-5678"), "1234-****-****-5678");
        assert_eq!(mask_card_number("123456789012"), "****-****-****-9012");
        assert_eq!(mask_card_number("1234"), "1234");
    }
}
