#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use marketplace_ledger::{
    auth::{JwtKeys, Role},
    build_router,
    config::AppConfig,
    db,
    entities::payment::{PaymentMethod, PaymentStatus, PgProvider},
    entities::{product, product_file},
    events::{self, EventHandler, EventMetrics, EventSender},
    gateways::{
        CancelRequest, CancelResponse, CompleteRequest, CompleteResponse, Gateway, GatewayError,
        GatewayRegistry, PrepareRequest, PrepareResponse, VirtualAccount, WebhookResult,
    },
    handlers::AppServices,
    services::payouts::{ManualPayout, Payout},
    AppState,
};

pub const JWT_SECRET: &str = "integration-test-jwt-secret-with-enough-length";
pub const BUYER: i64 = 100;
pub const OTHER_BUYER: i64 = 101;
pub const SELLER: i64 = 200;
pub const ADMIN: i64 = 1;

/// Scriptable stand-in for a payment provider, registered as Toss.
#[derive(Default)]
pub struct FakeGateway {
    decline: AtomicBool,
    confirmed_amount: Mutex<Option<Decimal>>,
    completions: AtomicUsize,
    last_completion: Mutex<Option<CompleteRequest>>,
    cancels: Mutex<Vec<CancelRequest>>,
    fail_cancel: AtomicBool,
    reject_verify: AtomicBool,
    ready_account: Mutex<Option<VirtualAccount>>,
}

impl FakeGateway {
    pub fn decline_next(&self) {
        self.decline.store(true, Ordering::SeqCst);
    }

    /// Makes the provider report `amount` instead of echoing the request.
    pub fn confirm_amount(&self, amount: Decimal) {
        *self.confirmed_amount.lock().unwrap() = Some(amount);
    }

    /// The next completion issues a virtual account instead of capturing.
    pub fn next_ready(&self, account: VirtualAccount) {
        *self.ready_account.lock().unwrap() = Some(account);
    }

    pub fn fail_next_cancel(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    /// Provider-side lookups deny every transaction from now on.
    pub fn reject_verification(&self) {
        self.reject_verify.store(true, Ordering::SeqCst);
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn last_completion(&self) -> Option<CompleteRequest> {
        self.last_completion.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<CancelRequest> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    fn provider(&self) -> PgProvider {
        PgProvider::Tosspayments
    }

    async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        Ok(PrepareResponse {
            pg_order_id: format!("FAKE_{}", req.order_number),
            pg_tid: Some(format!("ready-{}", req.order_number)),
            redirect_url: Some(format!("https://pay.test/checkout/{}", req.order_number)),
            ..Default::default()
        })
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<CompleteResponse, GatewayError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        *self.last_completion.lock().unwrap() = Some(req.clone());
        let declined = self.decline.swap(false, Ordering::SeqCst);
        let amount = self.confirmed_amount.lock().unwrap().unwrap_or(req.amount);
        let vbank = self.ready_account.lock().unwrap().take();
        let (payment_method, status) = match vbank {
            Some(_) => (PaymentMethod::Virtual, PaymentStatus::Ready),
            None => (PaymentMethod::Card, PaymentStatus::Paid),
        };
        Ok(CompleteResponse {
            success: !declined,
            pg_tid: req.pg_tid.clone(),
            pg_order_id: req.pg_order_id.clone(),
            amount,
            payment_method,
            status,
            card: None,
            vbank,
            pg_fee: None,
            message: declined.then(|| "card declined".to_string()),
            raw_response: Some(json!({ "tid": req.pg_tid }).to_string()),
        })
    }

    async fn cancel(&self, req: &CancelRequest) -> Result<CancelResponse, GatewayError> {
        self.cancels.lock().unwrap().push(req.clone());
        if self.fail_cancel.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::CancelRejected("already settled".to_string()));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok(CancelResponse {
            success: true,
            cancelled_amount: req.cancel_amount,
            remaining_amount: req.total_amount - req.cancel_amount,
            cancelled_at: Some(Utc::now()),
            raw_response: None,
        })
    }

    /// Accepts `{"event_type", "pg_tid", "pg_order_id", "amount", "status"}`.
    async fn handle_webhook(&self, payload: &[u8]) -> Result<WebhookResult, GatewayError> {
        let body: Value =
            serde_json::from_slice(payload).map_err(|_| GatewayError::InvalidWebhook)?;
        let status = body["status"]
            .as_str()
            .and_then(|s| s.parse::<PaymentStatus>().ok())
            .ok_or(GatewayError::InvalidWebhook)?;
        Ok(WebhookResult {
            event_type: body["event_type"].as_str().unwrap_or("PAYMENT").to_string(),
            pg_tid: body["pg_tid"].as_str().map(str::to_string),
            pg_order_id: body["pg_order_id"].as_str().map(str::to_string),
            amount: body["amount"].as_str().and_then(|a| a.parse().ok()),
            status,
            vbank: None,
            raw: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    async fn verify(&self, _pg_tid: &str, _amount: Decimal) -> Result<(), GatewayError> {
        if self.reject_verify.load(Ordering::SeqCst) {
            return Err(GatewayError::PaymentNotFound);
        }
        Ok(())
    }
}

pub struct TestOptions {
    pub webhook_secret: Option<String>,
    pub payout: Arc<dyn Payout>,
    pub shipping_fee: Decimal,
    /// Base URL of a stand-in parcel tracking API; enables live tracking.
    pub tracker_base: Option<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            payout: Arc::new(ManualPayout),
            shipping_fee: Decimal::from(3000),
            tracker_base: None,
        }
    }
}

/// Full application over a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    jwt: JwtKeys,
    pub files: TempDir,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for database");
        let db_path = db_dir.path().join("ledger.db");
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        cfg.public_base_url = "http://ledger.test".to_string();
        cfg.commerce.default_shipping_fee = options.shipping_fee;
        cfg.gateways.webhook_secret = options.webhook_secret;
        if let Some(base) = options.tracker_base {
            cfg.shipping.tracker_api_key = Some("test-tracker-key".to_string());
            cfg.shipping.tracker_api_base = base;
        }

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(EventMetrics)];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let gateway = Arc::new(FakeGateway::default());
        let mut registry = GatewayRegistry::new();
        registry.register(gateway.clone());

        let cfg = Arc::new(cfg);
        let services = AppServices::new(
            db_arc.clone(),
            cfg.clone(),
            Arc::new(registry),
            options.payout,
            event_sender,
        )
        .expect("services wire up");

        let state = AppState {
            db: db_arc,
            config: cfg.clone(),
            jwt: Arc::new(JwtKeys::new(&cfg.jwt_secret)),
            services,
        };

        Self {
            router: build_router(state.clone()),
            state,
            gateway,
            jwt: JwtKeys::new(JWT_SECRET),
            files: tempfile::tempdir().expect("temp dir for files"),
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn token(&self, user_id: i64, role: Role) -> String {
        self.jwt
            .issue(user_id, role, Duration::hours(1))
            .expect("sign test token")
    }

    pub fn buyer(&self) -> String {
        self.token(BUYER, Role::User)
    }

    pub fn seller(&self) -> String {
        self.token(SELLER, Role::Seller)
    }

    pub fn admin(&self) -> String {
        self.token(ADMIN, Role::Admin)
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// Raw body POST, used for provider callbacks.
    pub async fn post_raw(&self, uri: &str, body: Vec<u8>, headers: &[(&str, &str)]) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body)).expect("failed to build request"))
            .await
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(
        &self,
        product_type: product::ProductType,
        price: Decimal,
        stock: Option<i32>,
    ) -> product::Model {
        product::ActiveModel {
            seller_id: Set(SELLER),
            name: Set(format!("{} item", product_type)),
            product_type: Set(product_type),
            price: Set(price),
            currency: Set("KRW".to_string()),
            category_id: Set(Some(10)),
            stock_quantity: Set(stock),
            stock_status: Set(product::StockStatus::InStock),
            status: Set(product::ProductStatus::Published),
            download_limit: Set(Some(2)),
            download_expiry_days: Set(Some(30)),
            sales_count: Set(0),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    /// Attaches a file with `contents` stored under the app's temp dir.
    pub async fn seed_file(&self, product_id: i64, name: &str, contents: &[u8]) -> product_file::Model {
        let path = self.files.path().join(name);
        std::fs::write(&path, contents).expect("write product file");
        product_file::ActiveModel {
            product_id: Set(product_id),
            file_name: Set(name.to_string()),
            file_path: Set(path.display().to_string()),
            file_size: Set(contents.len() as i64),
            file_type: Set(Some("application/pdf".to_string())),
            display_name: Set(None),
            sort_order: Set(0),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product file")
    }

    /// Adds `quantity` of a product to the buyer's cart and checks out.
    pub async fn place_order(&self, token: &str, product_id: i64, quantity: i32) -> Value {
        let added = self
            .request(
                Method::POST,
                "/api/v1/cart",
                Some(json!({ "product_id": product_id, "quantity": quantity })),
                Some(token),
            )
            .await;
        assert!(added.status().is_success(), "add to cart: {}", added.status());

        let checkout = self
            .request(
                Method::POST,
                "/api/v1/orders",
                Some(json!({
                    "shipping_name": "Kim Minji",
                    "shipping_phone": "010-1234-5678",
                    "shipping_address": "12 Teheran-ro, Seoul",
                    "shipping_postal": "06236"
                })),
                Some(token),
            )
            .await;
        assert_eq!(checkout.status(), 201);
        read_json(checkout).await["data"].clone()
    }

    /// Prepares a Toss payment for the order and returns the response data.
    pub async fn prepare_payment(&self, token: &str, order_id: i64) -> Value {
        let prepared = self
            .request(
                Method::POST,
                "/api/v1/payments/prepare",
                Some(json!({
                    "order_id": order_id,
                    "pg_provider": "tosspayments",
                    "payment_method": "card",
                    "return_url": "https://shop.test/return"
                })),
                Some(token),
            )
            .await;
        assert_eq!(prepared.status(), 201);
        read_json(prepared).await["data"].clone()
    }

    pub async fn complete_payment(&self, token: &str, prepared: &Value, pg_tid: &str) -> Response {
        self.request(
            Method::POST,
            "/api/v1/payments/complete",
            Some(json!({
                "payment_id": prepared["payment_id"],
                "pg_tid": pg_tid,
                "pg_order_id": prepared["pg_order_id"],
                "amount": prepared["amount"]
            })),
            Some(token),
        )
        .await
    }

    /// Checkout plus a successful payment. Returns the order as stored.
    pub async fn paid_order(&self, token: &str, product_id: i64, quantity: i32) -> Value {
        let order = self.place_order(token, product_id, quantity).await;
        let order_id = order["id"].as_i64().expect("order id");
        let prepared = self.prepare_payment(token, order_id).await;
        let completed = self
            .complete_payment(token, &prepared, &format!("tid-{}", order_id))
            .await;
        assert_eq!(completed.status(), 200);
        order
    }

    pub async fn set_order_status(&self, order_id: i64, status: &str) {
        let admin = self.admin();
        let resp = self
            .request(
                Method::PUT,
                &format!("/api/v1/admin/orders/{}/status", order_id),
                Some(json!({ "status": status })),
                Some(&admin),
            )
            .await;
        assert_eq!(resp.status(), 200, "transition to {}", status);
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Decimal fields serialize as strings.
pub fn dec_of(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        other => other.to_string().parse().expect("decimal number"),
    }
}
