//! Provider notifications: signature checks and state reconciliation.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{read_json, TestApp, TestOptions};
use hmac::{Hmac, Mac};
use marketplace_ledger::entities::product::{self, ProductType};
use marketplace_ledger::gateways::VirtualAccount;
use marketplace_ledger::handlers::payment_webhooks::SIGNATURE_HEADER;
use rstest::rstest;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::{json, Value};
use sha2::Sha256;

const SECRET: &str = "webhook-signing-secret";
const TOSS_HOOK: &str = "/api/v1/payments/webhooks/tosspayments";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn signed_app() -> TestApp {
    TestApp::with_options(TestOptions {
        webhook_secret: Some(SECRET.to_string()),
        ..Default::default()
    })
    .await
}

/// A pending order with a prepared payment; returns (order id, prepared payment).
async fn pending_payment(app: &TestApp) -> (i64, Value) {
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(10000), None).await;
    let order = app.place_order(&buyer, ebook.id, 1).await;
    let order_id = order["id"].as_i64().unwrap();
    (order_id, app.prepare_payment(&buyer, order_id).await)
}

fn notification(prepared: &Value, status: &str, amount: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_type": "PAYMENT_STATUS_CHANGED",
        "pg_tid": "tid-hook",
        "pg_order_id": prepared["pg_order_id"],
        "amount": amount,
        "status": status
    }))
    .unwrap()
}

#[rstest]
#[case::missing(None)]
#[case::garbage(Some("not-hex"))]
#[case::wrong_key(Some("00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff"))]
#[tokio::test]
async fn unsigned_or_badly_signed_deliveries_are_rejected(#[case] signature: Option<&str>) {
    let app = signed_app().await;
    let (_, prepared) = pending_payment(&app).await;
    let body = notification(&prepared, "paid", "10000");

    let headers: Vec<(&str, &str)> = signature.map(|s| vec![(SIGNATURE_HEADER, s)]).unwrap_or_default();
    let resp = app.post_raw(TOSS_HOOK, body, &headers).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_paid_notification_settles_payment_and_order() {
    let app = signed_app().await;
    let (order_id, prepared) = pending_payment(&app).await;
    let body = notification(&prepared, "paid", "10000");
    let signature = sign(&body);

    let resp = app
        .post_raw(TOSS_HOOK, body.clone(), &[(SIGNATURE_HEADER, signature.as_str())])
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome = read_json(resp).await["data"].clone();
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(outcome["status"], "paid");
    assert_eq!(outcome["payment_id"], prepared["payment_id"]);

    let order = read_json(
        app.request(
            axum::http::Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&app.buyer()),
        )
        .await,
    )
    .await;
    assert_eq!(order["data"]["status"], "paid");

    // Providers retry deliveries; the second one changes nothing.
    let replay = app
        .post_raw(TOSS_HOOK, body, &[(SIGNATURE_HEADER, signature.as_str())])
        .await;
    assert_eq!(read_json(replay).await["data"]["outcome"], "ignored");
}

#[tokio::test]
async fn paid_notification_with_wrong_amount_is_refused() {
    let app = TestApp::new().await;
    let (_, prepared) = pending_payment(&app).await;

    let resp = app
        .post_raw(TOSS_HOOK, notification(&prepared, "paid", "100"), &[])
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backwards_notifications_are_ignored() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let (_, prepared) = pending_payment(&app).await;
    app.complete_payment(&buyer, &prepared, "tid-hook").await;

    let resp = app
        .post_raw(TOSS_HOOK, notification(&prepared, "failed", "10000"), &[])
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome = read_json(resp).await["data"].clone();
    assert_eq!(outcome["outcome"], "ignored");
    assert_eq!(outcome["status"], "paid");
}

#[tokio::test]
async fn provider_cancel_refunds_and_closes_order() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let (order_id, prepared) = pending_payment(&app).await;
    app.complete_payment(&buyer, &prepared, "tid-hook").await;

    let resp = app
        .post_raw(TOSS_HOOK, notification(&prepared, "cancelled", "10000"), &[])
        .await;
    let outcome = read_json(resp).await["data"].clone();
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(outcome["status"], "cancelled");

    let order = read_json(
        app.request(
            axum::http::Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&buyer),
        )
        .await,
    )
    .await;
    assert_eq!(order["data"]["status"], "cancelled");
}

#[rstest]
#[case::unknown_provider("/api/v1/payments/webhooks/paypal")]
#[case::unregistered_provider("/api/v1/payments/webhooks/kakaopay")]
#[tokio::test]
async fn deliveries_for_other_providers_are_refused(#[case] uri: &str) {
    let app = TestApp::new().await;
    let body = serde_json::to_vec(&json!({ "status": "paid", "pg_order_id": "x" })).unwrap();
    let resp = app.post_raw(uri, body, &[]).await;
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn notification_for_unknown_payment_is_not_found() {
    let app = TestApp::new().await;
    let body = serde_json::to_vec(&json!({
        "pg_tid": "nobody",
        "pg_order_id": "FAKE_nothing",
        "status": "paid"
    }))
    .unwrap();
    let resp = app.post_raw(TOSS_HOOK, body, &[]).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

async fn order_status(app: &TestApp, order_id: i64) -> Value {
    read_json(
        app.request(Method::GET, &format!("/api/v1/orders/{}", order_id), None, Some(&app.buyer()))
            .await,
    )
    .await["data"]["status"]
        .clone()
}

async fn sales_count(app: &TestApp, product_id: i64) -> i64 {
    product::Entity::find_by_id(product_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .sales_count
}

#[tokio::test]
async fn paid_notification_must_be_confirmed_by_the_provider() {
    let app = signed_app().await;
    let (order_id, prepared) = pending_payment(&app).await;
    app.gateway.reject_verification();
    let body = notification(&prepared, "paid", "10000");
    let signature = sign(&body);

    let resp = app
        .post_raw(TOSS_HOOK, body, &[(SIGNATURE_HEADER, signature.as_str())])
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let payment = read_json(
        app.request(
            Method::GET,
            &format!("/api/v1/payments/{}", prepared["payment_id"]),
            None,
            Some(&app.buyer()),
        )
        .await,
    )
    .await["data"]
        .clone();
    assert_eq!(payment["status"], "pending");
    assert!(payment["paid_at"].is_null());
    assert_eq!(order_status(&app, order_id).await, "pending");
}

#[tokio::test]
async fn virtual_account_waits_for_the_deposit_notification() {
    let app = signed_app().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(10000), None).await;
    let order = app.place_order(&buyer, ebook.id, 1).await;
    let order_id = order["id"].as_i64().unwrap();
    let prepared = app.prepare_payment(&buyer, order_id).await;
    app.gateway.next_ready(VirtualAccount {
        bank_name: "Shinhan".into(),
        account_number: "56211105948400".into(),
        holder: "Ledger Market".into(),
        due: Some(Utc::now() + Duration::days(3)),
    });

    let issued = app.complete_payment(&buyer, &prepared, "tid-vbank").await;
    assert_eq!(issued.status(), StatusCode::OK);
    let issued = read_json(issued).await["data"].clone();
    assert_eq!(issued["status"], "ready");
    assert_eq!(issued["payment_method"], "virtual");
    assert_eq!(issued["vbank_number"], "56211105948400");
    assert!(issued["vbank_due"].is_string());
    assert!(issued["paid_at"].is_null());
    assert_eq!(order_status(&app, order_id).await, "pending");

    assert_eq!(sales_count(&app, ebook.id).await, 0);

    let body = notification(&prepared, "paid", "10000");
    let signature = sign(&body);
    let deposit = app
        .post_raw(TOSS_HOOK, body, &[(SIGNATURE_HEADER, signature.as_str())])
        .await;
    assert_eq!(deposit.status(), StatusCode::OK);
    let outcome = read_json(deposit).await["data"].clone();
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(outcome["status"], "paid");

    assert_eq!(order_status(&app, order_id).await, "paid");
    assert_eq!(sales_count(&app, ebook.id).await, 1);
}
