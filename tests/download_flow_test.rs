//! Download grants and signed, count-limited file delivery.

mod common;

use axum::{
    body,
    http::{Method, StatusCode},
};
use common::{read_json, TestApp, OTHER_BUYER};
use marketplace_ledger::auth::Role;
use marketplace_ledger::entities::product::ProductType;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

const PDF: &[u8] = b"%PDF-1.7 handbook";

/// Paid order for a one-file ebook; returns (order item id, file id).
async fn purchased_ebook(app: &TestApp) -> (i64, i64) {
    let ebook = app.seed_product(ProductType::Digital, dec!(15000), None).await;
    let file = app.seed_file(ebook.id, "handbook.pdf", PDF).await;
    let order = app.paid_order(&app.buyer(), ebook.id, 1).await;
    (order["items"][0]["id"].as_i64().unwrap(), file.id)
}

async fn signed_path(app: &TestApp, token: &str, item_id: i64, file_id: i64) -> String {
    let resp = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/files/{}/url", item_id, file_id),
            None,
            Some(token),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let signed = read_json(resp).await["data"].clone();
    assert_eq!(signed["file_name"], "handbook.pdf");
    signed["url"]
        .as_str()
        .unwrap()
        .trim_start_matches("http://ledger.test")
        .to_string()
}

async fn grant(app: &TestApp, item_id: i64) -> Value {
    let resp = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/downloads", item_id),
            None,
            Some(&app.buyer()),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    read_json(resp).await["data"].clone()
}

#[tokio::test]
async fn granting_access_is_idempotent() {
    let app = TestApp::new().await;
    let (item_id, file_id) = purchased_ebook(&app).await;

    let first = grant(&app, item_id).await;
    let second = grant(&app, item_id).await;
    assert_eq!(first.as_array().unwrap().len(), 1);
    assert_eq!(first[0]["id"], second[0]["id"]);
    assert_eq!(first[0]["file_id"], file_id);
    assert_eq!(first[0]["download_limit"], 2);
    assert_eq!(first[0]["remaining"], 2);
    assert_eq!(first[0]["expired"], false);

    let listed = read_json(
        app.request(Method::GET, "/api/v1/downloads", None, Some(&app.buyer()))
            .await,
    )
    .await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unpaid_orders_get_no_downloads() {
    let app = TestApp::new().await;
    let ebook = app.seed_product(ProductType::Digital, dec!(15000), None).await;
    app.seed_file(ebook.id, "handbook.pdf", PDF).await;
    let order = app.place_order(&app.buyer(), ebook.id, 1).await;

    let resp = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/downloads", order["items"][0]["id"]),
            None,
            Some(&app.buyer()),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn physical_lines_have_nothing_to_download() {
    let app = TestApp::new().await;
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(3)).await;
    let order = app.paid_order(&app.buyer(), mug.id, 1).await;

    let resp = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/downloads", order["items"][0]["id"]),
            None,
            Some(&app.buyer()),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signed_url_serves_file_until_limit() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let (item_id, file_id) = purchased_ebook(&app).await;
    grant(&app, item_id).await;
    let path = signed_path(&app, &buyer, item_id, file_id).await;

    let first = app.request(Method::GET, &path, None, Some(&buyer)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-downloads-remaining"], "1");
    assert_eq!(first.headers()["content-type"], "application/pdf");
    assert_eq!(
        first.headers()["content-disposition"],
        "attachment; filename=\"handbook.pdf\""
    );
    let bytes = body::to_bytes(first.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], PDF);

    let second = app.request(Method::GET, &path, None, Some(&buyer)).await;
    assert_eq!(second.headers()["x-downloads-remaining"], "0");

    let third = app.request(Method::GET, &path, None, Some(&buyer)).await;
    assert_eq!(third.status(), StatusCode::FORBIDDEN);

    let exhausted = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/files/{}/url", item_id, file_id),
            None,
            Some(&buyer),
        )
        .await;
    assert_eq!(exhausted.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tampered_or_foreign_links_are_refused() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let (item_id, file_id) = purchased_ebook(&app).await;
    grant(&app, item_id).await;
    let path = signed_path(&app, &buyer, item_id, file_id).await;

    let tampered = path.replacen("sig=", "sig=00", 1);
    let resp = app.request(Method::GET, &tampered, None, Some(&buyer)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let stretched = match path.rfind("exp=") {
        Some(at) => format!("{}exp={}", &path[..at], i64::MAX / 2),
        None => panic!("signed url without expiry: {}", path),
    };
    let resp = app.request(Method::GET, &stretched, None, Some(&buyer)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let stranger = app.token(OTHER_BUYER, Role::User);
    let resp = app.request(Method::GET, &path, None, Some(&stranger)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // None of the refused attempts consumed a download.
    let listed = read_json(app.request(Method::GET, "/api/v1/downloads", None, Some(&buyer)).await).await;
    assert_eq!(listed["data"][0]["download_count"], 0);
}

#[tokio::test]
async fn other_buyers_cannot_claim_grants() {
    let app = TestApp::new().await;
    let (item_id, _) = purchased_ebook(&app).await;
    let stranger = app.token(OTHER_BUYER, Role::User);

    let resp = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/downloads", item_id),
            None,
            Some(&stranger),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn refunded_orders_lose_their_downloads() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(15000), None).await;
    let file = app.seed_file(ebook.id, "handbook.pdf", PDF).await;
    let order = app.paid_order(&buyer, ebook.id, 1).await;
    let order_id = order["id"].as_i64().unwrap();
    let item_id = order["items"][0]["id"].as_i64().unwrap();
    grant(&app, item_id).await;
    let path = signed_path(&app, &buyer, item_id, file.id).await;

    let payment = read_json(
        app.request(Method::GET, &format!("/api/v1/orders/{}/payment", order_id), None, Some(&buyer))
            .await,
    )
    .await["data"]
        .clone();
    let refund = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{}/cancel", payment["id"]),
            Some(json!({ "reason": "changed my mind" })),
            Some(&buyer),
        )
        .await;
    assert_eq!(refund.status(), StatusCode::OK);
    let order = read_json(
        app.request(Method::GET, &format!("/api/v1/orders/{}", order_id), None, Some(&buyer))
            .await,
    )
    .await;
    assert_eq!(order["data"]["status"], "cancelled");

    let new_link = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/files/{}/url", item_id, file.id),
            None,
            Some(&buyer),
        )
        .await;
    assert_eq!(new_link.status(), StatusCode::FORBIDDEN);

    let old_link = app.request(Method::GET, &path, None, Some(&buyer)).await;
    assert_eq!(old_link.status(), StatusCode::FORBIDDEN);

    let listed = read_json(app.request(Method::GET, "/api/v1/downloads", None, Some(&buyer)).await).await;
    assert_eq!(listed["data"][0]["download_count"], 0);
}
