mod common;

use axum::http::{header, Method, StatusCode};
use common::{dec_of, read_json, TestApp};
use marketplace_ledger::entities::product::{self, ProductStatus, ProductType};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;

#[tokio::test]
async fn health_reports_database_and_providers() {
    let app = TestApp::new().await;
    let resp = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body = read_json(resp).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");
    assert_eq!(body["payment_providers"], json!(["tosspayments"]));
}

#[tokio::test]
async fn incoming_request_ids_are_echoed() {
    let app = TestApp::new().await;
    let router_resp = app
        .request(Method::GET, "/api/v1/cart", None, None)
        .await;
    assert_eq!(router_resp.status(), StatusCode::UNAUTHORIZED);
    assert!(router_resp.headers().contains_key("x-request-id"));
    let body = read_json(router_resp).await;
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn adding_twice_merges_quantities() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;

    for qty in [1, 2] {
        let resp = app
            .request(
                Method::POST,
                "/api/v1/cart",
                Some(json!({ "product_id": ebook.id, "quantity": qty })),
                Some(&buyer),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let cart = read_json(app.request(Method::GET, "/api/v1/cart", None, Some(&buyer)).await).await["data"].clone();
    assert_eq!(cart["items"].as_array().unwrap().len(), 1);
    assert_eq!(cart["items"][0]["quantity"], 3);
    assert_eq!(cart["item_count"], 3);
    assert_eq!(dec_of(&cart["subtotal"]), dec!(15000));
}

#[tokio::test]
async fn quantity_updates_and_removal() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    app.request(
        Method::POST,
        "/api/v1/cart",
        Some(json!({ "product_id": ebook.id, "quantity": 1 })),
        Some(&buyer),
    )
    .await;
    let line = format!("/api/v1/cart/{}", ebook.id);

    let updated = app
        .request(Method::PUT, &line, Some(json!({ "quantity": 4 })), Some(&buyer))
        .await;
    assert_eq!(read_json(updated).await["data"]["items"][0]["quantity"], 4);

    let too_many = app
        .request(Method::PUT, &line, Some(json!({ "quantity": 1000 })), Some(&buyer))
        .await;
    assert_eq!(too_many.status(), StatusCode::BAD_REQUEST);

    let zero = app
        .request(Method::PUT, &line, Some(json!({ "quantity": 0 })), Some(&buyer))
        .await;
    assert_eq!(read_json(zero).await["data"]["items"].as_array().unwrap().len(), 0);

    let gone = app.request(Method::DELETE, &line, None, Some(&buyer)).await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_products_and_bad_quantities_are_rejected() {
    let app = TestApp::new().await;
    let buyer = app.buyer();

    let missing = app
        .request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({ "product_id": 9999, "quantity": 1 })),
            Some(&buyer),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let zero = app
        .request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({ "product_id": ebook.id, "quantity": 0 })),
            Some(&buyer),
        )
        .await;
    assert_eq!(zero.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_tokens_are_unauthorized() {
    let app = TestApp::new().await;
    let resp = app
        .request(Method::GET, "/api/v1/cart", None, Some("not-a-jwt"))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().get(header::CONTENT_TYPE).is_some());
}

#[tokio::test]
async fn validation_separates_buyable_lines_from_problems() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(5)).await;
    let poster = app.seed_product(ProductType::Physical, dec!(3000), Some(10)).await;
    for (id, qty) in [(ebook.id, 2), (mug.id, 3), (poster.id, 1)] {
        app.request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({ "product_id": id, "quantity": qty })),
            Some(&buyer),
        )
        .await;
    }

    // Stock and listing change after the lines were added.
    let mut sold_down: product::ActiveModel = mug.into();
    sold_down.stock_quantity = Set(Some(1));
    sold_down.update(&*app.state.db).await.unwrap();
    let mut withdrawn: product::ActiveModel = poster.into();
    withdrawn.status = Set(ProductStatus::Archived);
    withdrawn.update(&*app.state.db).await.unwrap();

    let resp = app
        .request(Method::GET, "/api/v1/cart/validate", None, Some(&buyer))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report = read_json(resp).await["data"].clone();
    assert_eq!(report["items"].as_array().unwrap().len(), 1);
    assert_eq!(report["items"][0]["product_id"], ebook.id);
    assert_eq!(dec_of(&report["subtotal"]), dec!(10000));
    assert_eq!(report["item_count"], 2);

    let problems = report["problems"].as_array().unwrap();
    assert_eq!(problems.len(), 2);
    assert_eq!(problems[0]["kind"], "insufficient_stock");
    assert_eq!(problems[1]["kind"], "not_for_sale");
}

#[tokio::test]
async fn empty_or_unbuyable_carts_fail_validation() {
    let app = TestApp::new().await;
    let buyer = app.buyer();

    let empty = app
        .request(Method::GET, "/api/v1/cart/validate", None, Some(&buyer))
        .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(5)).await;
    app.request(
        Method::POST,
        "/api/v1/cart",
        Some(json!({ "product_id": mug.id, "quantity": 2 })),
        Some(&buyer),
    )
    .await;
    let mut gone: product::ActiveModel = mug.into();
    gone.stock_quantity = Set(Some(0));
    gone.update(&*app.state.db).await.unwrap();

    let resp = app
        .request(Method::GET, "/api/v1/cart/validate", None, Some(&buyer))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = read_json(resp).await;
    assert!(body["message"].as_str().unwrap().contains("no item in the cart can be purchased"));
}
