//! Cart to order conversion through the HTTP surface.

mod common;

use axum::http::{Method, StatusCode};
use common::{dec_of, read_json, TestApp, BUYER, OTHER_BUYER};
use marketplace_ledger::auth::Role;
use marketplace_ledger::entities::product::{self, ProductType};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::json;

#[tokio::test]
async fn digital_checkout_snapshots_lines_and_empties_cart() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(12000), None).await;

    let order = app.place_order(&buyer, ebook.id, 2).await;

    assert_eq!(order["status"], "pending");
    assert_eq!(order["user_id"], BUYER);
    assert_eq!(dec_of(&order["subtotal"]), dec!(24000));
    assert_eq!(dec_of(&order["shipping_fee"]), dec!(0));
    assert_eq!(dec_of(&order["total"]), dec!(24000));
    assert_eq!(order["order_number"].as_str().unwrap().len(), 20);

    let items = order["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["product_name"], ebook.name);
    assert_eq!(dec_of(&items[0]["platform_fee"]), dec!(1200));
    assert_eq!(dec_of(&items[0]["seller_amount"]), dec!(22800));
    assert_eq!(items[0]["settlement_status"], "pending");

    let cart = read_json(app.request(Method::GET, "/api/v1/cart", None, Some(&buyer)).await).await;
    assert_eq!(cart["data"]["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn physical_checkout_adds_shipping_and_takes_stock() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(5)).await;

    let order = app.place_order(&buyer, mug.id, 3).await;
    assert_eq!(dec_of(&order["shipping_fee"]), dec!(3000));
    assert_eq!(dec_of(&order["total"]), dec!(27000));

    let stored = product::Entity::find_by_id(mug.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.stock_quantity, Some(2));
}

#[tokio::test]
async fn physical_checkout_requires_shipping_details() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(5)).await;

    app.request(
        Method::POST,
        "/api/v1/cart",
        Some(json!({ "product_id": mug.id, "quantity": 1 })),
        Some(&buyer),
    )
    .await;
    let resp = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "shipping_name": "Kim Minji" })),
            Some(&buyer),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = read_json(resp).await;
    assert!(body["message"].as_str().unwrap().contains("shipping_address"));

    let cart = read_json(app.request(Method::GET, "/api/v1/cart", None, Some(&buyer)).await).await;
    assert_eq!(cart["data"]["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn insufficient_stock_rejects_checkout() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(1)).await;

    app.request(
        Method::POST,
        "/api/v1/cart",
        Some(json!({ "product_id": mug.id, "quantity": 2 })),
        Some(&buyer),
    )
    .await;
    let resp = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "shipping_name": "Kim Minji",
                "shipping_phone": "010-1234-5678",
                "shipping_address": "12 Teheran-ro, Seoul",
                "shipping_postal": "06236"
            })),
            Some(&buyer),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn empty_cart_cannot_be_checked_out() {
    let app = TestApp::new().await;
    let resp = app
        .request(Method::POST, "/api/v1/orders", Some(json!({})), Some(&app.buyer()))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn orders_are_private_to_their_buyer() {
    let app = TestApp::new().await;
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let order = app.place_order(&app.buyer(), ebook.id, 1).await;
    let id = order["id"].as_i64().unwrap();

    let stranger = app.token(OTHER_BUYER, Role::User);
    let resp = app
        .request(Method::GET, &format!("/api/v1/orders/{}", id), None, Some(&stranger))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let by_number = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/number/{}", order["order_number"].as_str().unwrap()),
            None,
            Some(&app.buyer()),
        )
        .await;
    assert_eq!(by_number.status(), StatusCode::OK);
    assert_eq!(read_json(by_number).await["data"]["id"], id);

    let anonymous = app
        .request(Method::GET, &format!("/api/v1/orders/{}", id), None, None)
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn listing_orders_pages_newest_first() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(app.place_order(&buyer, ebook.id, 1).await["id"].as_i64().unwrap());
    }

    let resp = app
        .request(Method::GET, "/api/v1/orders?page=1&limit=2", None, Some(&buyer))
        .await;
    let page = read_json(resp).await["data"].clone();
    assert_eq!(page["total"], 3);
    assert_eq!(page["total_pages"], 2);
    let listed: Vec<i64> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_i64().unwrap())
        .collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);
}

#[tokio::test]
async fn cancelling_a_pending_order_returns_stock() {
    let app = TestApp::new().await;
    let buyer = app.buyer();
    let mug = app.seed_product(ProductType::Physical, dec!(8000), Some(4)).await;
    let order = app.place_order(&buyer, mug.id, 3).await;
    let uri = format!("/api/v1/orders/{}/cancel", order["id"]);

    let resp = app
        .request(Method::POST, &uri, Some(json!({ "reason": "changed my mind" })), Some(&buyer))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cancelled = read_json(resp).await["data"].clone();
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["cancel_reason"], "changed my mind");

    let stored = product::Entity::find_by_id(mug.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.stock_quantity, Some(4));

    let again = app
        .request(Method::POST, &uri, Some(json!({})), Some(&buyer))
        .await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_status_changes_follow_the_transition_table() {
    let app = TestApp::new().await;
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let order = app.place_order(&app.buyer(), ebook.id, 1).await;
    let uri = format!("/api/v1/admin/orders/{}/status", order["id"]);

    let skip = app
        .request(Method::PUT, &uri, Some(json!({ "status": "shipped" })), Some(&app.admin()))
        .await;
    assert_eq!(skip.status(), StatusCode::BAD_REQUEST);

    let not_admin = app
        .request(Method::PUT, &uri, Some(json!({ "status": "paid" })), Some(&app.seller()))
        .await;
    assert_eq!(not_admin.status(), StatusCode::FORBIDDEN);

    let paid = app
        .request(Method::PUT, &uri, Some(json!({ "status": "paid" })), Some(&app.admin()))
        .await;
    assert_eq!(paid.status(), StatusCode::OK);
    let body = read_json(paid).await;
    assert_eq!(body["data"]["status"], "paid");
    assert!(body["data"]["paid_at"].is_string());
}

#[tokio::test]
async fn closed_orders_accept_no_further_status_changes() {
    let app = TestApp::new().await;
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    let order = app.place_order(&app.buyer(), ebook.id, 1).await;
    app.set_order_status(order["id"].as_i64().unwrap(), "cancelled").await;

    let resp = app
        .request(
            Method::PUT,
            &format!("/api/v1/admin/orders/{}/status", order["id"]),
            Some(json!({ "status": "paid" })),
            Some(&app.admin()),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = read_json(resp).await;
    assert!(body["message"].as_str().unwrap().contains("order is closed (cancelled)"));
}

#[tokio::test]
async fn seller_sees_orders_containing_their_lines() {
    let app = TestApp::new().await;
    let ebook = app.seed_product(ProductType::Digital, dec!(5000), None).await;
    app.place_order(&app.buyer(), ebook.id, 1).await;

    let mine = app
        .request(Method::GET, "/api/v1/seller/orders", None, Some(&app.seller()))
        .await;
    assert_eq!(read_json(mine).await["data"]["total"], 1);

    let buyer_as_seller = app
        .request(Method::GET, "/api/v1/seller/orders", None, Some(&app.buyer()))
        .await;
    assert_eq!(buyer_as_seller.status(), StatusCode::FORBIDDEN);
}
