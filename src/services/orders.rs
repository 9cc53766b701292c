use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait, UpdateMany,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use super::cart::CartService;
use super::catalog::Catalog;
use super::{Page, PageRequest};
use crate::config::AppConfig;
use crate::entities::order::{self, order_total, OrderStatus};
use crate::entities::order_item::{self, ItemSettlementStatus, LineAmounts, OrderItemStatus};
use crate::entities::product;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Shipping details captured at checkout. Required only when the cart holds
/// physical goods.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(max = 50))]
    pub shipping_name: Option<String>,
    #[validate(length(max = 20))]
    pub shipping_phone: Option<String>,
    #[validate(length(max = 255))]
    pub shipping_address: Option<String>,
    #[validate(length(max = 10))]
    pub shipping_postal: Option<String>,
    #[validate(length(max = 255))]
    pub shipping_memo: Option<String>,
}

impl CheckoutRequest {
    fn missing_shipping_fields(&self) -> Vec<&'static str> {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        [
            ("shipping_name", &self.shipping_name),
            ("shipping_phone", &self.shipping_phone),
            ("shipping_address", &self.shipping_address),
            ("shipping_postal", &self.shipping_postal),
        ]
        .into_iter()
        .filter(|(_, v)| blank(v))
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Cart-to-order conversion and the order state machine.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    cart: CartService,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        cart: CartService,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            catalog,
            cart,
            event_sender,
            config,
        }
    }

    /// Converts the caller's cart into a pending order.
    ///
    /// Every precondition (non-empty cart, stock, shipping details) is checked
    /// before the first write. The order and its items are inserted in one
    /// transaction; stock decrement and cart clearing happen after commit and
    /// only log on failure.
    #[instrument(skip(self, request))]
    pub async fn checkout(
        &self,
        user_id: i64,
        request: CheckoutRequest,
    ) -> Result<OrderDetail, ServiceError> {
        request.validate()?;

        let lines = self.cart.items(user_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError("cart is empty".into()));
        }

        let ids: Vec<i64> = lines.iter().map(|l| l.product_id).collect();
        let products: HashMap<i64, product::Model> = self
            .catalog
            .find_products(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let fee_rate = self.config.commerce.platform_fee_rate;
        let mut drafts = Vec::with_capacity(lines.len());
        for line in &lines {
            let Some(product) = products.get(&line.product_id).filter(|p| p.is_purchasable())
            else {
                continue;
            };
            if !product.has_stock_for(line.quantity) {
                return Err(ServiceError::InsufficientStock(format!(
                    "{} has fewer than {} units left",
                    product.name, line.quantity
                )));
            }
            drafts.push((product, line.quantity, LineAmounts::compute(product.price, line.quantity, fee_rate)));
        }
        if drafts.is_empty() {
            return Err(ServiceError::ValidationError(
                "cart has no purchasable items".into(),
            ));
        }

        let has_physical = drafts.iter().any(|(p, _, _)| p.is_physical());
        if has_physical {
            let missing = request.missing_shipping_fields();
            if !missing.is_empty() {
                return Err(ServiceError::ValidationError(format!(
                    "shipping info is required for physical products: {}",
                    missing.join(", ")
                )));
            }
        }

        let subtotal: Decimal = drafts.iter().map(|(_, _, a)| a.subtotal).sum();
        let shipping_fee = if has_physical {
            self.config.commerce.default_shipping_fee
        } else {
            Decimal::ZERO
        };
        let currency = drafts
            .first()
            .map(|(p, _, _)| p.currency.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.commerce.default_currency.clone());

        let retries = self.config.commerce.order_number_retries.max(1);
        let mut attempt = 0;
        let (order, items) = loop {
            attempt += 1;
            let number = generate_order_number(Utc::now());
            let order = order::ActiveModel {
                order_number: Set(number.clone()),
                user_id: Set(user_id),
                subtotal: Set(subtotal),
                discount: Set(Decimal::ZERO),
                shipping_fee: Set(shipping_fee),
                total: Set(order_total(subtotal, Decimal::ZERO, shipping_fee)),
                currency: Set(currency.clone()),
                status: Set(OrderStatus::Pending),
                shipping_name: Set(request.shipping_name.clone()),
                shipping_phone: Set(request.shipping_phone.clone()),
                shipping_address: Set(request.shipping_address.clone()),
                shipping_postal: Set(request.shipping_postal.clone()),
                shipping_memo: Set(request.shipping_memo.clone()),
                ..Default::default()
            };

            match self.insert_order(order, &drafts, fee_rate).await {
                Ok(created) => break created,
                Err(ServiceError::Conflict(_)) if attempt < retries => {
                    warn!(order_number = %number, attempt, "order number collision, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        for item in items.iter().filter(|i| i.is_physical()) {
            if let Err(e) = self.catalog.adjust_stock(item.product_id, -item.quantity).await {
                error!(
                    order_id = order.id,
                    product_id = item.product_id,
                    quantity = item.quantity,
                    error = %e,
                    "stock decrement failed after checkout; reconcile manually"
                );
            }
        }
        if let Err(e) = self.cart.clear(user_id).await {
            warn!(user_id, error = %e, "failed to clear cart after checkout");
        }

        metrics::counter!("ledger.orders.created", 1);
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                user_id,
                total: order.total,
            })
            .await;
        info!(order_id = order.id, order_number = %order.order_number, "order created");

        Ok(OrderDetail { order, items })
    }

    async fn insert_order(
        &self,
        order: order::ActiveModel,
        drafts: &[(&product::Model, i32, LineAmounts)],
        fee_rate: Decimal,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let txn = self.db.begin().await?;
        let order = order
            .insert(&txn)
            .await
            .map_err(|e| ServiceError::on_unique_violation(e, "order number already in use"))?;

        let mut items = Vec::with_capacity(drafts.len());
        for (product, quantity, amounts) in drafts {
            let item = order_item::ActiveModel {
                order_id: Set(order.id),
                product_id: Set(product.id),
                seller_id: Set(product.seller_id),
                product_name: Set(product.name.clone()),
                product_type: Set(product.product_type),
                category_id: Set(product.category_id),
                price: Set(product.price),
                quantity: Set(*quantity),
                subtotal: Set(amounts.subtotal),
                platform_fee_rate: Set(fee_rate),
                platform_fee: Set(amounts.platform_fee),
                seller_amount: Set(amounts.seller_amount),
                status: Set(OrderItemStatus::Pending),
                settlement_status: Set(ItemSettlementStatus::Pending),
                settlement_id: Set(None),
                ..Default::default()
            };
            items.push(item.insert(&txn).await?);
        }
        txn.commit().await?;
        Ok((order, items))
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, user_id: i64, order_id: i64) -> Result<OrderDetail, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        self.with_items(order).await
    }

    #[instrument(skip(self))]
    pub async fn get_order_by_number(
        &self,
        user_id: i64,
        order_number: &str,
    ) -> Result<OrderDetail, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_number)))?;
        ensure_owner(&order, user_id)?;
        self.with_items(order).await
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        user_id: i64,
        page: PageRequest,
    ) -> Result<Page<order::Model>, ServiceError> {
        let page = page.normalized();
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, page.limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.index()).await?;
        Ok(Page::new(items, total, page))
    }

    /// Orders containing at least one line sold by `seller_id`.
    #[instrument(skip(self))]
    pub async fn list_seller_orders(
        &self,
        seller_id: i64,
        page: PageRequest,
    ) -> Result<Page<order::Model>, ServiceError> {
        let page = page.normalized();
        let paginator = order::Entity::find()
            .filter(
                order::Column::Id.in_subquery(
                    Query::select()
                        .column(order_item::Column::OrderId)
                        .from(order_item::Entity)
                        .and_where(order_item::Column::SellerId.eq(seller_id))
                        .to_owned(),
                ),
            )
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, page.limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.index()).await?;
        Ok(Page::new(items, total, page))
    }

    /// Owner cancellation. Only pending orders qualify; tracked stock of
    /// physical lines is given back.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        user_id: i64,
        order_id: i64,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "order in status {} cannot be cancelled",
                order.status
            )));
        }

        let result = status_update(order_id, &[OrderStatus::Pending], OrderStatus::Cancelled, Utc::now())
            .col_expr(order::Column::CancelReason, Expr::value(reason.clone()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(
                "order is no longer pending".into(),
            ));
        }

        let items = load_items(&*self.db, order_id).await?;
        release_stock(self.catalog.as_ref(), &items).await;

        self.event_sender
            .send_or_log(Event::OrderCancelled { order_id, reason })
            .await;
        info!(order_id, "order cancelled by owner");
        find_order(&*self.db, order_id).await
    }

    /// Administrative status change, validated against the transition table.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::InvalidStatus(format!(
                "order is closed ({})",
                order.status
            )));
        }
        if !order.status.can_transition_to(status) {
            return Err(ServiceError::InvalidStatus(format!(
                "invalid status transition from {} to {}",
                order.status, status
            )));
        }

        let txn = self.db.begin().await?;
        let result = status_update(order_id, &[order.status], status, Utc::now())
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "order status changed concurrently".into(),
            ));
        }
        let item_status = match status {
            OrderStatus::Completed => Some(OrderItemStatus::Completed),
            OrderStatus::Refunded => Some(OrderItemStatus::Refunded),
            _ => None,
        };
        if let Some(item_status) = item_status {
            order_item::Entity::update_many()
                .col_expr(order_item::Column::Status, Expr::value(item_status))
                .col_expr(order_item::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(order_item::Column::OrderId.eq(order_id))
                .exec(&txn)
                .await?;
        }
        txn.commit().await?;

        if status == OrderStatus::Cancelled {
            let items = load_items(&*self.db, order_id).await?;
            release_stock(self.catalog.as_ref(), &items).await;
        }

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: order.status.to_string(),
                new_status: status.to_string(),
            })
            .await;
        find_order(&*self.db, order_id).await
    }

    async fn with_items(&self, order: order::Model) -> Result<OrderDetail, ServiceError> {
        let items = load_items(&*self.db, order.id).await?;
        Ok(OrderDetail { order, items })
    }
}

/// `yyyyMMddHHmmss` followed by six random digits.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{:06}", now.format("%Y%m%d%H%M%S"), suffix)
}

fn timestamp_column(status: OrderStatus) -> Option<order::Column> {
    match status {
        OrderStatus::Paid => Some(order::Column::PaidAt),
        OrderStatus::Shipped => Some(order::Column::ShippedAt),
        OrderStatus::Delivered => Some(order::Column::DeliveredAt),
        OrderStatus::Completed => Some(order::Column::CompletedAt),
        OrderStatus::Cancelled => Some(order::Column::CancelledAt),
        _ => None,
    }
}

/// Conditional status change: only rows currently in one of `from` move to
/// `to`. Callers check `rows_affected`.
pub(crate) fn status_update(
    order_id: i64,
    from: &[OrderStatus],
    to: OrderStatus,
    now: DateTime<Utc>,
) -> UpdateMany<order::Entity> {
    let mut update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(to))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.is_in(from.iter().copied()));
    if let Some(column) = timestamp_column(to) {
        update = update.col_expr(column, Expr::value(now));
    }
    update
}

pub(crate) async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
}

pub(crate) async fn load_items<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<Vec<order_item::Model>, ServiceError> {
    Ok(order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?)
}

pub(crate) fn ensure_owner(order: &order::Model, user_id: i64) -> Result<(), ServiceError> {
    if order.is_owned_by(user_id) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "you are not the owner of this order".into(),
        ))
    }
}

/// Returns the quantities of physical lines to stock. Failures are logged.
pub(crate) async fn release_stock(catalog: &dyn Catalog, items: &[order_item::Model]) {
    for item in items.iter().filter(|i| i.is_physical()) {
        if let Err(e) = catalog.adjust_stock(item.product_id, item.quantity).await {
            error!(
                order_id = item.order_id,
                product_id = item.product_id,
                error = %e,
                "stock restore failed; reconcile manually"
            );
        }
    }
}
