use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

use crate::entities::{cart_item, product};
use crate::errors::ServiceError;

const MAX_LINE_QUANTITY: i32 = 999;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddToCart {
    pub product_id: i64,
    #[validate(range(min = 1, max = 999))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub product_id: i64,
    pub name: String,
    pub product_type: product::ProductType,
    pub price: Decimal,
    pub quantity: i32,
    pub subtotal: Decimal,
    pub purchasable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub items: Vec<CartLine>,
    pub subtotal: Decimal,
    pub item_count: i32,
}

/// Why a cart line cannot be checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CartProblemKind {
    ProductMissing,
    NotForSale,
    InsufficientStock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartProblem {
    pub product_id: i64,
    pub kind: CartProblemKind,
    pub message: String,
}

/// Checkout readiness: the lines that can be bought now and the rest.
#[derive(Debug, Clone, Serialize)]
pub struct CartValidation {
    pub items: Vec<CartLine>,
    pub subtotal: Decimal,
    pub item_count: i32,
    pub problems: Vec<CartProblem>,
}

/// Per-user cart. One row per (user, product); adding an existing product
/// merges quantities.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Cart lines joined with their current product. Lines whose product has
    /// vanished are dropped from the view.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, user_id: i64) -> Result<CartView, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::Id)
            .find_also_related(product::Entity)
            .all(&*self.db)
            .await?;

        let items: Vec<CartLine> = rows
            .into_iter()
            .filter_map(|(line, product)| {
                let product = product?;
                Some(CartLine {
                    product_id: line.product_id,
                    subtotal: product.price * Decimal::from(line.quantity),
                    purchasable: product.is_purchasable(),
                    name: product.name,
                    product_type: product.product_type,
                    price: product.price,
                    quantity: line.quantity,
                })
            })
            .collect();

        Ok(CartView {
            subtotal: items
                .iter()
                .filter(|l| l.purchasable)
                .map(|l| l.subtotal)
                .sum(),
            item_count: items.iter().map(|l| l.quantity).sum(),
            items,
        })
    }

    /// Checks every line against its product as it stands now. Fails only
    /// when the cart is empty or nothing in it can be bought.
    #[instrument(skip(self))]
    pub async fn validate(&self, user_id: i64) -> Result<CartValidation, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::Id)
            .find_also_related(product::Entity)
            .all(&*self.db)
            .await?;
        if rows.is_empty() {
            return Err(ServiceError::InvalidOperation("cart is empty".into()));
        }

        let mut items = Vec::new();
        let mut problems = Vec::new();
        for (line, product) in rows {
            let problem = |kind, message: String| CartProblem {
                product_id: line.product_id,
                kind,
                message,
            };
            let Some(product) = product else {
                problems.push(problem(
                    CartProblemKind::ProductMissing,
                    "product no longer exists".into(),
                ));
                continue;
            };
            if !product.is_purchasable() {
                problems.push(problem(
                    CartProblemKind::NotForSale,
                    format!("{} is no longer for sale", product.name),
                ));
                continue;
            }
            if !product.has_stock_for(line.quantity) {
                problems.push(problem(
                    CartProblemKind::InsufficientStock,
                    format!(
                        "only {} of {} left",
                        product.stock_quantity.unwrap_or(0).max(0),
                        product.name
                    ),
                ));
                continue;
            }
            items.push(CartLine {
                product_id: line.product_id,
                subtotal: product.price * Decimal::from(line.quantity),
                purchasable: true,
                name: product.name,
                product_type: product.product_type,
                price: product.price,
                quantity: line.quantity,
            });
        }
        if items.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "no item in the cart can be purchased ({} problem(s))",
                problems.len()
            )));
        }

        Ok(CartValidation {
            subtotal: items.iter().map(|l| l.subtotal).sum(),
            item_count: items.iter().map(|l| l.quantity).sum(),
            items,
            problems,
        })
    }

    /// Raw cart rows for checkout.
    pub async fn items(&self, user_id: i64) -> Result<Vec<cart_item::Model>, ServiceError> {
        Ok(cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::Id)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn add(&self, user_id: i64, input: AddToCart) -> Result<(), ServiceError> {
        input.validate()?;
        let product = product::Entity::find_by_id(input.product_id)
            .one(&*self.db)
            .await?
            .filter(product::Model::is_purchasable)
            .ok_or_else(|| ServiceError::NotFound(format!("product {}", input.product_id)))?;

        let now = Utc::now();
        let line = cart_item::ActiveModel {
            user_id: Set(user_id),
            product_id: Set(product.id),
            quantity: Set(input.quantity),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        // Existing lines grow by the requested amount.
        cart_item::Entity::insert(line)
            .on_conflict(
                OnConflict::columns([cart_item::Column::UserId, cart_item::Column::ProductId])
                    .value(
                        cart_item::Column::Quantity,
                        Expr::col((cart_item::Entity, cart_item::Column::Quantity))
                            .add(input.quantity),
                    )
                    .value(cart_item::Column::UpdatedAt, now)
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        info!(user_id, product_id = product.id, "cart line added");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_quantity(
        &self,
        user_id: i64,
        product_id: i64,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return self.remove(user_id, product_id).await;
        }
        if quantity > MAX_LINE_QUANTITY {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be at most {}",
                MAX_LINE_QUANTITY
            )));
        }
        let line = self.find_line(user_id, product_id).await?;
        let mut active: cart_item::ActiveModel = line.into();
        active.quantity = Set(quantity);
        active.update(&*self.db).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, user_id: i64, product_id: i64) -> Result<(), ServiceError> {
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "product {} is not in the cart",
                product_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, user_id: i64) -> Result<u64, ServiceError> {
        let result = cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_line(
        &self,
        user_id: i64,
        product_id: i64,
    ) -> Result<cart_item::Model, ServiceError> {
        cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("product {} is not in the cart", product_id))
            })
    }
}
