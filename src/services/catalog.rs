//! Product and stock lookups the order workflow depends on.

use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entities::product::{self, ProductType, StockStatus};
use crate::entities::product_file;
use crate::errors::ServiceError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_product(&self, id: i64) -> Result<Option<product::Model>, ServiceError>;

    async fn find_products(&self, ids: &[i64]) -> Result<Vec<product::Model>, ServiceError>;

    async fn product_files(&self, product_id: i64)
        -> Result<Vec<product_file::Model>, ServiceError>;

    /// Adds `delta` to tracked stock. Negative deltas fail with
    /// `InsufficientStock` instead of driving stock below zero.
    async fn adjust_stock(&self, product_id: i64, delta: i32) -> Result<(), ServiceError>;

    async fn increment_sales(&self, product_id: i64, quantity: i32) -> Result<(), ServiceError>;
}

pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Catalog for DbCatalog {
    async fn find_product(&self, id: i64) -> Result<Option<product::Model>, ServiceError> {
        Ok(product::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn find_products(&self, ids: &[i64]) -> Result<Vec<product::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(product::Entity::find()
            .filter(product::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await?)
    }

    async fn product_files(
        &self,
        product_id: i64,
    ) -> Result<Vec<product_file::Model>, ServiceError> {
        Ok(product_file::Entity::find()
            .filter(product_file::Column::ProductId.eq(product_id))
            .order_by_asc(product_file::Column::SortOrder)
            .order_by_asc(product_file::Column::Id)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    async fn adjust_stock(&self, product_id: i64, delta: i32) -> Result<(), ServiceError> {
        if delta == 0 {
            return Ok(());
        }

        let mut update = product::Entity::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).add(delta),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::ProductType.eq(ProductType::Physical))
            .filter(product::Column::StockQuantity.is_not_null());
        if delta < 0 {
            update = update.filter(product::Column::StockQuantity.gte(-delta));
        }
        let result = update.exec(&*self.db).await?;

        if result.rows_affected == 0 {
            let tracked = product::Entity::find_by_id(product_id)
                .one(&*self.db)
                .await?
                .map(|p| p.is_physical() && p.stock_quantity.is_some());
            return match tracked {
                None => Err(ServiceError::NotFound(format!("product {}", product_id))),
                Some(false) => Ok(()),
                Some(true) => Err(ServiceError::InsufficientStock(format!(
                    "product {} cannot release {} units",
                    product_id, -delta
                ))),
            };
        }

        // Keep stock_status in line with the new quantity.
        product::Entity::update_many()
            .col_expr(product::Column::StockStatus, Expr::value(StockStatus::OutOfStock))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::StockQuantity.lte(0))
            .filter(product::Column::StockStatus.eq(StockStatus::InStock))
            .exec(&*self.db)
            .await?;
        product::Entity::update_many()
            .col_expr(product::Column::StockStatus, Expr::value(StockStatus::InStock))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::StockQuantity.gt(0))
            .filter(product::Column::StockStatus.eq(StockStatus::OutOfStock))
            .exec(&*self.db)
            .await?;

        debug!(product_id, delta, "stock adjusted");
        Ok(())
    }

    async fn increment_sales(&self, product_id: i64, quantity: i32) -> Result<(), ServiceError> {
        product::Entity::update_many()
            .col_expr(
                product::Column::SalesCount,
                Expr::col(product::Column::SalesCount).add(i64::from(quantity)),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
