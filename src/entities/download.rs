use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Long-lived access grant for one file of a purchased digital item.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "downloads")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_item_id: i64,
    pub file_id: i64,
    pub user_id: i64,
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token: String,
    pub download_count: i32,
    pub download_limit: i32,
    pub expires_at: DateTime<Utc>,
    pub last_downloaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn remaining(&self) -> i32 {
        (self.download_limit - self.download_count).max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order_item::Entity",
        from = "Column::OrderItemId",
        to = "super::order_item::Column::Id"
    )]
    OrderItem,
    #[sea_orm(
        belongs_to = "super::product_file::Entity",
        from = "Column::FileId",
        to = "super::product_file::Column::Id"
    )]
    ProductFile,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::product_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProductFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
