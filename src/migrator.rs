use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_catalog_tables::Migration),
            Box::new(m20240601_000002_create_orders_tables::Migration),
            Box::new(m20240601_000003_create_coupon_tables::Migration),
            Box::new(m20240601_000004_create_payments_table::Migration),
            Box::new(m20240601_000005_create_settlements_table::Migration),
            Box::new(m20240601_000006_create_downloads_table::Migration),
        ]
    }
}

fn money<T: IntoIden + 'static>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .decimal_len(15, 2)
        .not_null()
        .default(0)
        .to_owned()
}

fn id_column<T: IntoIden + 'static>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .big_integer()
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}

mod m20240601_000001_create_catalog_tables {

    use super::{id_column, money};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(id_column(Products::Id))
                        .col(ColumnDef::new(Products::SellerId).big_integer().not_null())
                        .col(ColumnDef::new(Products::Name).string_len(255).not_null())
                        .col(ColumnDef::new(Products::ProductType).string_len(20).not_null())
                        .col(money(Products::Price))
                        .col(
                            ColumnDef::new(Products::Currency)
                                .string_len(3)
                                .not_null()
                                .default("KRW"),
                        )
                        .col(ColumnDef::new(Products::CategoryId).big_integer().null())
                        .col(ColumnDef::new(Products::StockQuantity).integer().null())
                        .col(
                            ColumnDef::new(Products::StockStatus)
                                .string_len(20)
                                .not_null()
                                .default("in_stock"),
                        )
                        .col(
                            ColumnDef::new(Products::Status)
                                .string_len(20)
                                .not_null()
                                .default("draft"),
                        )
                        .col(ColumnDef::new(Products::DownloadLimit).integer().null())
                        .col(ColumnDef::new(Products::DownloadExpiryDays).integer().null())
                        .col(
                            ColumnDef::new(Products::SalesCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::DeletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_seller_id")
                        .table(Products::Table)
                        .col(Products::SellerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductFiles::Table)
                        .if_not_exists()
                        .col(id_column(ProductFiles::Id))
                        .col(ColumnDef::new(ProductFiles::ProductId).big_integer().not_null())
                        .col(ColumnDef::new(ProductFiles::FileName).string_len(255).not_null())
                        .col(ColumnDef::new(ProductFiles::FilePath).string_len(500).not_null())
                        .col(
                            ColumnDef::new(ProductFiles::FileSize)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(ProductFiles::FileType).string_len(100).null())
                        .col(ColumnDef::new(ProductFiles::DisplayName).string_len(255).null())
                        .col(
                            ColumnDef::new(ProductFiles::SortOrder)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ProductFiles::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_files_product_id")
                                .from(ProductFiles::Table, ProductFiles::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(id_column(CartItems::Id))
                        .col(ColumnDef::new(CartItems::UserId).big_integer().not_null())
                        .col(ColumnDef::new(CartItems::ProductId).big_integer().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_product_id")
                                .from(CartItems::Table, CartItems::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_user_product")
                        .table(CartItems::Table)
                        .col(CartItems::UserId)
                        .col(CartItems::ProductId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProductFiles::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        SellerId,
        Name,
        ProductType,
        Price,
        Currency,
        CategoryId,
        StockQuantity,
        StockStatus,
        Status,
        DownloadLimit,
        DownloadExpiryDays,
        SalesCount,
        CreatedAt,
        UpdatedAt,
        DeletedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum ProductFiles {
        Table,
        Id,
        ProductId,
        FileName,
        FilePath,
        FileSize,
        FileType,
        DisplayName,
        SortOrder,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        UserId,
        ProductId,
        Quantity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_orders_tables {

    use super::m20240601_000001_create_catalog_tables::Products;
    use super::{id_column, money};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(id_column(Orders::Id))
                        .col(ColumnDef::new(Orders::OrderNumber).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::UserId).big_integer().not_null())
                        .col(money(Orders::Subtotal))
                        .col(money(Orders::Discount))
                        .col(money(Orders::ShippingFee))
                        .col(money(Orders::Total))
                        .col(
                            ColumnDef::new(Orders::Currency)
                                .string_len(3)
                                .not_null()
                                .default("KRW"),
                        )
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::ShippingName).string_len(100).null())
                        .col(ColumnDef::new(Orders::ShippingPhone).string_len(30).null())
                        .col(ColumnDef::new(Orders::ShippingAddress).string_len(500).null())
                        .col(ColumnDef::new(Orders::ShippingPostal).string_len(10).null())
                        .col(ColumnDef::new(Orders::ShippingMemo).string_len(255).null())
                        .col(ColumnDef::new(Orders::ShippingCarrier).string_len(20).null())
                        .col(ColumnDef::new(Orders::TrackingNumber).string_len(50).null())
                        .col(ColumnDef::new(Orders::CancelReason).string_len(500).null())
                        .col(
                            ColumnDef::new(Orders::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::ShippedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(id_column(OrderItems::Id))
                        .col(ColumnDef::new(OrderItems::OrderId).big_integer().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).big_integer().not_null())
                        .col(ColumnDef::new(OrderItems::SellerId).big_integer().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string_len(255).not_null())
                        .col(ColumnDef::new(OrderItems::ProductType).string_len(20).not_null())
                        .col(ColumnDef::new(OrderItems::CategoryId).big_integer().null())
                        .col(money(OrderItems::Price))
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(money(OrderItems::Subtotal))
                        .col(
                            ColumnDef::new(OrderItems::PlatformFeeRate)
                                .decimal_len(7, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(money(OrderItems::PlatformFee))
                        .col(money(OrderItems::SellerAmount))
                        .col(ColumnDef::new(OrderItems::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(OrderItems::SettlementStatus)
                                .string_len(20)
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(OrderItems::SettlementId).big_integer().null())
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_product_id")
                                .from(OrderItems::Table, OrderItems::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_seller_settlement")
                        .table(OrderItems::Table)
                        .col(OrderItems::SellerId)
                        .col(OrderItems::SettlementStatus)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        OrderNumber,
        UserId,
        Subtotal,
        Discount,
        ShippingFee,
        Total,
        Currency,
        Status,
        ShippingName,
        ShippingPhone,
        ShippingAddress,
        ShippingPostal,
        ShippingMemo,
        ShippingCarrier,
        TrackingNumber,
        CancelReason,
        PaidAt,
        ShippedAt,
        DeliveredAt,
        CompletedAt,
        CancelledAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        SellerId,
        ProductName,
        ProductType,
        CategoryId,
        Price,
        Quantity,
        Subtotal,
        PlatformFeeRate,
        PlatformFee,
        SellerAmount,
        Status,
        SettlementStatus,
        SettlementId,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_coupon_tables {

    use super::m20240601_000002_create_orders_tables::Orders;
    use super::{id_column, money};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_coupon_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(id_column(Coupons::Id))
                        .col(ColumnDef::new(Coupons::Code).string_len(50).not_null())
                        .col(ColumnDef::new(Coupons::Name).string_len(100).not_null())
                        .col(ColumnDef::new(Coupons::Description).text().null())
                        .col(ColumnDef::new(Coupons::DiscountType).string_len(20).not_null())
                        .col(money(Coupons::DiscountValue))
                        .col(ColumnDef::new(Coupons::MaxDiscount).decimal_len(15, 2).null())
                        .col(money(Coupons::MinOrderAmount))
                        .col(
                            ColumnDef::new(Coupons::ApplyTo)
                                .string_len(20)
                                .not_null()
                                .default("all"),
                        )
                        .col(ColumnDef::new(Coupons::ApplyIds).json().null())
                        .col(ColumnDef::new(Coupons::UsageLimit).integer().null())
                        .col(
                            ColumnDef::new(Coupons::UsagePerUser)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Coupons::UsageCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Coupons::StartsAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::ExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::Status)
                                .string_len(20)
                                .not_null()
                                .default("active"),
                        )
                        .col(
                            ColumnDef::new(Coupons::IsPublic)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Coupons::CreatedBy).big_integer().null())
                        .col(
                            ColumnDef::new(Coupons::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CouponUsages::Table)
                        .if_not_exists()
                        .col(id_column(CouponUsages::Id))
                        .col(ColumnDef::new(CouponUsages::CouponId).big_integer().not_null())
                        .col(ColumnDef::new(CouponUsages::UserId).big_integer().not_null())
                        .col(ColumnDef::new(CouponUsages::OrderId).big_integer().not_null())
                        .col(money(CouponUsages::DiscountAmount))
                        .col(money(CouponUsages::ShippingWaived))
                        .col(
                            ColumnDef::new(CouponUsages::UsedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_coupon_usages_coupon_id")
                                .from(CouponUsages::Table, CouponUsages::CouponId)
                                .to(Coupons::Table, Coupons::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_coupon_usages_order_id")
                                .from(CouponUsages::Table, CouponUsages::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // One coupon per order
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupon_usages_order_id")
                        .table(CouponUsages::Table)
                        .col(CouponUsages::OrderId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupon_usages_coupon_user")
                        .table(CouponUsages::Table)
                        .col(CouponUsages::CouponId)
                        .col(CouponUsages::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CouponUsages::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Coupons {
        Table,
        Id,
        Code,
        Name,
        Description,
        DiscountType,
        DiscountValue,
        MaxDiscount,
        MinOrderAmount,
        ApplyTo,
        ApplyIds,
        UsageLimit,
        UsagePerUser,
        UsageCount,
        StartsAt,
        ExpiresAt,
        Status,
        IsPublic,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CouponUsages {
        Table,
        Id,
        CouponId,
        UserId,
        OrderId,
        DiscountAmount,
        ShippingWaived,
        UsedAt,
    }
}

mod m20240601_000004_create_payments_table {

    use super::m20240601_000002_create_orders_tables::Orders;
    use super::{id_column, money};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(id_column(Payments::Id))
                        .col(ColumnDef::new(Payments::OrderId).big_integer().not_null())
                        .col(ColumnDef::new(Payments::PgProvider).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::PgTid).string_len(100).null())
                        .col(ColumnDef::new(Payments::PgOrderId).string_len(100).not_null())
                        .col(ColumnDef::new(Payments::PaymentMethod).string_len(20).not_null())
                        .col(money(Payments::Amount))
                        .col(
                            ColumnDef::new(Payments::Currency)
                                .string_len(3)
                                .not_null()
                                .default("KRW"),
                        )
                        .col(
                            ColumnDef::new(Payments::Status)
                                .string_len(20)
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(Payments::CardCompany).string_len(50).null())
                        .col(ColumnDef::new(Payments::CardNumber).string_len(30).null())
                        .col(ColumnDef::new(Payments::CardType).string_len(20).null())
                        .col(ColumnDef::new(Payments::InstallMonth).integer().null())
                        .col(ColumnDef::new(Payments::VbankName).string_len(50).null())
                        .col(ColumnDef::new(Payments::VbankNumber).string_len(50).null())
                        .col(ColumnDef::new(Payments::VbankHolder).string_len(50).null())
                        .col(
                            ColumnDef::new(Payments::VbankDue)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Payments::PgFee).decimal_len(15, 2).null())
                        .col(money(Payments::CancelledAmount))
                        .col(ColumnDef::new(Payments::CancelReason).string_len(500).null())
                        .col(
                            ColumnDef::new(Payments::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Payments::RawResponse).text().null())
                        .col(
                            ColumnDef::new(Payments::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_id")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_pg_tid")
                        .table(Payments::Table)
                        .col(Payments::PgTid)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_pg_order_id")
                        .table(Payments::Table)
                        .col(Payments::PgOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        PgProvider,
        PgTid,
        PgOrderId,
        PaymentMethod,
        Amount,
        Currency,
        Status,
        CardCompany,
        CardNumber,
        CardType,
        InstallMonth,
        VbankName,
        VbankNumber,
        VbankHolder,
        VbankDue,
        PgFee,
        CancelledAmount,
        CancelReason,
        CancelledAt,
        RawResponse,
        PaidAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000005_create_settlements_table {

    use super::{id_column, money};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_settlements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Settlements::Table)
                        .if_not_exists()
                        .col(id_column(Settlements::Id))
                        .col(ColumnDef::new(Settlements::SellerId).big_integer().not_null())
                        .col(
                            ColumnDef::new(Settlements::PeriodStart)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Settlements::PeriodEnd)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(money(Settlements::TotalSales))
                        .col(money(Settlements::TotalRefunds))
                        .col(money(Settlements::PgFees))
                        .col(money(Settlements::PlatformFees))
                        .col(money(Settlements::SettlementAmount))
                        .col(
                            ColumnDef::new(Settlements::ItemCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Settlements::Status)
                                .string_len(20)
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(Settlements::BankName).string_len(50).null())
                        .col(ColumnDef::new(Settlements::BankAccount).string_len(50).null())
                        .col(ColumnDef::new(Settlements::BankHolder).string_len(50).null())
                        .col(ColumnDef::new(Settlements::PayoutReference).string_len(100).null())
                        .col(ColumnDef::new(Settlements::FailureReason).string_len(500).null())
                        .col(
                            ColumnDef::new(Settlements::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Settlements::ProcessedBy).big_integer().null())
                        .col(ColumnDef::new(Settlements::Notes).text().null())
                        .col(
                            ColumnDef::new(Settlements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Settlements::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // At most one settlement per seller and period
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_settlements_seller_period")
                        .table(Settlements::Table)
                        .col(Settlements::SellerId)
                        .col(Settlements::PeriodStart)
                        .col(Settlements::PeriodEnd)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Settlements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Settlements {
        Table,
        Id,
        SellerId,
        PeriodStart,
        PeriodEnd,
        TotalSales,
        TotalRefunds,
        PgFees,
        PlatformFees,
        SettlementAmount,
        ItemCount,
        Status,
        BankName,
        BankAccount,
        BankHolder,
        PayoutReference,
        FailureReason,
        ProcessedAt,
        ProcessedBy,
        Notes,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000006_create_downloads_table {

    use super::id_column;
    use super::m20240601_000001_create_catalog_tables::ProductFiles;
    use super::m20240601_000002_create_orders_tables::OrderItems;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000006_create_downloads_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Downloads::Table)
                        .if_not_exists()
                        .col(id_column(Downloads::Id))
                        .col(ColumnDef::new(Downloads::OrderItemId).big_integer().not_null())
                        .col(ColumnDef::new(Downloads::FileId).big_integer().not_null())
                        .col(ColumnDef::new(Downloads::UserId).big_integer().not_null())
                        .col(ColumnDef::new(Downloads::Token).string_len(64).not_null())
                        .col(
                            ColumnDef::new(Downloads::DownloadCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Downloads::DownloadLimit).integer().not_null())
                        .col(
                            ColumnDef::new(Downloads::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Downloads::LastDownloadedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Downloads::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_downloads_order_item_id")
                                .from(Downloads::Table, Downloads::OrderItemId)
                                .to(OrderItems::Table, OrderItems::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_downloads_file_id")
                                .from(Downloads::Table, Downloads::FileId)
                                .to(ProductFiles::Table, ProductFiles::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_downloads_token")
                        .table(Downloads::Table)
                        .col(Downloads::Token)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_downloads_item_file")
                        .table(Downloads::Table)
                        .col(Downloads::OrderItemId)
                        .col(Downloads::FileId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Downloads::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Downloads {
        Table,
        Id,
        OrderItemId,
        FileId,
        UserId,
        Token,
        DownloadCount,
        DownloadLimit,
        ExpiresAt,
        LastDownloadedAt,
        CreatedAt,
    }
}

/// Connects to `db_url` and applies every pending migration.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(true);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}

/// Rolls back the most recent `steps` migrations.
pub async fn rollback_migration(db_url: &str, steps: u32) -> Result<()> {
    let db = Database::connect(db_url).await?;
    info!(steps, "Rolling back migrations");
    Migrator::down(&db, Some(steps)).await?;
    Ok(())
}
