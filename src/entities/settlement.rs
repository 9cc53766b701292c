use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettlementStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl SettlementStatus {
    /// A payout run may start from a fresh settlement or retry a failed one.
    pub fn can_start_payout(self) -> bool {
        matches!(self, SettlementStatus::Pending | SettlementStatus::Failed)
    }
}

/// A seller payout for the half-open window `[period_start, period_end)`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "settlements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub seller_id: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_sales: Decimal,
    pub total_refunds: Decimal,
    pub pg_fees: Decimal,
    pub platform_fees: Decimal,
    pub settlement_amount: Decimal,
    pub item_count: i32,
    pub status: SettlementStatus,
    pub bank_name: Option<String>,
    pub bank_account: Option<String>,
    pub bank_holder: Option<String>,
    pub payout_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<i64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fee breakdown for one settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementAmounts {
    pub total_sales: Decimal,
    pub total_refunds: Decimal,
    pub pg_fees: Decimal,
    pub platform_fees: Decimal,
    pub settlement_amount: Decimal,
}

impl SettlementAmounts {
    /// Fees are charged on net sales (`sales - refunds`) and rounded to cents.
    pub fn compute(
        total_sales: Decimal,
        total_refunds: Decimal,
        pg_fee_rate: Decimal,
        platform_rate: Decimal,
    ) -> Self {
        let net = total_sales - total_refunds;
        let pg_fees = (net * pg_fee_rate).round_dp(2);
        let platform_fees = (net * platform_rate).round_dp(2);
        Self {
            total_sales,
            total_refunds,
            pg_fees,
            platform_fees,
            settlement_amount: net - pg_fees - platform_fees,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert && matches!(active_model.created_at, ActiveValue::NotSet) {
            active_model.created_at = Set(now);
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}
