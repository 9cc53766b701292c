use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};

/// Payment lifecycle.
///
/// `pending -> ready -> paid`, `pending -> failed`, and from `paid` through
/// `partial_cancelled` to `cancelled` as refunds consume the balance.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
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
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "partial_cancelled")]
    PartialCancelled,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl PaymentStatus {
    /// Cancels draw down a captured balance, so only these states accept them.
    pub fn is_cancellable(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::PartialCancelled)
    }

    /// Whether an asynchronous provider notification may move a payment from
    /// `self` to `to`.
    pub fn accepts_notification(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, to) {
            (Pending, Paid | Ready | Failed) => true,
            (Ready, Paid | Cancelled) => true,
            (Paid | PartialCancelled, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PgProvider {
    #[sea_orm(string_value = "tosspayments")]
    Tosspayments,
    #[sea_orm(string_value = "inicis")]
    Inicis,
    #[sea_orm(string_value = "kakaopay")]
    Kakaopay,
}

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "bank")]
    Bank,
    #[sea_orm(string_value = "virtual")]
    Virtual,
    #[sea_orm(string_value = "phone")]
    Phone,
}

/// The `payments` table. One row per payment attempt against an order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_id: i64,
    pub pg_provider: PgProvider,
    pub pg_tid: Option<String>,
    pub pg_order_id: String,
    pub payment_method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub card_company: Option<String>,
    pub card_number: Option<String>,
    pub card_type: Option<String>,
    pub install_month: Option<i32>,
    pub vbank_name: Option<String>,
    pub vbank_number: Option<String>,
    pub vbank_holder: Option<String>,
    pub vbank_due: Option<DateTime<Utc>>,
    pub pg_fee: Option<Decimal>,
    pub cancelled_amount: Decimal,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Text", nullable)]
    #[serde(skip_serializing)]
    pub raw_response: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Amount still refundable.
    pub fn remaining(&self) -> Decimal {
        (self.amount - self.cancelled_amount).max(Decimal::ZERO)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

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
