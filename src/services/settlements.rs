use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use validator::Validate;

use super::payouts::{Payout, PayoutInstruction};
use super::{Page, PageRequest};
use crate::config::SettlementConfig;
use crate::entities::order::{self, OrderStatus};
use crate::entities::order_item::{self, ItemSettlementStatus};
use crate::entities::settlement::{self, SettlementAmounts, SettlementStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Order states whose lines are payable to the seller.
const SETTLEABLE: [OrderStatus; 2] = [OrderStatus::Completed, OrderStatus::Delivered];

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSettlementRequest {
    pub seller_id: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[validate(length(max = 50))]
    pub bank_name: Option<String>,
    #[validate(length(max = 50))]
    pub bank_account: Option<String>,
    #[validate(length(max = 50))]
    pub bank_holder: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ProcessSettlementRequest {
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub total_sales: Decimal,
    pub total_refunds: Decimal,
    pub total_pg_fees: Decimal,
    pub total_platform_fees: Decimal,
    /// Paid out
    pub total_settled: Decimal,
    /// Created but not yet paid out
    pub pending_amount: Decimal,
    pub settlement_count: u64,
}

impl SettlementSummary {
    pub fn from_settlements(settlements: &[settlement::Model]) -> Self {
        settlements.iter().fold(Self::default(), |mut acc, s| {
            acc.total_sales += s.total_sales;
            acc.total_refunds += s.total_refunds;
            acc.total_pg_fees += s.pg_fees;
            acc.total_platform_fees += s.platform_fees;
            match s.status {
                SettlementStatus::Completed => acc.total_settled += s.settlement_amount,
                SettlementStatus::Pending => acc.pending_amount += s.settlement_amount,
                SettlementStatus::Processing | SettlementStatus::Failed => {}
            }
            acc.settlement_count += 1;
            acc
        })
    }
}

/// Splits line subtotals into sales and refunds by the parent order's status.
pub fn aggregate_lines(lines: &[(order_item::Model, OrderStatus)]) -> (Decimal, Decimal) {
    lines
        .iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(sales, refunds), (item, status)| {
            if *status == OrderStatus::Refunded {
                (sales, refunds + item.subtotal)
            } else {
                (sales + item.subtotal, refunds)
            }
        })
}

/// Seller settlements over half-open periods.
///
/// Creating a settlement marks every aggregated line `settled` in the same
/// transaction, so overlapping periods can never count a line twice.
#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
    payout: Arc<dyn Payout>,
    event_sender: Arc<EventSender>,
    config: SettlementConfig,
}

impl SettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        payout: Arc<dyn Payout>,
        event_sender: Arc<EventSender>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            db,
            payout,
            event_sender,
            config,
        }
    }

    #[instrument(skip(self, request), fields(seller_id = request.seller_id))]
    pub async fn create(
        &self,
        request: CreateSettlementRequest,
    ) -> Result<settlement::Model, ServiceError> {
        request.validate()?;
        let (seller_id, start, end) = (request.seller_id, request.period_start, request.period_end);
        if end <= start {
            return Err(ServiceError::ValidationError(
                "invalid settlement period".into(),
            ));
        }

        let existing = settlement::Entity::find()
            .filter(settlement::Column::SellerId.eq(seller_id))
            .filter(settlement::Column::PeriodStart.eq(start))
            .filter(settlement::Column::PeriodEnd.eq(end))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "settlement already exists for this period".into(),
            ));
        }

        let lines = pending_lines(&*self.db, seller_id, start, end).await?;
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation("no orders to settle".into()));
        }
        let (sales, refunds) = aggregate_lines(&lines);
        let amounts = SettlementAmounts::compute(
            sales,
            refunds,
            self.config.pg_fee_rate,
            self.config.platform_rate,
        );
        let item_ids: Vec<i64> = lines.iter().map(|(item, _)| item.id).collect();

        let txn = self.db.begin().await?;
        let created = settlement::ActiveModel {
            seller_id: Set(seller_id),
            period_start: Set(start),
            period_end: Set(end),
            total_sales: Set(amounts.total_sales),
            total_refunds: Set(amounts.total_refunds),
            pg_fees: Set(amounts.pg_fees),
            platform_fees: Set(amounts.platform_fees),
            settlement_amount: Set(amounts.settlement_amount),
            item_count: Set(i32::try_from(item_ids.len()).unwrap_or(i32::MAX)),
            status: Set(SettlementStatus::Pending),
            bank_name: Set(request.bank_name),
            bank_account: Set(request.bank_account),
            bank_holder: Set(request.bank_holder),
            notes: Set(request.notes),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            ServiceError::on_unique_violation(e, "settlement already exists for this period")
        })?;

        let marked = order_item::Entity::update_many()
            .col_expr(
                order_item::Column::SettlementStatus,
                Expr::value(ItemSettlementStatus::Settled),
            )
            .col_expr(order_item::Column::SettlementId, Expr::value(created.id))
            .col_expr(order_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order_item::Column::Id.is_in(item_ids.iter().copied()))
            .filter(order_item::Column::SettlementStatus.eq(ItemSettlementStatus::Pending))
            .exec(&txn)
            .await?;
        if marked.rows_affected != item_ids.len() as u64 {
            return Err(ServiceError::Conflict(
                "order items were settled concurrently".into(),
            ));
        }
        txn.commit().await?;

        counter!("ledger.settlements.created", 1);
        self.event_sender
            .send_or_log(Event::SettlementCreated {
                settlement_id: created.id,
                seller_id,
                amount: created.settlement_amount,
            })
            .await;
        info!(
            settlement_id = created.id,
            items = created.item_count,
            amount = %created.settlement_amount,
            "settlement created"
        );
        Ok(created)
    }

    /// Pays a pending (or previously failed) settlement out.
    ///
    /// The settlement is claimed as `processing` first; the payout result
    /// then moves it to `completed` or `failed`. A failed settlement may be
    /// processed again.
    #[instrument(skip(self, request))]
    pub async fn process(
        &self,
        settlement_id: i64,
        operator_id: i64,
        request: ProcessSettlementRequest,
    ) -> Result<settlement::Model, ServiceError> {
        request.validate()?;
        let current = self.find(settlement_id).await?;
        if !current.status.can_start_payout() {
            return Err(ServiceError::InvalidStatus(format!(
                "settlement in status {} cannot be processed",
                current.status
            )));
        }

        let now = Utc::now();
        let mut claim = settlement::Entity::update_many()
            .col_expr(settlement::Column::Status, Expr::value(SettlementStatus::Processing))
            .col_expr(settlement::Column::ProcessedAt, Expr::value(now))
            .col_expr(settlement::Column::ProcessedBy, Expr::value(operator_id))
            .col_expr(settlement::Column::UpdatedAt, Expr::value(now))
            .filter(settlement::Column::Id.eq(settlement_id))
            .filter(settlement::Column::Status.eq(current.status));
        if let Some(notes) = request.notes {
            claim = claim.col_expr(settlement::Column::Notes, Expr::value(notes));
        }
        if claim.exec(&*self.db).await?.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "settlement is already being processed".into(),
            ));
        }

        let instruction = PayoutInstruction {
            settlement_id,
            seller_id: current.seller_id,
            amount: current.settlement_amount,
            bank_name: current.bank_name.clone(),
            bank_account: current.bank_account.clone(),
            bank_holder: current.bank_holder.clone(),
        };
        match self.payout.send(&instruction).await {
            Ok(receipt) => {
                settlement::Entity::update_many()
                    .col_expr(settlement::Column::Status, Expr::value(SettlementStatus::Completed))
                    .col_expr(
                        settlement::Column::PayoutReference,
                        Expr::value(receipt.reference.clone()),
                    )
                    .col_expr(settlement::Column::FailureReason, Expr::value(Option::<String>::None))
                    .col_expr(settlement::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(settlement::Column::Id.eq(settlement_id))
                    .filter(settlement::Column::Status.eq(SettlementStatus::Processing))
                    .exec(&*self.db)
                    .await?;
                self.event_sender
                    .send_or_log(Event::SettlementCompleted {
                        settlement_id,
                        reference: receipt.reference,
                    })
                    .await;
                info!(settlement_id, "settlement paid out");
                self.find(settlement_id).await
            }
            Err(e) => {
                let reason = e.to_string();
                let marked = settlement::Entity::update_many()
                    .col_expr(settlement::Column::Status, Expr::value(SettlementStatus::Failed))
                    .col_expr(settlement::Column::FailureReason, Expr::value(reason.clone()))
                    .col_expr(settlement::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(settlement::Column::Id.eq(settlement_id))
                    .filter(settlement::Column::Status.eq(SettlementStatus::Processing))
                    .exec(&*self.db)
                    .await;
                if let Err(db_err) = marked {
                    error!(settlement_id, error = %db_err, "settlement left processing after payout failure");
                }
                self.event_sender
                    .send_or_log(Event::SettlementFailed {
                        settlement_id,
                        reason,
                    })
                    .await;
                Err(e.into())
            }
        }
    }

    /// `seller_id` 0 reads any settlement.
    pub async fn get(
        &self,
        settlement_id: i64,
        seller_id: i64,
    ) -> Result<settlement::Model, ServiceError> {
        let found = self.find(settlement_id).await?;
        if seller_id > 0 && found.seller_id != seller_id {
            return Err(ServiceError::Forbidden(
                "you are not the owner of this settlement".into(),
            ));
        }
        Ok(found)
    }

    pub async fn list(
        &self,
        seller_id: Option<i64>,
        status: Option<SettlementStatus>,
        page: PageRequest,
    ) -> Result<Page<settlement::Model>, ServiceError> {
        let page = page.normalized();
        let mut query = settlement::Entity::find();
        if let Some(seller_id) = seller_id {
            query = query.filter(settlement::Column::SellerId.eq(seller_id));
        }
        if let Some(status) = status {
            query = query.filter(settlement::Column::Status.eq(status));
        }
        let paginator = query
            .order_by_desc(settlement::Column::PeriodStart)
            .order_by_desc(settlement::Column::Id)
            .paginate(&*self.db, page.limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.index()).await?;
        Ok(Page::new(items, total, page))
    }

    pub async fn summary(&self, seller_id: i64) -> Result<SettlementSummary, ServiceError> {
        let settlements = settlement::Entity::find()
            .filter(settlement::Column::SellerId.eq(seller_id))
            .all(&*self.db)
            .await?;
        Ok(SettlementSummary::from_settlements(&settlements))
    }

    /// Lines a settlement for this period would aggregate right now.
    pub async fn pending_items(
        &self,
        seller_id: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(pending_lines(&*self.db, seller_id, period_start, period_end)
            .await?
            .into_iter()
            .map(|(item, _)| item)
            .collect())
    }

    async fn find(&self, settlement_id: i64) -> Result<settlement::Model, ServiceError> {
        settlement::Entity::find_by_id(settlement_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("settlement {}", settlement_id)))
    }
}

/// Unsettled lines of `seller_id` whose order is settleable and was paid in
/// `[start, end)`, with the order's status.
async fn pending_lines<C: ConnectionTrait>(
    conn: &C,
    seller_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<(order_item::Model, OrderStatus)>, ServiceError> {
    let rows = order_item::Entity::find()
        .find_also_related(order::Entity)
        .filter(order_item::Column::SellerId.eq(seller_id))
        .filter(order_item::Column::SettlementStatus.eq(ItemSettlementStatus::Pending))
        .filter(order::Column::Status.is_in(SETTLEABLE))
        .filter(order::Column::PaidAt.gte(start))
        .filter(order::Column::PaidAt.lt(end))
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(item, order)| order.map(|o| (item, o.status)))
        .collect())
}
