//! Payment orchestration: prepare, complete, cancel and provider webhooks.
//!
//! Every status change is a conditional update on the payment's current
//! status, so a repeated complete or a re-delivered webhook finds nothing to
//! update and becomes a no-op instead of a second credit.

use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use super::catalog::Catalog;
use super::orders::{ensure_owner, find_order, load_items, release_stock, status_update};
use crate::entities::order::{self, OrderStatus};
use crate::entities::order_item::{self, OrderItemStatus};
use crate::entities::payment::{self, PaymentMethod, PaymentStatus, PgProvider};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateways::{
    CancelRequest, CompleteRequest, CompleteResponse, GatewayRegistry, PrepareRequest,
    PrepareResponse, WebhookResult,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PreparePaymentRequest {
    pub order_id: i64,
    pub pg_provider: PgProvider,
    pub payment_method: PaymentMethod,
    #[validate(url)]
    pub return_url: String,
    #[validate(url)]
    pub cancel_url: Option<String>,
    #[validate(email)]
    pub buyer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparePaymentResponse {
    pub payment_id: i64,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub pg_provider: PgProvider,
    /// `paid` when nothing was left to charge and no provider was involved.
    pub status: PaymentStatus,
    #[serde(flatten)]
    pub launch: PrepareResponse,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CompletePaymentRequest {
    pub payment_id: i64,
    #[validate(length(min = 1, max = 200))]
    pub pg_tid: String,
    #[validate(length(min = 1, max = 100))]
    pub pg_order_id: String,
    pub amount: Decimal,
    /// Provider callback parameters forwarded by the client.
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CancelPaymentRequest {
    /// Defaults to the whole remaining balance.
    pub cancel_amount: Option<Decimal>,
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
}

/// What a webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        payment_id: i64,
        status: PaymentStatus,
    },
    /// Already in the reported state, or the report would move it backwards.
    Ignored {
        payment_id: i64,
        status: PaymentStatus,
    },
}

type HmacSha256 = Hmac<Sha256>;

/// Checks a hex `x-webhook-signature` against HMAC-SHA256 of the raw body.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Short order title shown in the provider's payment window.
pub(crate) fn product_title(items: &[order_item::Model]) -> String {
    match items {
        [] => "order".to_string(),
        [only] => only.product_name.clone(),
        [first, rest @ ..] => format!("{} and {} more", first.product_name, rest.len()),
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    gateways: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        gateways: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            gateways,
            event_sender,
        }
    }

    pub fn providers(&self) -> Vec<PgProvider> {
        self.gateways.providers()
    }

    /// Opens a payment attempt for a pending order. Further attempts are
    /// allowed until one of them is paid.
    #[instrument(skip(self, request), fields(order_id = request.order_id, provider = %request.pg_provider))]
    pub async fn prepare(
        &self,
        user_id: i64,
        request: PreparePaymentRequest,
    ) -> Result<PreparePaymentResponse, ServiceError> {
        request.validate()?;
        let order = find_order(&*self.db, request.order_id).await?;
        ensure_owner(&order, user_id)?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "order in status {} cannot be paid",
                order.status
            )));
        }
        if order.total < Decimal::ZERO {
            return Err(ServiceError::InvalidInput("order total must not be negative".into()));
        }
        let settled = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.is_in([PaymentStatus::Paid, PaymentStatus::Ready]))
            .one(&*self.db)
            .await?;
        if settled.is_some() {
            return Err(ServiceError::Conflict("order has already been paid".into()));
        }
        if order.total.is_zero() {
            return self.settle_free(order, request.pg_provider).await;
        }

        let gateway = self.gateways.get(request.pg_provider)?;
        let items = load_items(&*self.db, order.id).await?;
        let launch = gateway
            .prepare(&PrepareRequest {
                order_id: order.id,
                order_number: order.order_number.clone(),
                amount: order.total,
                currency: order.currency.clone(),
                product_name: product_title(&items),
                buyer_name: order.shipping_name.clone().unwrap_or_default(),
                buyer_email: request.buyer_email.clone().unwrap_or_default(),
                buyer_phone: order.shipping_phone.clone().unwrap_or_default(),
                payment_method: request.payment_method,
                return_url: request.return_url.clone(),
                cancel_url: request
                    .cancel_url
                    .clone()
                    .unwrap_or_else(|| request.return_url.clone()),
                notify_url: None,
            })
            .await?;

        let payment = payment::ActiveModel {
            order_id: Set(order.id),
            pg_provider: Set(request.pg_provider),
            pg_tid: Set(launch.pg_tid.clone()),
            pg_order_id: Set(launch.pg_order_id.clone()),
            payment_method: Set(request.payment_method),
            amount: Set(order.total),
            currency: Set(order.currency.clone()),
            status: Set(PaymentStatus::Pending),
            cancelled_amount: Set(Decimal::ZERO),
            ..Default::default()
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::PaymentPrepared {
                payment_id: payment.id,
                order_id: order.id,
                provider: request.pg_provider.to_string(),
            })
            .await;
        info!(payment_id = payment.id, pg_order_id = %payment.pg_order_id, "payment prepared");

        Ok(PreparePaymentResponse {
            payment_id: payment.id,
            order_number: order.order_number,
            amount: payment.amount,
            currency: payment.currency,
            pg_provider: payment.pg_provider,
            status: payment.status,
            launch,
        })
    }

    /// Discounts covered the whole order: record a zero payment as captured
    /// and mark the order paid without contacting a provider.
    async fn settle_free(
        &self,
        order: order::Model,
        provider: PgProvider,
    ) -> Result<PreparePaymentResponse, ServiceError> {
        let now = Utc::now();
        let pg_order_id = format!("FREE_{}", order.order_number);
        let txn = self.db.begin().await?;
        let payment = payment::ActiveModel {
            order_id: Set(order.id),
            pg_provider: Set(provider),
            pg_order_id: Set(pg_order_id.clone()),
            payment_method: Set(PaymentMethod::Card),
            amount: Set(Decimal::ZERO),
            currency: Set(order.currency.clone()),
            status: Set(PaymentStatus::Paid),
            cancelled_amount: Set(Decimal::ZERO),
            paid_at: Set(Some(now)),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        let result = status_update(order.id, &[OrderStatus::Pending], OrderStatus::Paid, now)
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus("order is no longer pending".into()));
        }
        txn.commit().await?;

        info!(payment_id = payment.id, order_id = order.id, "order settled without charge");
        self.after_capture(&payment).await;
        Ok(PreparePaymentResponse {
            payment_id: payment.id,
            order_number: order.order_number,
            amount: payment.amount,
            currency: payment.currency,
            pg_provider: payment.pg_provider,
            status: payment.status,
            launch: PrepareResponse {
                pg_order_id,
                ..Default::default()
            },
        })
    }

    /// Confirms a pending payment with its provider.
    ///
    /// Replaying a completion that already succeeded with the same provider
    /// transaction returns the stored payment unchanged. Gateway failures
    /// leave the payment `failed`, never `pending`.
    #[instrument(skip(self, request), fields(payment_id = request.payment_id))]
    pub async fn complete(
        &self,
        user_id: i64,
        request: CompletePaymentRequest,
    ) -> Result<payment::Model, ServiceError> {
        request.validate()?;
        let payment = self.find_payment(request.payment_id).await?;
        let order = find_order(&*self.db, payment.order_id).await?;
        ensure_owner(&order, user_id)?;

        if matches!(payment.status, PaymentStatus::Paid | PaymentStatus::Ready)
            && payment.pg_tid.as_deref() == Some(request.pg_tid.as_str())
        {
            return Ok(payment);
        }
        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "payment in status {} cannot be completed",
                payment.status
            )));
        }
        if request.amount != payment.amount {
            warn!(expected = %payment.amount, got = %request.amount, "payment amount mismatch");
            return Err(ServiceError::InvalidInput("payment amount mismatch".into()));
        }
        if request.pg_order_id != payment.pg_order_id {
            return Err(ServiceError::InvalidInput("provider order id mismatch".into()));
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "order in status {} cannot be paid",
                order.status
            )));
        }

        let gateway = self.gateways.get(payment.pg_provider)?;
        let outcome = gateway
            .complete(&CompleteRequest {
                order_id: order.id,
                pg_tid: request.pg_tid.clone(),
                pg_order_id: request.pg_order_id.clone(),
                amount: payment.amount,
                raw_response: request.raw_response.as_ref().map(|v| v.to_string()),
                ready_tid: payment.pg_tid.clone(),
            })
            .await;

        let confirmed = match outcome {
            Ok(resp) if resp.success && resp.amount == payment.amount => resp,
            Ok(resp) => {
                let reason = if resp.success {
                    "provider confirmed a different amount".to_string()
                } else {
                    resp.message
                        .clone()
                        .unwrap_or_else(|| "payment declined".to_string())
                };
                let tid = payment.pg_tid.clone().unwrap_or_else(|| request.pg_tid.clone());
                self.mark_failed(&payment, Some(tid), &reason, resp.raw_response)
                    .await;
                return Err(ServiceError::PaymentFailed(reason));
            }
            Err(e) => {
                let tid = payment.pg_tid.clone().unwrap_or_else(|| request.pg_tid.clone());
                self.mark_failed(&payment, Some(tid), &e.to_string(), None)
                    .await;
                return Err(e.into());
            }
        };

        let txn = self.db.begin().await?;
        let mut active: payment::ActiveModel = payment.clone().into();
        apply_confirmation(&mut active, &confirmed);
        let updated = match payment::Entity::update(active)
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&txn)
            .await
        {
            Ok(updated) => updated,
            Err(DbErr::RecordNotUpdated) => {
                // Another completion or webhook finished first.
                drop(txn);
                return self.find_payment(payment.id).await;
            }
            Err(e) => return Err(e.into()),
        };
        if updated.status == PaymentStatus::Paid {
            self.mark_order_paid(&txn, updated.order_id).await?;
        }
        txn.commit().await?;

        self.after_capture(&updated).await;
        Ok(updated)
    }

    /// Refunds all or part of a captured payment.
    #[instrument(skip(self, request))]
    pub async fn cancel(
        &self,
        user_id: i64,
        payment_id: i64,
        request: CancelPaymentRequest,
    ) -> Result<payment::Model, ServiceError> {
        request.validate()?;
        let payment = self.find_payment(payment_id).await?;
        let order = find_order(&*self.db, payment.order_id).await?;
        ensure_owner(&order, user_id)?;
        if !payment.status.is_cancellable() {
            return Err(ServiceError::InvalidStatus(format!(
                "payment in status {} cannot be cancelled",
                payment.status
            )));
        }

        let remaining = payment.remaining();
        let amount = request.cancel_amount.unwrap_or(remaining);
        if amount <= Decimal::ZERO || amount > remaining {
            return Err(ServiceError::InvalidInput(format!(
                "cancel amount must be between 0 and {}",
                remaining
            )));
        }
        let pg_tid = payment.pg_tid.clone().ok_or_else(|| {
            ServiceError::InvalidStatus("payment has no provider transaction".into())
        })?;

        let gateway = self.gateways.get(payment.pg_provider)?;
        let fully = amount == remaining;
        let claimed_status = if fully {
            PaymentStatus::Cancelled
        } else {
            PaymentStatus::PartialCancelled
        };

        // Claim the refund before asking the provider, so two requests never
        // both reach it for the same balance.
        let claim = payment::Entity::update_many()
            .col_expr(
                payment::Column::CancelledAmount,
                Expr::col(payment::Column::CancelledAmount).add(amount),
            )
            .col_expr(payment::Column::Status, Expr::value(claimed_status))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(payment.status))
            .filter(payment::Column::CancelledAmount.eq(payment.cancelled_amount))
            .exec(&*self.db)
            .await?;
        if claim.rows_affected == 0 {
            return Err(ServiceError::Conflict("payment changed concurrently".into()));
        }

        let outcome = gateway
            .cancel(&CancelRequest {
                pg_tid,
                pg_order_id: payment.pg_order_id.clone(),
                cancel_amount: amount,
                total_amount: payment.amount,
                reason: request.reason.clone(),
            })
            .await;
        let resp = match outcome {
            Ok(resp) if resp.success => resp,
            Ok(_) => {
                self.release_claim(&payment, amount, claimed_status).await;
                return Err(ServiceError::PaymentFailed("cancel rejected by provider".into()));
            }
            Err(e) => {
                self.release_claim(&payment, amount, claimed_status).await;
                return Err(e.into());
            }
        };
        if resp.cancelled_amount != amount {
            warn!(requested = %amount, reported = %resp.cancelled_amount, "provider reported a different cancel amount");
        }

        let txn = self.db.begin().await?;
        payment::Entity::update_many()
            .col_expr(payment::Column::CancelReason, Expr::value(request.reason.clone()))
            .col_expr(
                payment::Column::CancelledAt,
                Expr::value(resp.cancelled_at.unwrap_or_else(Utc::now)),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .exec(&txn)
            .await?;
        let closed = if fully {
            close_order(&txn, &order).await?
        } else {
            None
        };
        txn.commit().await?;

        if closed == Some(OrderStatus::Cancelled) {
            let items = load_items(&*self.db, order.id).await?;
            release_stock(self.catalog.as_ref(), &items).await;
        }
        self.event_sender
            .send_or_log(Event::PaymentCancelled {
                payment_id,
                order_id: order.id,
                amount,
                fully_cancelled: fully,
            })
            .await;
        info!(payment_id, %amount, fully, "payment cancelled");
        self.find_payment(payment_id).await
    }

    pub async fn get_payment(
        &self,
        user_id: i64,
        payment_id: i64,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.find_payment(payment_id).await?;
        let order = find_order(&*self.db, payment.order_id).await?;
        ensure_owner(&order, user_id)?;
        Ok(payment)
    }

    /// Latest payment attempt of an order.
    pub async fn get_payment_by_order(
        &self,
        user_id: i64,
        order_id: i64,
    ) -> Result<payment::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::Id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment for order {}", order_id)))
    }

    /// Applies a provider notification. The payment is located by provider
    /// transaction id first, then by provider order id.
    #[instrument(skip(self, payload), fields(provider = %provider))]
    pub async fn handle_webhook(
        &self,
        provider: PgProvider,
        payload: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        let gateway = self.gateways.get(provider)?;
        let result = gateway.handle_webhook(payload).await?;
        let payment = self.locate(provider, &result).await?;

        let target = result.status;
        if payment.status == target || !payment.status.accepts_notification(target) {
            info!(payment_id = payment.id, current = %payment.status, reported = %target, "webhook ignored");
            return Ok(WebhookOutcome::Ignored {
                payment_id: payment.id,
                status: payment.status,
            });
        }
        if target == PaymentStatus::Paid && result.amount.is_some_and(|a| a != payment.amount) {
            warn!(payment_id = payment.id, "webhook amount mismatch");
            return Err(ServiceError::InvalidInput("webhook amount mismatch".into()));
        }
        if target == PaymentStatus::Paid {
            // Capture is only credited once the provider confirms it on lookup.
            let tid = result
                .pg_tid
                .as_deref()
                .or(payment.pg_tid.as_deref())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    ServiceError::InvalidInput("paid notification without a transaction id".into())
                })?;
            if let Err(e) = gateway.verify(tid, payment.amount).await {
                warn!(payment_id = payment.id, error = %e, "provider did not confirm notified capture");
                return Err(e.into());
            }
        }

        let applied = match target {
            PaymentStatus::Cancelled => self.apply_provider_cancel(&payment).await?,
            _ => self.apply_notification(&payment, &result).await?,
        };
        Ok(match applied {
            Some(status) => WebhookOutcome::Applied {
                payment_id: payment.id,
                status,
            },
            None => WebhookOutcome::Ignored {
                payment_id: payment.id,
                status: self.find_payment(payment.id).await?.status,
            },
        })
    }

    async fn locate(
        &self,
        provider: PgProvider,
        result: &WebhookResult,
    ) -> Result<payment::Model, ServiceError> {
        if let Some(tid) = result.pg_tid.as_deref().filter(|t| !t.is_empty()) {
            let found = payment::Entity::find()
                .filter(payment::Column::PgProvider.eq(provider))
                .filter(payment::Column::PgTid.eq(tid))
                .one(&*self.db)
                .await?;
            if let Some(payment) = found {
                return Ok(payment);
            }
        }
        if let Some(oid) = result.pg_order_id.as_deref().filter(|o| !o.is_empty()) {
            let found = payment::Entity::find()
                .filter(payment::Column::PgProvider.eq(provider))
                .filter(payment::Column::PgOrderId.eq(oid))
                .one(&*self.db)
                .await?;
            if let Some(payment) = found {
                return Ok(payment);
            }
        }
        Err(ServiceError::NotFound("payment for webhook".into()))
    }

    /// Paid, ready and failed notifications. Returns `None` when a concurrent
    /// caller moved the payment first.
    async fn apply_notification(
        &self,
        payment: &payment::Model,
        result: &WebhookResult,
    ) -> Result<Option<PaymentStatus>, ServiceError> {
        let now = Utc::now();
        let mut active: payment::ActiveModel = payment.clone().into();
        active.status = Set(result.status);
        active.raw_response = Set(Some(result.raw.clone()));
        if let Some(tid) = result.pg_tid.clone().filter(|t| !t.is_empty()) {
            active.pg_tid = Set(Some(tid));
        }
        if let Some(vbank) = &result.vbank {
            active.vbank_name = Set(Some(vbank.bank_name.clone()));
            active.vbank_number = Set(Some(vbank.account_number.clone()));
            active.vbank_holder = Set(Some(vbank.holder.clone()));
            active.vbank_due = Set(vbank.due);
        }
        if result.status == PaymentStatus::Paid {
            active.paid_at = Set(Some(now));
        }

        let txn = self.db.begin().await?;
        let updated = match payment::Entity::update(active)
            .filter(payment::Column::Status.eq(payment.status))
            .exec(&txn)
            .await
        {
            Ok(updated) => updated,
            Err(DbErr::RecordNotUpdated) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if updated.status == PaymentStatus::Paid {
            self.mark_order_paid(&txn, updated.order_id).await?;
        }
        txn.commit().await?;

        match updated.status {
            PaymentStatus::Paid => self.after_capture(&updated).await,
            PaymentStatus::Failed => {
                counter!("ledger.payments.failed", 1, "provider" => updated.pg_provider.to_string());
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        payment_id: updated.id,
                        order_id: updated.order_id,
                        reason: "reported failed by provider".into(),
                    })
                    .await;
            }
            _ => info!(payment_id = updated.id, status = %updated.status, "payment updated by webhook"),
        }
        Ok(Some(updated.status))
    }

    /// Full cancellation reported by the provider.
    async fn apply_provider_cancel(
        &self,
        payment: &payment::Model,
    ) -> Result<Option<PaymentStatus>, ServiceError> {
        let order = find_order(&*self.db, payment.order_id).await?;
        let now = Utc::now();
        // A virtual account that was never funded has nothing to refund.
        let (refunded, cancelled_total) = if payment.status.is_cancellable() {
            (payment.remaining(), payment.amount)
        } else {
            (Decimal::ZERO, payment.cancelled_amount)
        };

        let txn = self.db.begin().await?;
        let result = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Cancelled))
            .col_expr(payment::Column::CancelledAmount, Expr::value(cancelled_total))
            .col_expr(
                payment::Column::CancelReason,
                Expr::value("cancelled by provider notification"),
            )
            .col_expr(payment::Column::CancelledAt, Expr::value(now))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(payment.status))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        let closed = close_order(&txn, &order).await?;
        txn.commit().await?;

        if closed == Some(OrderStatus::Cancelled) {
            let items = load_items(&*self.db, order.id).await?;
            release_stock(self.catalog.as_ref(), &items).await;
        }
        self.event_sender
            .send_or_log(Event::PaymentCancelled {
                payment_id: payment.id,
                order_id: order.id,
                amount: refunded,
                fully_cancelled: true,
            })
            .await;
        Ok(Some(PaymentStatus::Cancelled))
    }

    async fn mark_order_paid(
        &self,
        txn: &DatabaseTransaction,
        order_id: i64,
    ) -> Result<(), ServiceError> {
        let result = status_update(order_id, &[OrderStatus::Pending], OrderStatus::Paid, Utc::now())
            .exec(txn)
            .await?;
        if result.rows_affected == 0 {
            error!(order_id, "payment captured but order is no longer pending; refund manually");
        }
        Ok(())
    }

    /// Side effects of a successful capture. Failures are logged only.
    async fn after_capture(&self, payment: &payment::Model) {
        if payment.status != PaymentStatus::Paid {
            info!(payment_id = payment.id, status = %payment.status, "payment awaiting deposit");
            return;
        }
        match load_items(&*self.db, payment.order_id).await {
            Ok(items) => {
                for item in items {
                    if let Err(e) = self
                        .catalog
                        .increment_sales(item.product_id, item.quantity)
                        .await
                    {
                        warn!(product_id = item.product_id, error = %e, "sales count not updated");
                    }
                }
            }
            Err(e) => warn!(order_id = payment.order_id, error = %e, "sales counts skipped"),
        }
        counter!("ledger.payments.completed", 1, "provider" => payment.pg_provider.to_string());
        self.event_sender
            .send_or_log(Event::PaymentCompleted {
                payment_id: payment.id,
                order_id: payment.order_id,
                status: payment.status.to_string(),
            })
            .await;
        info!(payment_id = payment.id, order_id = payment.order_id, "payment completed");
    }

    /// Puts back a refund claim the provider did not honour.
    async fn release_claim(
        &self,
        payment: &payment::Model,
        amount: Decimal,
        claimed_status: PaymentStatus,
    ) {
        let result = payment::Entity::update_many()
            .col_expr(payment::Column::CancelledAmount, Expr::value(payment.cancelled_amount))
            .col_expr(payment::Column::Status, Expr::value(payment.status))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(claimed_status))
            .filter(payment::Column::CancelledAmount.eq(payment.cancelled_amount + amount))
            .exec(&*self.db)
            .await;
        match result {
            Ok(r) if r.rows_affected == 1 => {
                warn!(payment_id = payment.id, %amount, "refund claim released after provider refusal")
            }
            Ok(_) => error!(payment_id = payment.id, %amount, "refund claim changed before release; reconcile manually"),
            Err(e) => error!(payment_id = payment.id, error = %e, "could not release refund claim"),
        }
    }

    async fn mark_failed(
        &self,
        payment: &payment::Model,
        pg_tid: Option<String>,
        reason: &str,
        raw_response: Option<String>,
    ) {
        let result = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::PgTid, Expr::value(pg_tid))
            .col_expr(payment::Column::RawResponse, Expr::value(raw_response))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await;
        if let Err(e) = result {
            error!(payment_id = payment.id, error = %e, "could not mark payment failed");
        }
        counter!("ledger.payments.failed", 1, "provider" => payment.pg_provider.to_string());
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                payment_id: payment.id,
                order_id: payment.order_id,
                reason: reason.to_string(),
            })
            .await;
        warn!(payment_id = payment.id, reason, "payment failed");
    }

    async fn find_payment(&self, payment_id: i64) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {}", payment_id)))
    }
}

fn apply_confirmation(active: &mut payment::ActiveModel, resp: &CompleteResponse) {
    active.status = Set(resp.status);
    active.pg_tid = Set(Some(resp.pg_tid.clone()));
    active.payment_method = Set(resp.payment_method);
    active.pg_fee = Set(resp.pg_fee);
    active.raw_response = Set(resp.raw_response.clone());
    if let Some(card) = &resp.card {
        active.card_company = Set(Some(card.company.clone()));
        active.card_number = Set(Some(card.number.clone()));
        active.card_type = Set(Some(card.card_type.clone()));
        active.install_month = Set(Some(card.install_month));
    }
    if let Some(vbank) = &resp.vbank {
        active.vbank_name = Set(Some(vbank.bank_name.clone()));
        active.vbank_number = Set(Some(vbank.account_number.clone()));
        active.vbank_holder = Set(Some(vbank.holder.clone()));
        active.vbank_due = Set(vbank.due);
    }
    if resp.status == PaymentStatus::Paid {
        active.paid_at = Set(Some(Utc::now()));
    }
}

/// Status an order takes once its payment is fully refunded: `cancelled`
/// where the order may still be cancelled, `refunded` otherwise.
pub(crate) fn refund_target(status: OrderStatus) -> Option<OrderStatus> {
    [OrderStatus::Cancelled, OrderStatus::Refunded]
        .into_iter()
        .find(|to| status.can_transition_to(*to))
}

async fn close_order(
    txn: &DatabaseTransaction,
    order: &order::Model,
) -> Result<Option<OrderStatus>, ServiceError> {
    let Some(target) = refund_target(order.status) else {
        warn!(order_id = order.id, status = %order.status, "order left as is after full refund");
        return Ok(None);
    };
    let result = status_update(order.id, &[order.status], target, Utc::now())
        .exec(txn)
        .await?;
    if result.rows_affected == 0 {
        warn!(order_id = order.id, "order changed during refund; status left as is");
        return Ok(None);
    }
    if target == OrderStatus::Refunded {
        order_item::Entity::update_many()
            .col_expr(order_item::Column::Status, Expr::value(OrderItemStatus::Refunded))
            .col_expr(order_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order_item::Column::OrderId.eq(order.id))
            .exec(txn)
            .await?;
    }
    Ok(Some(target))
}
