use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

use super::orders::{ensure_owner, find_order, load_items};
use super::{Page, PageRequest};
use crate::entities::coupon::{self, ApplyTo, CouponStatus, DiscountType};
use crate::entities::order::{self, order_total, OrderStatus};
use crate::entities::{coupon_usage, order_item};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Why a coupon cannot be used. Reported to the buyer, never raised as a
/// hard error by [`CouponService::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    NotFound,
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    PerUserLimitReached,
    BelowMinimumAmount,
}

impl CouponRejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::NotFound => "coupon not found",
            Self::Inactive => "coupon is not active",
            Self::NotStarted => "coupon is not valid yet",
            Self::Expired => "coupon has expired",
            Self::UsageLimitReached => "coupon usage limit has been reached",
            Self::PerUserLimitReached => "you have already used this coupon the maximum number of times",
            Self::BelowMinimumAmount => "order amount is below the coupon minimum",
        }
    }
}

/// Eligibility checks in their fixed order; the first failure wins.
pub fn check_eligibility(
    coupon: &coupon::Model,
    now: DateTime<Utc>,
    user_usages: u64,
    order_amount: Decimal,
) -> Result<(), CouponRejection> {
    if coupon.status != CouponStatus::Active {
        return Err(CouponRejection::Inactive);
    }
    if !coupon.is_within_window(now) {
        return Err(if coupon.starts_at.is_some_and(|s| now < s) {
            CouponRejection::NotStarted
        } else {
            CouponRejection::Expired
        });
    }
    if coupon.usage_limit.is_some_and(|limit| coupon.usage_count >= limit) {
        return Err(CouponRejection::UsageLimitReached);
    }
    if user_usages >= u64::try_from(coupon.usage_per_user.max(0)).unwrap_or(0) {
        return Err(CouponRejection::PerUserLimitReached);
    }
    if order_amount < coupon.min_order_amount {
        return Err(CouponRejection::BelowMinimumAmount);
    }
    Ok(())
}

/// Amount the coupon discounts: the whole subtotal, or the matching lines for
/// scoped coupons.
pub fn scoped_amount(
    coupon: &coupon::Model,
    subtotal: Decimal,
    items: &[order_item::Model],
) -> Decimal {
    let ids = coupon.scope_ids();
    let matches = |item: &order_item::Model| match coupon.apply_to {
        ApplyTo::All => true,
        ApplyTo::Product => ids.contains(&item.product_id),
        ApplyTo::Category => item.category_id.is_some_and(|c| ids.contains(&c)),
        ApplyTo::Seller => ids.contains(&item.seller_id),
    };
    match coupon.apply_to {
        ApplyTo::All => subtotal,
        _ => items.iter().filter(|i| matches(i)).map(|i| i.subtotal).sum(),
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Debug, Clone, Serialize)]
pub struct CouponValidation {
    pub valid: bool,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_discount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_order_amount: Option<Decimal>,
    /// Discount the coupon would give on the validated amount.
    pub discount_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CouponRejection>,
    pub message: String,
}

impl CouponValidation {
    fn rejected(code: String, coupon: Option<&coupon::Model>, reason: CouponRejection) -> Self {
        Self {
            valid: false,
            code,
            name: coupon.map(|c| c.name.clone()),
            discount_type: None,
            discount_value: None,
            max_discount: None,
            min_order_amount: coupon.map(|c| c.min_order_amount),
            discount_amount: Decimal::ZERO,
            reason: Some(reason),
            message: reason.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedCoupon {
    pub order_id: i64,
    pub coupon_id: i64,
    pub code: String,
    pub discount: Decimal,
    pub shipping_waived: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCouponRequest {
    #[validate(length(min = 3, max = 50))]
    pub code: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    #[serde(default)]
    pub min_order_amount: Decimal,
    pub apply_to: Option<ApplyTo>,
    #[serde(default)]
    pub apply_ids: Vec<i64>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub usage_per_user: Option<i32>,
    /// RFC 3339
    pub starts_at: Option<String>,
    pub expires_at: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

/// Partial update. An empty `starts_at`/`expires_at` clears that bound.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateCouponRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub discount_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub usage_per_user: Option<i32>,
    pub starts_at: Option<String>,
    pub expires_at: Option<String>,
    pub status: Option<CouponStatus>,
    pub is_public: Option<bool>,
}

fn parse_bound(field: &str, value: &str) -> Result<Option<DateTime<Utc>>, ServiceError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|_| ServiceError::ValidationError(format!("invalid {} format", field)))
}

fn check_amounts(
    discount_type: DiscountType,
    value: Decimal,
    max_discount: Option<Decimal>,
    min_order_amount: Decimal,
) -> Result<(), ServiceError> {
    if discount_type != DiscountType::FreeShipping && value <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "discount_value must be positive".into(),
        ));
    }
    if discount_type == DiscountType::Percent && value > Decimal::ONE_HUNDRED {
        return Err(ServiceError::ValidationError(
            "percent discount cannot exceed 100".into(),
        ));
    }
    if max_discount.is_some_and(|m| m <= Decimal::ZERO) {
        return Err(ServiceError::ValidationError(
            "max_discount must be positive".into(),
        ));
    }
    if min_order_amount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "min_order_amount cannot be negative".into(),
        ));
    }
    Ok(())
}

fn check_window(
    starts_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), ServiceError> {
    match (starts_at, expires_at) {
        (Some(s), Some(e)) if e <= s => Err(ServiceError::ValidationError(
            "expires_at must be after starts_at".into(),
        )),
        _ => Ok(()),
    }
}

/// Coupon administration, validation and per-order application.
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create(
        &self,
        admin_id: i64,
        request: CreateCouponRequest,
    ) -> Result<coupon::Model, ServiceError> {
        request.validate()?;
        let min_order_amount = request.min_order_amount;
        check_amounts(
            request.discount_type,
            request.discount_value,
            request.max_discount,
            min_order_amount,
        )?;
        let starts_at = request
            .starts_at
            .as_deref()
            .map(|v| parse_bound("starts_at", v))
            .transpose()?
            .flatten();
        let expires_at = request
            .expires_at
            .as_deref()
            .map(|v| parse_bound("expires_at", v))
            .transpose()?
            .flatten();
        check_window(starts_at, expires_at)?;

        let apply_to = request.apply_to.unwrap_or(ApplyTo::All);
        if apply_to != ApplyTo::All && request.apply_ids.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "apply_ids are required when apply_to is {}",
                apply_to
            )));
        }

        let coupon = coupon::ActiveModel {
            code: Set(normalize_code(&request.code)),
            name: Set(request.name),
            description: Set(request.description),
            discount_type: Set(request.discount_type),
            discount_value: Set(request.discount_value),
            max_discount: Set(request.max_discount),
            min_order_amount: Set(min_order_amount),
            apply_to: Set(apply_to),
            apply_ids: Set((!request.apply_ids.is_empty())
                .then(|| serde_json::json!(request.apply_ids))),
            usage_limit: Set(request.usage_limit),
            usage_per_user: Set(request.usage_per_user.unwrap_or(1)),
            usage_count: Set(0),
            starts_at: Set(starts_at),
            expires_at: Set(expires_at),
            status: Set(CouponStatus::Active),
            is_public: Set(request.is_public),
            created_by: Set(Some(admin_id)),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(|e| ServiceError::on_unique_violation(e, "coupon code already exists"))?;

        info!(coupon_id = coupon.id, "coupon created");
        Ok(coupon)
    }

    #[instrument(skip(self, request))]
    pub async fn update(
        &self,
        coupon_id: i64,
        request: UpdateCouponRequest,
    ) -> Result<coupon::Model, ServiceError> {
        request.validate()?;
        let existing = self.get(coupon_id).await?;

        let discount_value = request.discount_value.unwrap_or(existing.discount_value);
        let max_discount = request.max_discount.or(existing.max_discount);
        let min_order_amount = request.min_order_amount.unwrap_or(existing.min_order_amount);
        check_amounts(existing.discount_type, discount_value, max_discount, min_order_amount)?;

        let starts_at = match request.starts_at.as_deref() {
            Some(v) => parse_bound("starts_at", v)?,
            None => existing.starts_at,
        };
        let expires_at = match request.expires_at.as_deref() {
            Some(v) => parse_bound("expires_at", v)?,
            None => existing.expires_at,
        };
        check_window(starts_at, expires_at)?;

        let mut active: coupon::ActiveModel = existing.clone().into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if request.description.is_some() {
            active.description = Set(request.description);
        }
        active.discount_value = Set(discount_value);
        active.max_discount = Set(max_discount);
        active.min_order_amount = Set(min_order_amount);
        if request.usage_limit.is_some() {
            active.usage_limit = Set(request.usage_limit);
        }
        if let Some(per_user) = request.usage_per_user {
            active.usage_per_user = Set(per_user);
        }
        active.starts_at = Set(starts_at);
        active.expires_at = Set(expires_at);
        if let Some(status) = request.status {
            active.status = Set(status);
        }
        if let Some(is_public) = request.is_public {
            active.is_public = Set(is_public);
        }
        Ok(active.update(&*self.db).await?)
    }

    /// Deleting a coupon that has been applied would erase order history, so
    /// used coupons can only be deactivated.
    #[instrument(skip(self))]
    pub async fn delete(&self, coupon_id: i64) -> Result<(), ServiceError> {
        let coupon = self.get(coupon_id).await?;
        let used = coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon.id))
            .count(&*self.db)
            .await?;
        if used > 0 {
            return Err(ServiceError::Conflict(
                "coupon has been used; deactivate it instead".into(),
            ));
        }
        coupon::Entity::delete_by_id(coupon.id).exec(&*self.db).await?;
        Ok(())
    }

    pub async fn get(&self, coupon_id: i64) -> Result<coupon::Model, ServiceError> {
        coupon::Entity::find_by_id(coupon_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("coupon {}", coupon_id)))
    }

    #[instrument(skip(self))]
    pub async fn list(
        &self,
        status: Option<CouponStatus>,
        page: PageRequest,
    ) -> Result<Page<coupon::Model>, ServiceError> {
        let page = page.normalized();
        let mut query = coupon::Entity::find();
        if let Some(status) = status {
            query = query.filter(coupon::Column::Status.eq(status));
        }
        let paginator = query
            .order_by_desc(coupon::Column::Id)
            .paginate(&*self.db, page.limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.index()).await?;
        Ok(Page::new(items, total, page))
    }

    /// Active public coupons whose validity window contains now.
    pub async fn list_public(&self) -> Result<Vec<coupon::Model>, ServiceError> {
        let now = Utc::now();
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Status.eq(CouponStatus::Active))
            .filter(coupon::Column::IsPublic.eq(true))
            .filter(
                Condition::any()
                    .add(coupon::Column::StartsAt.is_null())
                    .add(coupon::Column::StartsAt.lte(now)),
            )
            .filter(
                Condition::any()
                    .add(coupon::Column::ExpiresAt.is_null())
                    .add(coupon::Column::ExpiresAt.gt(now)),
            )
            .order_by_asc(coupon::Column::ExpiresAt)
            .all(&*self.db)
            .await?)
    }

    /// Checks whether `code` can be used by `user_id` on an order of
    /// `order_amount`. Ineligibility is reported in the result.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        user_id: i64,
        code: &str,
        order_amount: Decimal,
    ) -> Result<CouponValidation, ServiceError> {
        let code = normalize_code(code);
        let Some(coupon) = self.find_by_code(&code).await? else {
            return Ok(CouponValidation::rejected(code, None, CouponRejection::NotFound));
        };

        let usages = self.user_usage_count(user_id, coupon.id).await?;
        if let Err(reason) = check_eligibility(&coupon, Utc::now(), usages, order_amount) {
            return Ok(CouponValidation::rejected(code, Some(&coupon), reason));
        }

        Ok(CouponValidation {
            valid: true,
            discount_amount: coupon.calculate_discount(order_amount),
            code: coupon.code,
            name: Some(coupon.name),
            discount_type: Some(coupon.discount_type),
            discount_value: Some(coupon.discount_value),
            max_discount: coupon.max_discount,
            min_order_amount: Some(coupon.min_order_amount),
            reason: None,
            message: "coupon can be used".into(),
        })
    }

    /// Applies `code` to a pending order owned by `user_id`.
    ///
    /// The usage row, the coupon's counter and the order amounts change in one
    /// transaction. A second application to the same order fails with
    /// `Conflict`, whether detected by lookup or by the unique index on
    /// `coupon_usages.order_id`.
    #[instrument(skip(self))]
    pub async fn apply(
        &self,
        user_id: i64,
        order_id: i64,
        code: &str,
    ) -> Result<AppliedCoupon, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(
                "coupons can only be applied to pending orders".into(),
            ));
        }
        if self.usage_for_order(order_id).await?.is_some() {
            return Err(ServiceError::Conflict("coupon already applied".into()));
        }

        let code = normalize_code(code);
        let coupon = self
            .find_by_code(&code)
            .await?
            .ok_or_else(|| ServiceError::InvalidInput(CouponRejection::NotFound.message().into()))?;
        let usages = self.user_usage_count(user_id, coupon.id).await?;
        check_eligibility(&coupon, Utc::now(), usages, order.subtotal)
            .map_err(|reason| ServiceError::InvalidInput(reason.message().into()))?;

        let items = load_items(&*self.db, order_id).await?;
        let base = scoped_amount(&coupon, order.subtotal, &items);
        let discount = coupon.calculate_discount(base);
        let shipping_waived = if coupon.is_free_shipping() {
            order.shipping_fee
        } else {
            Decimal::ZERO
        };
        if base <= Decimal::ZERO || (discount.is_zero() && !coupon.is_free_shipping()) {
            return Err(ServiceError::InvalidInput(
                "coupon is not applicable to this order".into(),
            ));
        }

        let shipping_fee = order.shipping_fee - shipping_waived;
        let total = order_total(order.subtotal, discount, shipping_fee);

        let txn = self.db.begin().await?;
        coupon_usage::ActiveModel {
            coupon_id: Set(coupon.id),
            user_id: Set(user_id),
            order_id: Set(order_id),
            discount_amount: Set(discount),
            shipping_waived: Set(shipping_waived),
            used_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| ServiceError::on_unique_violation(e, "coupon already applied"))?;

        let counted = coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .filter(coupon::Column::Id.eq(coupon.id))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(Expr::col(coupon::Column::UsageCount).lt(Expr::col(coupon::Column::UsageLimit))),
            )
            .exec(&txn)
            .await?;
        if counted.rows_affected == 0 {
            return Err(ServiceError::InvalidInput(
                CouponRejection::UsageLimitReached.message().into(),
            ));
        }

        let updated = order::Entity::update_many()
            .col_expr(order::Column::Discount, Expr::value(discount))
            .col_expr(order::Column::ShippingFee, Expr::value(shipping_fee))
            .col_expr(order::Column::Total, Expr::value(total))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus("order is no longer pending".into()));
        }
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CouponApplied {
                order_id,
                coupon_id: coupon.id,
                discount,
            })
            .await;
        info!(order_id, coupon_id = coupon.id, %discount, %shipping_waived, "coupon applied");

        Ok(AppliedCoupon {
            order_id,
            coupon_id: coupon.id,
            code: coupon.code,
            discount,
            shipping_waived,
            total,
        })
    }

    /// Exact inverse of [`apply`](Self::apply) while the order is pending.
    #[instrument(skip(self))]
    pub async fn remove(&self, user_id: i64, order_id: i64) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(
                "coupons can only be removed from pending orders".into(),
            ));
        }
        let usage = self
            .usage_for_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("no coupon applied to this order".into()))?;

        let shipping_fee = order.shipping_fee + usage.shipping_waived;
        let total = order_total(order.subtotal, Decimal::ZERO, shipping_fee);

        let txn = self.db.begin().await?;
        let deleted = coupon_usage::Entity::delete_by_id(usage.id).exec(&txn).await?;
        if deleted.rows_affected == 0 {
            return Err(ServiceError::Conflict("coupon was removed concurrently".into()));
        }
        coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).sub(1),
            )
            .filter(coupon::Column::Id.eq(usage.coupon_id))
            .filter(coupon::Column::UsageCount.gt(0))
            .exec(&txn)
            .await?;
        let updated = order::Entity::update_many()
            .col_expr(order::Column::Discount, Expr::value(Decimal::ZERO))
            .col_expr(order::Column::ShippingFee, Expr::value(shipping_fee))
            .col_expr(order::Column::Total, Expr::value(total))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus("order is no longer pending".into()));
        }
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CouponRemoved {
                order_id,
                coupon_id: usage.coupon_id,
            })
            .await;
        find_order(&*self.db, order_id).await
    }

    pub async fn usage_for_order(
        &self,
        order_id: i64,
    ) -> Result<Option<coupon_usage::Model>, ServiceError> {
        Ok(coupon_usage::Entity::find()
            .filter(coupon_usage::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(&*self.db)
            .await?)
    }

    async fn user_usage_count(&self, user_id: i64, coupon_id: i64) -> Result<u64, ServiceError> {
        Ok(coupon_usage::Entity::find()
            .filter(coupon_usage::Column::UserId.eq(user_id))
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .count(&*self.db)
            .await?)
    }
}
