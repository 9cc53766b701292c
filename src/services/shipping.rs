use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::orders::{ensure_owner, find_order, load_items, status_update};
use super::tracking::{TrackerRegistry, TrackingError, TrackingEvent};
use crate::entities::order::{self, OrderStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

static DIGITS_10_TO_12: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{10,12}$").expect("valid pattern"));
static ALPHANUMERIC_5_TO_30: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z-]{5,30}$").expect("valid pattern"));

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Carrier {
    Cj,
    Lotte,
    Hanjin,
    Post,
    Logen,
    Kd,
}

impl Carrier {
    pub fn name(self) -> &'static str {
        match self {
            Carrier::Cj => "CJ Logistics",
            Carrier::Lotte => "Lotte Global Logistics",
            Carrier::Hanjin => "Hanjin Express",
            Carrier::Post => "Korea Post",
            Carrier::Logen => "Logen",
            Carrier::Kd => "Kyungdong Express",
        }
    }

    fn url_template(self) -> &'static str {
        match self {
            Carrier::Cj => "https://www.cjlogistics.com/ko/tool/parcel/tracking?gnbInvcNo={}",
            Carrier::Lotte => {
                "https://www.lotteglogis.com/home/reservation/tracking/linkView?InvNo={}"
            }
            Carrier::Hanjin => {
                "https://www.hanjin.com/kor/CMS/DeliveryMgr/WaybillResult.do?mession=13&wblnum={}"
            }
            Carrier::Post => "https://service.epost.go.kr/trace.RetrieveDomRi498.parcel?sid1={}",
            Carrier::Logen => "https://www.ilogen.com/web/personal/trace/{}",
            Carrier::Kd => "https://kdexp.com/service/delivery/etc/delivery_result.do?barcode={}",
        }
    }

    fn number_pattern(self) -> &'static Regex {
        match self {
            Carrier::Cj | Carrier::Lotte => &DIGITS_10_TO_12,
            _ => &ALPHANUMERIC_5_TO_30,
        }
    }

    pub fn tracking_url(self, tracking_number: &str) -> String {
        self.url_template().replace("{}", tracking_number)
    }

    pub fn validate_number(self, tracking_number: &str) -> Result<(), ServiceError> {
        if self.number_pattern().is_match(tracking_number) {
            Ok(())
        } else {
            Err(ServiceError::ValidationError(format!(
                "invalid tracking number for {}",
                self
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CarrierInfo {
    pub code: Carrier,
    pub name: &'static str,
    pub tracking_url: &'static str,
}

impl From<Carrier> for CarrierInfo {
    fn from(carrier: Carrier) -> Self {
        Self {
            code: carrier,
            name: carrier.name(),
            tracking_url: carrier.url_template(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShippingStatus {
    Pending,
    PickedUp,
    InTransit,
    OutForDelivery,
    Delivered,
}

impl From<OrderStatus> for ShippingStatus {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Shipped => ShippingStatus::InTransit,
            OrderStatus::Delivered | OrderStatus::Completed => ShippingStatus::Delivered,
            _ => ShippingStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterShippingRequest {
    pub carrier: Carrier,
    #[validate(length(min = 5, max = 30))]
    pub tracking_number: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingView {
    pub order_id: i64,
    pub order_number: String,
    pub carrier: CarrierInfo,
    pub tracking_number: String,
    pub tracking_url: String,
    pub status: ShippingStatus,
    /// Carrier wording of the latest scan, when looked up live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub events: Vec<TrackingEvent>,
}

/// Seller-side shipment registration and buyer-side tracking.
#[derive(Clone)]
pub struct ShippingService {
    db: Arc<DatabaseConnection>,
    trackers: Arc<TrackerRegistry>,
    event_sender: Arc<EventSender>,
}

impl ShippingService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        trackers: Arc<TrackerRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            trackers,
            event_sender,
        }
    }

    pub fn carriers(&self) -> Vec<CarrierInfo> {
        Carrier::iter().map(CarrierInfo::from).collect()
    }

    /// Records the carrier and tracking number and moves the order straight
    /// to `shipped` from `paid` or `processing`.
    #[instrument(skip(self, request))]
    pub async fn register_tracking(
        &self,
        seller_id: i64,
        order_id: i64,
        request: RegisterShippingRequest,
    ) -> Result<order::Model, ServiceError> {
        request.validate()?;
        let tracking_number = request.tracking_number.trim().to_string();
        let order = self.seller_order(seller_id, order_id).await?;
        let items = load_items(&*self.db, order_id).await?;
        if !items.iter().any(|i| i.is_physical()) {
            return Err(ServiceError::InvalidOperation(
                "order has no physical items to ship".into(),
            ));
        }
        if order.tracking_number.is_some() {
            return Err(ServiceError::Conflict("shipping info already set".into()));
        }
        if !matches!(order.status, OrderStatus::Paid | OrderStatus::Processing) {
            return Err(ServiceError::InvalidStatus(format!(
                "order in status {} cannot be shipped",
                order.status
            )));
        }
        request.carrier.validate_number(&tracking_number)?;

        let result = status_update(
            order_id,
            &[OrderStatus::Paid, OrderStatus::Processing],
            OrderStatus::Shipped,
            Utc::now(),
        )
        .col_expr(
            order::Column::ShippingCarrier,
            Expr::value(request.carrier.to_string()),
        )
        .col_expr(order::Column::TrackingNumber, Expr::value(tracking_number.clone()))
        .filter(order::Column::TrackingNumber.is_null())
        .exec(&*self.db)
        .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict("order changed concurrently".into()));
        }

        self.event_sender
            .send_or_log(Event::ShipmentRegistered {
                order_id,
                carrier: request.carrier.to_string(),
                tracking_number,
            })
            .await;
        info!(order_id, carrier = %request.carrier, "shipment registered");
        find_order(&*self.db, order_id).await
    }

    #[instrument(skip(self))]
    pub async fn mark_delivered(
        &self,
        seller_id: i64,
        order_id: i64,
    ) -> Result<order::Model, ServiceError> {
        let order = self.seller_order(seller_id, order_id).await?;
        if order.status != OrderStatus::Shipped {
            return Err(ServiceError::InvalidStatus(format!(
                "order in status {} cannot be marked delivered",
                order.status
            )));
        }
        self.deliver(order_id, Utc::now()).await
    }

    /// Asks the carrier where a shipped order is and records delivery once
    /// the carrier reports it. Orders without a tracking number, or no
    /// longer in `shipped`, are returned unchanged.
    #[instrument(skip(self))]
    pub async fn update_shipping_status(&self, order_id: i64) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        let (Some(carrier), Some(number)) = (order.shipping_carrier.as_deref(), order.tracking_number.as_deref())
        else {
            info!(order_id, "no tracking number; shipping status left as is");
            return Ok(order);
        };
        if order.status != OrderStatus::Shipped {
            info!(order_id, status = %order.status, "order not in transit; shipping status left as is");
            return Ok(order);
        }
        let carrier = parse_carrier(carrier)?;
        let tracker = self
            .trackers
            .get(carrier)
            .ok_or(TrackingError::Unsupported(carrier))?;
        let info = tracker.track(number).await?;
        if info.status != ShippingStatus::Delivered {
            info!(order_id, status = %info.status, "parcel still on its way");
            return Ok(order);
        }
        self.deliver(order_id, info.delivered_at.unwrap_or_else(Utc::now)).await
    }

    /// `shipped` to `delivered`, stamped with the delivery time.
    async fn deliver(
        &self,
        order_id: i64,
        delivered_at: DateTime<Utc>,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let result = status_update(order_id, &[OrderStatus::Shipped], OrderStatus::Delivered, Utc::now())
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict("order changed concurrently".into()));
        }
        order::Entity::update_many()
            .col_expr(order::Column::DeliveredAt, Expr::value(delivered_at))
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::ShipmentDelivered { order_id })
            .await;
        info!(order_id, %delivered_at, "shipment delivered");
        find_order(&*self.db, order_id).await
    }

    /// Tracking for the buyer. A live carrier lookup is used where one is
    /// registered; otherwise, or when the lookup fails, the status comes from
    /// the order.
    pub async fn track(&self, user_id: i64, order_id: i64) -> Result<TrackingView, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        ensure_owner(&order, user_id)?;
        let (Some(code), Some(number)) = (order.shipping_carrier.as_deref(), order.tracking_number.clone())
        else {
            return Err(ServiceError::NotFound("tracking number not set".into()));
        };
        let carrier = parse_carrier(code)?;

        let mut view = TrackingView {
            order_id: order.id,
            order_number: order.order_number,
            tracking_url: carrier.tracking_url(&number),
            carrier: carrier.into(),
            tracking_number: number.clone(),
            status: order.status.into(),
            status_text: None,
            shipped_at: order.shipped_at,
            delivered_at: order.delivered_at,
            events: Vec::new(),
        };
        if let Some(tracker) = self.trackers.get(carrier) {
            match tracker.track(&number).await {
                Ok(info) => {
                    view.status = info.status;
                    view.status_text = Some(info.status_text);
                    view.delivered_at = view.delivered_at.or(info.delivered_at);
                    view.events = info.events;
                }
                Err(e) => warn!(order_id, %carrier, error = %e, "live tracking unavailable"),
            }
        }
        Ok(view)
    }

    /// The order, provided `seller_id` sold at least one of its lines.
    async fn seller_order(&self, seller_id: i64, order_id: i64) -> Result<order::Model, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        let sells = load_items(&*self.db, order_id)
            .await?
            .iter()
            .any(|i| i.seller_id == seller_id);
        if !sells {
            return Err(ServiceError::Forbidden(
                "you have no items in this order".into(),
            ));
        }
        Ok(order)
    }
}

fn parse_carrier(code: &str) -> Result<Carrier, ServiceError> {
    code.parse()
        .map_err(|_| ServiceError::InvalidInput(format!("carrier {} not supported", code)))
}
