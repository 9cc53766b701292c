pub mod admin;
pub mod cart;
pub mod coupons;
pub mod downloads;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod settlements;
pub mod shipments;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::gateways::GatewayRegistry;
use crate::services::{
    cart::CartService,
    catalog::{Catalog, DbCatalog},
    coupons::CouponService,
    downloads::DownloadService,
    orders::OrderService,
    payments::PaymentService,
    payouts::Payout,
    settlements::SettlementService,
    shipping::ShippingService,
    tracking::TrackerRegistry,
    PageRequest,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub coupons: Arc<CouponService>,
    pub payments: Arc<PaymentService>,
    pub settlements: Arc<SettlementService>,
    pub downloads: Arc<DownloadService>,
    pub shipping: Arc<ShippingService>,
}

impl AppServices {
    /// Wires every service over one pool and one event channel. Gateways and
    /// the payout mechanism are passed in so tests can substitute them.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: Arc<AppConfig>,
        gateways: Arc<GatewayRegistry>,
        payout: Arc<dyn Payout>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, ServiceError> {
        let catalog: Arc<dyn Catalog> = Arc::new(DbCatalog::new(db_pool.clone()));
        let cart = CartService::new(db_pool.clone());
        let trackers = Arc::new(TrackerRegistry::from_config(&config.shipping)?);

        Ok(Self {
            orders: Arc::new(OrderService::new(
                db_pool.clone(),
                catalog.clone(),
                cart.clone(),
                event_sender.clone(),
                config.clone(),
            )),
            cart: Arc::new(cart),
            coupons: Arc::new(CouponService::new(db_pool.clone(), event_sender.clone())),
            payments: Arc::new(PaymentService::new(
                db_pool.clone(),
                catalog.clone(),
                gateways,
                event_sender.clone(),
            )),
            settlements: Arc::new(SettlementService::new(
                db_pool.clone(),
                payout,
                event_sender.clone(),
                config.settlement.clone(),
            )),
            downloads: Arc::new(DownloadService::new(
                db_pool.clone(),
                catalog,
                event_sender.clone(),
                config.downloads.clone(),
                config.public_base_url.clone(),
            )?),
            shipping: Arc::new(ShippingService::new(db_pool, trackers, event_sender)),
        })
    }
}

/// Paging from optional query parameters, clamped like `PageRequest::new`.
pub(crate) fn page_of(page: Option<u64>, limit: Option<u64>) -> PageRequest {
    let defaults = PageRequest::default();
    PageRequest::new(page.unwrap_or(defaults.page), limit.unwrap_or(defaults.limit))
}
