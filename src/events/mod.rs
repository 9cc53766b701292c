use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing. Used after money state has
    /// been committed.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted after a state change has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: i64,
        user_id: i64,
        total: Decimal,
    },
    OrderCancelled {
        order_id: i64,
        reason: Option<String>,
    },
    OrderStatusChanged {
        order_id: i64,
        old_status: String,
        new_status: String,
    },
    CouponApplied {
        order_id: i64,
        coupon_id: i64,
        discount: Decimal,
    },
    CouponRemoved {
        order_id: i64,
        coupon_id: i64,
    },
    PaymentPrepared {
        payment_id: i64,
        order_id: i64,
        provider: String,
    },
    PaymentCompleted {
        payment_id: i64,
        order_id: i64,
        status: String,
    },
    PaymentFailed {
        payment_id: i64,
        order_id: i64,
        reason: String,
    },
    PaymentCancelled {
        payment_id: i64,
        order_id: i64,
        amount: Decimal,
        fully_cancelled: bool,
    },
    SettlementCreated {
        settlement_id: i64,
        seller_id: i64,
        amount: Decimal,
    },
    SettlementCompleted {
        settlement_id: i64,
        reference: String,
    },
    SettlementFailed {
        settlement_id: i64,
        reason: String,
    },
    DownloadServed {
        download_id: i64,
        user_id: i64,
    },
    ShipmentRegistered {
        order_id: i64,
        carrier: String,
        tracking_number: String,
    },
    ShipmentDelivered {
        order_id: i64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::CouponRemoved { .. } => "coupon_removed",
            Event::PaymentPrepared { .. } => "payment_prepared",
            Event::PaymentCompleted { .. } => "payment_completed",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::PaymentCancelled { .. } => "payment_cancelled",
            Event::SettlementCreated { .. } => "settlement_created",
            Event::SettlementCompleted { .. } => "settlement_completed",
            Event::SettlementFailed { .. } => "settlement_failed",
            Event::DownloadServed { .. } => "download_served",
            Event::ShipmentRegistered { .. } => "shipment_registered",
            Event::ShipmentDelivered { .. } => "shipment_delivered",
        }
    }
}

// Handlers receive every event after it has been logged.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Counts every event by type.
pub struct EventMetrics;

#[async_trait]
impl EventHandler for EventMetrics {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        metrics::counter!("ledger.events", 1, "type" => event.name());
        Ok(())
    }
}

/// Drains the channel until every sender is dropped, logging each event and
/// fanning it out to `handlers`. Handler failures are logged and skipped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = event.name(), %payload, "domain event"),
            Err(_) => info!(event = event.name(), "domain event"),
        }

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "event handler failed");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> Result<(), String> {
            self.seen.lock().await.push(event.name());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: &Event) -> Result<(), String> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn events_reach_handlers_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let recorder = Arc::new(Recorder::default());

        sender
            .send(Event::OrderCreated {
                order_id: 1,
                user_id: 2,
                total: dec!(1000),
            })
            .await
            .unwrap();
        sender.send_or_log(Event::ShipmentDelivered { order_id: 1 }).await;
        drop(sender);

        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(Failing), recorder.clone()];
        process_events(rx, handlers).await;
        assert_eq!(
            *recorder.seen.lock().await,
            vec!["order_created", "shipment_delivered"]
        );
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::CouponRemoved {
                order_id: 1,
                coupon_id: 1
            })
            .await
            .is_err());
        sender.send_or_log(Event::ShipmentDelivered { order_id: 1 }).await;
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(Event::SettlementFailed {
            settlement_id: 4,
            reason: "bank down".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "settlement_failed");
        assert_eq!(json["settlement_id"], 4);
    }
}
