//! Live parcel tracking against carrier lookup APIs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::shipping::{Carrier, ShippingStatus};
use crate::config::ShippingConfig;
use crate::errors::ServiceError;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("no live tracking for carrier {0}")]
    Unsupported(Carrier),
    #[error("shipment not found: {0}")]
    NotFound(String),
    #[error("tracking service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected tracking response: {0}")]
    Decode(String),
}

impl From<TrackingError> for ServiceError {
    fn from(err: TrackingError) -> Self {
        match err {
            TrackingError::Unsupported(_) => ServiceError::InvalidOperation(err.to_string()),
            TrackingError::NotFound(_) => ServiceError::NotFound(err.to_string()),
            TrackingError::Transport(_) | TrackingError::Decode(_) => {
                ServiceError::ExternalServiceError(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingEvent {
    pub time: Option<DateTime<Utc>>,
    pub location: String,
    pub status: ShippingStatus,
    pub description: String,
}

/// What the carrier currently reports for one parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingInfo {
    pub status: ShippingStatus,
    /// The carrier's own wording of the latest scan.
    pub status_text: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub events: Vec<TrackingEvent>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Tracker: Send + Sync {
    fn carrier(&self) -> Carrier;

    async fn track(&self, tracking_number: &str) -> Result<TrackingInfo, TrackingError>;
}

/// SweetTracker carrier code.
fn sweet_tracker_code(carrier: Carrier) -> Option<&'static str> {
    match carrier {
        Carrier::Cj => Some("04"),
        Carrier::Lotte => Some("08"),
        _ => None,
    }
}

/// Maps a scan kind to a shipping status. Hub scans and anything the
/// carrier adds later count as in transit.
fn status_of(carrier: Carrier, kind: &str) -> ShippingStatus {
    match (carrier, kind.trim()) {
        (_, "배달완료") => ShippingStatus::Delivered,
        (_, "배달출발") => ShippingStatus::OutForDelivery,
        (Carrier::Cj, "집화처리") | (Carrier::Lotte, "집화") => ShippingStatus::PickedUp,
        _ => ShippingStatus::InTransit,
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    // Scan times are Korean local time without an offset.
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| (t - chrono::Duration::hours(9)).and_utc())
}

/// Tracking through the SweetTracker lookup API.
pub struct SweetTracker {
    carrier: Carrier,
    code: &'static str,
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl SweetTracker {
    pub fn new(
        carrier: Carrier,
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TrackingError> {
        let code = sweet_tracker_code(carrier).ok_or(TrackingError::Unsupported(carrier))?;
        Ok(Self {
            carrier,
            code,
            api_key: api_key.into(),
            api_base: api_base.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn event(&self, detail: &SweetDetail) -> TrackingEvent {
        TrackingEvent {
            time: parse_time(&detail.time_string),
            location: detail.location.clone(),
            status: status_of(self.carrier, &detail.kind),
            description: detail.kind.clone(),
        }
    }
}

#[async_trait]
impl Tracker for SweetTracker {
    fn carrier(&self) -> Carrier {
        self.carrier
    }

    #[instrument(skip(self), fields(carrier = %self.carrier))]
    async fn track(&self, tracking_number: &str) -> Result<TrackingInfo, TrackingError> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/trackingInfo",
                self.api_base.trim_end_matches('/')
            ))
            .query(&[
                ("t_key", self.api_key.as_str()),
                ("t_code", self.code),
                ("t_invoice", tracking_number),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackingError::Decode(format!("HTTP {}", status)));
        }
        let body: SweetResponse = response
            .json()
            .await
            .map_err(|e| TrackingError::Decode(e.to_string()))?;
        if body.status == Some(false) || body.code.as_deref().is_some_and(|c| c != "0") {
            return Err(TrackingError::NotFound(
                body.msg.unwrap_or_else(|| tracking_number.to_string()),
            ));
        }

        let events: Vec<TrackingEvent> =
            body.tracking_details.iter().map(|d| self.event(d)).collect();
        let latest = body
            .last_detail
            .as_ref()
            .or(body.tracking_details.last());
        let Some(latest) = latest else {
            return Ok(TrackingInfo {
                status: ShippingStatus::Pending,
                status_text: String::new(),
                delivered_at: None,
                events,
            });
        };
        let status = status_of(self.carrier, &latest.kind);
        debug!(%status, kind = %latest.kind, "tracking looked up");
        Ok(TrackingInfo {
            status,
            status_text: latest.kind.clone(),
            delivered_at: (status == ShippingStatus::Delivered)
                .then(|| parse_time(&latest.time_string))
                .flatten(),
            events,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweetResponse {
    #[serde(default)]
    status: Option<bool>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    last_detail: Option<SweetDetail>,
    #[serde(default)]
    tracking_details: Vec<SweetDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweetDetail {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    time_string: String,
    #[serde(default, rename = "where")]
    location: String,
}

/// Trackers keyed by carrier. Carriers without one fall back to the
/// status recorded on the order.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: HashMap<Carrier, Arc<dyn Tracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers SweetTracker for the carriers it covers once an API key is set.
    pub fn from_config(config: &ShippingConfig) -> Result<Self, TrackingError> {
        let mut registry = Self::new();
        if let Some(key) = config.tracker_api_key.as_deref().filter(|k| !k.is_empty()) {
            let timeout = Duration::from_secs(config.tracker_timeout_secs);
            for carrier in [Carrier::Cj, Carrier::Lotte] {
                registry.register(Arc::new(SweetTracker::new(
                    carrier,
                    key,
                    config.tracker_api_base.clone(),
                    timeout,
                )?));
            }
        }
        info!(carriers = ?registry.carriers(), "parcel trackers registered");
        Ok(registry)
    }

    pub fn register(&mut self, tracker: Arc<dyn Tracker>) {
        self.trackers.insert(tracker.carrier(), tracker);
    }

    pub fn get(&self, carrier: Carrier) -> Option<Arc<dyn Tracker>> {
        self.trackers.get(&carrier).cloned()
    }

    pub fn carriers(&self) -> Vec<Carrier> {
        let mut carriers: Vec<Carrier> = self.trackers.keys().copied().collect();
        carriers.sort_by_key(|c| c.to_string());
        carriers
    }
}
