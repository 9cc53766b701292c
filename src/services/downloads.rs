//! Digital delivery: long-lived access grants per purchased file, and the
//! short-lived signed URLs that redeem them.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::Rng;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::catalog::Catalog;
use super::orders::{ensure_owner, find_order};
use crate::config::DownloadConfig;
use crate::entities::{download, order_item, product_file};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

type HmacSha256 = Hmac<Sha256>;

/// Signs and checks `{token}:{expiry}` download URLs.
#[derive(Clone)]
pub struct UrlSigner {
    keyed: HmacSha256,
}

impl UrlSigner {
    pub fn new(secret: &str) -> Result<Self, ServiceError> {
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("download signing key: {}", e)))?;
        Ok(Self { keyed })
    }

    fn mac(&self, token: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(format!("{}:{}", token, expires).as_bytes());
        mac
    }

    /// Hex HMAC-SHA256 of `{token}:{expires}`.
    pub fn sign(&self, token: &str, expires: i64) -> String {
        hex::encode(self.mac(token, expires).finalize().into_bytes())
    }

    /// Constant-time signature check; fails once `now` reaches `expires`.
    pub fn verify(&self, token: &str, signature: &str, expires: i64, now: DateTime<Utc>) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        match hex::decode(signature) {
            Ok(raw) => self.mac(token, expires).verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadView {
    pub id: i64,
    pub order_item_id: i64,
    pub file_id: i64,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub download_count: i32,
    pub download_limit: i32,
    pub remaining: i32,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub last_downloaded_at: Option<DateTime<Utc>>,
}

impl DownloadView {
    fn new(download: download::Model, file: Option<product_file::Model>, now: DateTime<Utc>) -> Self {
        Self {
            remaining: download.remaining(),
            expired: download.is_expired(now),
            id: download.id,
            order_item_id: download.order_item_id,
            file_id: download.file_id,
            file_name: file.as_ref().map(|f| f.label().to_string()),
            file_size: file.map(|f| f.file_size),
            download_count: download.download_count,
            download_limit: download.download_limit,
            expires_at: download.expires_at,
            last_downloaded_at: download.last_downloaded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub file_name: String,
    pub file_size: i64,
}

/// A redeemed download: which file to hand out.
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub download_id: i64,
    pub file: product_file::Model,
    pub remaining: i32,
}

#[derive(Clone)]
pub struct DownloadService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    event_sender: Arc<EventSender>,
    config: DownloadConfig,
    signer: UrlSigner,
    base_url: String,
}

impl DownloadService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn Catalog>,
        event_sender: Arc<EventSender>,
        config: DownloadConfig,
        base_url: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            signer: UrlSigner::new(&config.signing_secret)?,
            db,
            catalog,
            event_sender,
            config,
            base_url: base_url.into(),
        })
    }

    /// Grants access to every file of a purchased digital line. Calling it
    /// again returns the existing grants.
    #[instrument(skip(self))]
    pub async fn create_access(
        &self,
        user_id: i64,
        order_item_id: i64,
    ) -> Result<Vec<DownloadView>, ServiceError> {
        let item = self.find_item(order_item_id).await?;
        let order = find_order(&*self.db, item.order_id).await?;
        ensure_owner(&order, user_id)?;
        if !item.is_digital() {
            return Err(ServiceError::InvalidInput("not a digital product".into()));
        }
        if !order.status.grants_fulfilment() {
            return Err(ServiceError::InvalidStatus("order is not paid".into()));
        }

        let files = self.catalog.product_files(item.product_id).await?;
        if files.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "files for product {}",
                item.product_id
            )));
        }
        let product = self.catalog.find_product(item.product_id).await?;
        let limit = product
            .as_ref()
            .and_then(|p| p.download_limit)
            .filter(|l| *l > 0)
            .unwrap_or(self.config.default_limit);
        let days = product
            .as_ref()
            .and_then(|p| p.download_expiry_days)
            .filter(|d| *d > 0)
            .map(i64::from)
            .unwrap_or(self.config.default_expiry_days);

        let now = Utc::now();
        let expires_at = now + Duration::days(days);
        for file in &files {
            let grant = download::ActiveModel {
                order_item_id: Set(item.id),
                file_id: Set(file.id),
                user_id: Set(user_id),
                token: Set(generate_token()),
                download_count: Set(0),
                download_limit: Set(limit),
                expires_at: Set(expires_at),
                created_at: Set(now),
                ..Default::default()
            };
            let inserted = download::Entity::insert(grant)
                .on_conflict(
                    OnConflict::columns([download::Column::OrderItemId, download::Column::FileId])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;
            debug!(file_id = file.id, inserted, "download access ensured");
        }

        self.list_for_item(user_id, order_item_id).await
    }

    pub async fn list_for_item(
        &self,
        user_id: i64,
        order_item_id: i64,
    ) -> Result<Vec<DownloadView>, ServiceError> {
        let rows = download::Entity::find()
            .filter(download::Column::OrderItemId.eq(order_item_id))
            .filter(download::Column::UserId.eq(user_id))
            .order_by_asc(download::Column::Id)
            .find_also_related(product_file::Entity)
            .all(&*self.db)
            .await?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .map(|(d, f)| DownloadView::new(d, f, now))
            .collect())
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<DownloadView>, ServiceError> {
        let rows = download::Entity::find()
            .filter(download::Column::UserId.eq(user_id))
            .order_by_desc(download::Column::Id)
            .find_also_related(product_file::Entity)
            .all(&*self.db)
            .await?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .map(|(d, f)| DownloadView::new(d, f, now))
            .collect())
    }

    /// Issues a URL valid for `url_ttl_secs`.
    #[instrument(skip(self))]
    pub async fn generate_url(
        &self,
        user_id: i64,
        order_item_id: i64,
        file_id: i64,
    ) -> Result<SignedUrl, ServiceError> {
        let grant = download::Entity::find()
            .filter(download::Column::OrderItemId.eq(order_item_id))
            .filter(download::Column::FileId.eq(file_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("download access".into()))?;
        let now = Utc::now();
        check_grant(&grant, user_id, now)?;
        self.ensure_still_paid(grant.order_item_id).await?;

        let file = product_file::Entity::find_by_id(file_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("file {}", file_id)))?;

        let ttl = i64::try_from(self.config.url_ttl_secs).unwrap_or(i64::MAX);
        let expires_at = now + Duration::seconds(ttl);
        let exp = expires_at.timestamp();
        let url = format!(
            "{}/api/v1/downloads/{}?sig={}&exp={}",
            self.base_url.trim_end_matches('/'),
            grant.token,
            self.signer.sign(&grant.token, exp),
            exp
        );
        Ok(SignedUrl {
            url,
            expires_at,
            file_name: file.label().to_string(),
            file_size: file.file_size,
        })
    }

    /// Redeems a signed URL. The signature is checked before anything is
    /// looked up; the counter increment is conditional on the limit.
    #[instrument(skip(self, token, signature))]
    pub async fn process(
        &self,
        token: &str,
        signature: &str,
        expires: i64,
        user_id: i64,
    ) -> Result<ServedFile, ServiceError> {
        let now = Utc::now();
        if !self.signer.verify(token, signature, expires, now) {
            return Err(ServiceError::Forbidden("invalid or expired download link".into()));
        }

        let grant = download::Entity::find()
            .filter(download::Column::Token.eq(token))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("download".into()))?;
        check_grant(&grant, user_id, now)?;
        self.ensure_still_paid(grant.order_item_id).await?;

        let result = download::Entity::update_many()
            .col_expr(
                download::Column::DownloadCount,
                Expr::col(download::Column::DownloadCount).add(1),
            )
            .col_expr(download::Column::LastDownloadedAt, Expr::value(now))
            .filter(download::Column::Id.eq(grant.id))
            .filter(
                Expr::col(download::Column::DownloadCount)
                    .lt(Expr::col(download::Column::DownloadLimit)),
            )
            .filter(download::Column::ExpiresAt.gt(now))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Forbidden("download limit reached".into()));
        }

        let file = product_file::Entity::find_by_id(grant.file_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("file {}", grant.file_id)))?;

        counter!("ledger.downloads.served", 1);
        self.event_sender
            .send_or_log(Event::DownloadServed {
                download_id: grant.id,
                user_id,
            })
            .await;
        info!(download_id = grant.id, file_id = file.id, "download served");
        Ok(ServedFile {
            download_id: grant.id,
            remaining: grant.remaining() - 1,
            file,
        })
    }

    /// Grants outlive refunds; the parent order must still be in a paid state.
    async fn ensure_still_paid(&self, order_item_id: i64) -> Result<(), ServiceError> {
        let item = self.find_item(order_item_id).await?;
        let order = find_order(&*self.db, item.order_id).await?;
        if !order.status.grants_fulfilment() {
            return Err(ServiceError::Forbidden(format!(
                "order is {}; downloads are no longer available",
                order.status
            )));
        }
        Ok(())
    }

    async fn find_item(&self, order_item_id: i64) -> Result<order_item::Model, ServiceError> {
        order_item::Entity::find_by_id(order_item_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order item {}", order_item_id)))
    }
}

fn check_grant(grant: &download::Model, user_id: i64, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if grant.user_id != user_id {
        return Err(ServiceError::Forbidden(
            "you are not the owner of this download".into(),
        ));
    }
    if grant.is_expired(now) {
        return Err(ServiceError::Forbidden("download has expired".into()));
    }
    if grant.remaining() == 0 {
        return Err(ServiceError::Forbidden("download limit reached".into()));
    }
    Ok(())
}
