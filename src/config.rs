use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::gateways::{inicis::InicisConfig, kakaopay::KakaoPayConfig, tosspayments::TossConfig};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "KRW";
const DEV_DEFAULT_JWT_SECRET: &str = "development-only-jwt-secret-change-me-before-deploying";
const DEV_DEFAULT_DOWNLOAD_SECRET: &str = "development-only-download-signing-secret-value";

/// Order and checkout tuning
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CommerceConfig {
    /// Platform commission taken from each line item, in percent
    #[serde(default = "default_platform_fee_rate")]
    #[validate(custom = "validate_percent")]
    pub platform_fee_rate: Decimal,

    /// Flat shipping fee charged once per order that contains physical items
    #[serde(default)]
    #[validate(custom = "validate_non_negative")]
    pub default_shipping_fee: Decimal,

    /// Attempts at generating a unique order number before giving up
    #[serde(default = "default_order_number_retries")]
    #[validate(range(min = 1, max = 20))]
    pub order_number_retries: u32,

    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            platform_fee_rate: default_platform_fee_rate(),
            default_shipping_fee: Decimal::ZERO,
            order_number_retries: default_order_number_retries(),
            default_currency: default_currency(),
        }
    }
}

/// Seller settlement rates and payout wiring
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SettlementConfig {
    /// Payment gateway fee as a fraction of net sales
    #[serde(default = "default_pg_fee_rate")]
    #[validate(custom = "validate_fraction")]
    pub pg_fee_rate: Decimal,

    /// Platform fee as a fraction of net sales
    #[serde(default = "default_platform_rate")]
    #[validate(custom = "validate_fraction")]
    pub platform_rate: Decimal,

    /// Bank-transfer endpoint; when unset payouts are confirmed manually by an operator
    #[serde(default)]
    pub payout_endpoint: Option<String>,

    #[serde(default = "default_payout_timeout_secs")]
    pub payout_timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            pg_fee_rate: default_pg_fee_rate(),
            platform_rate: default_platform_rate(),
            payout_endpoint: None,
            payout_timeout_secs: default_payout_timeout_secs(),
        }
    }
}

/// Digital download access
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DownloadConfig {
    /// HMAC key for signed download URLs
    #[serde(default = "default_signing_secret")]
    #[validate(length(min = 32))]
    pub signing_secret: String,

    /// Lifetime of a signed download URL
    #[serde(default = "default_url_ttl_secs")]
    #[validate(range(min = 10, max = 86400))]
    pub url_ttl_secs: u64,

    /// Downloads allowed per file when the product sets no limit
    #[serde(default = "default_download_limit")]
    #[validate(range(min = 1))]
    pub default_limit: i32,

    /// Access lifetime in days when the product sets no expiry
    #[serde(default = "default_download_expiry_days")]
    #[validate(range(min = 1))]
    pub default_expiry_days: i64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            signing_secret: default_signing_secret(),
            url_ttl_secs: default_url_ttl_secs(),
            default_limit: default_download_limit(),
            default_expiry_days: default_download_expiry_days(),
        }
    }
}

/// Live parcel tracking. Lookups are enabled only when an API key is set.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShippingConfig {
    #[serde(default)]
    pub tracker_api_key: Option<String>,
    #[serde(default = "default_tracker_api_base")]
    pub tracker_api_base: String,
    #[serde(default = "default_tracker_timeout_secs")]
    pub tracker_timeout_secs: u64,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            tracker_api_key: None,
            tracker_api_base: default_tracker_api_base(),
            tracker_timeout_secs: default_tracker_timeout_secs(),
        }
    }
}

/// Payment provider credentials. A provider is registered only when its section is present.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaysConfig {
    #[serde(default)]
    pub toss: Option<TossConfig>,
    #[serde(default)]
    pub inicis: Option<InicisConfig>,
    #[serde(default)]
    pub kakaopay: Option<KakaoPayConfig>,
    /// Shared secret for the `x-webhook-signature` header on inbound provider callbacks
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewaysConfig {
    fn default() -> Self {
        Self {
            toss: None,
            inicis: None,
            kakaopay: None,
            webhook_secret: None,
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 secret used to verify caller tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Base URL used when building links handed to clients (download URLs)
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Per-request timeout applied by the HTTP layer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bounded capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default)]
    #[validate]
    pub commerce: CommerceConfig,

    #[serde(default)]
    #[validate]
    pub settlement: SettlementConfig,

    #[serde(default)]
    #[validate]
    pub downloads: DownloadConfig,

    #[serde(default)]
    pub gateways: GatewaysConfig,

    #[serde(default)]
    pub shipping: ShippingConfig,
}

impl AppConfig {
    /// Builds a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            public_base_url: default_public_base_url(),
            cors_allowed_origins: None,
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            commerce: CommerceConfig::default(),
            settlement: SettlementConfig::default(),
            downloads: DownloadConfig::default(),
            gateways: GatewaysConfig::default(),
            shipping: ShippingConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        matches!(
            self.environment.to_ascii_lowercase().as_str(),
            "development" | "test"
        )
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if !self.is_development() && self.downloads.signing_secret == DEV_DEFAULT_DOWNLOAD_SECRET {
            let mut err = ValidationError::new("download_secret_default_dev");
            err.message = Some(
                "Set APP__DOWNLOADS__SIGNING_SECRET outside development.".into(),
            );
            errors.add("downloads", err);
        }

        if self.settlement.pg_fee_rate + self.settlement.platform_rate >= Decimal::ONE {
            let mut err = ValidationError::new("settlement_rates");
            err.message = Some("pg_fee_rate + platform_rate must be below 1".into());
            errors.add("settlement", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_public_base_url() -> String {
    format!("http://localhost:{}", DEFAULT_PORT)
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_platform_fee_rate() -> Decimal {
    dec!(5.0)
}

fn default_order_number_retries() -> u32 {
    5
}

fn default_pg_fee_rate() -> Decimal {
    dec!(0.033)
}

fn default_platform_rate() -> Decimal {
    dec!(0.05)
}

fn default_payout_timeout_secs() -> u64 {
    30
}

fn default_signing_secret() -> String {
    DEV_DEFAULT_DOWNLOAD_SECRET.to_string()
}

fn default_url_ttl_secs() -> u64 {
    600
}

fn default_download_limit() -> i32 {
    5
}

fn default_download_expiry_days() -> i64 {
    30
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

fn default_tracker_api_base() -> String {
    "http://info.sweettracker.co.kr".to_string()
}

fn default_tracker_timeout_secs() -> u64 {
    10
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_percent(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > dec!(100) {
        let mut err = ValidationError::new("percent");
        err.message = Some("must be between 0 and 100".into());
        return Err(err);
    }
    Ok(())
}

fn validate_fraction(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate >= Decimal::ONE {
        let mut err = ValidationError::new("fraction");
        err.message = Some("must be in [0, 1)".into());
        return Err(err);
    }
    Ok(())
}

fn validate_non_negative(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("marketplace_ledger={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
