use secrecy::Secret;
use service_core::config::{get_env, parse_env, Config as CommonConfig};
use service_core::error::AppError;
use service_core::identity::JwtAlgorithm;

pub const DEFAULT_PHONEPE_BASE_URL: &str = "https://api-preprod.phonepe.com/apis/pg-sandbox";

#[derive(Clone, Debug)]
pub struct Config {
    pub common: CommonConfig,
    pub database: DatabaseConfig,
    pub identity: IdentityConfig,
    pub gateway: GatewayConfig,
    pub payments: PaymentSettings,
    pub service_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub url: Secret<String>,
    pub db_name: String,
    /// JSON array of catalog items loaded into the in-memory backend.
    pub catalog_seed: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub algorithm: JwtAlgorithm,
    /// PEM public key (RS256) or shared secret (HS256).
    pub key: Secret<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// PhonePe merchant credentials and the URLs embedded in pay requests.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub merchant_id: String,
    pub salt_key: Secret<String>,
    pub salt_index: String,
    pub api_base_url: String,
    pub frontend_url: String,
    pub backend_url: String,
    /// Sent as `mobileNumber` when the payer gave none. PhonePe insists on a
    /// value; it is not a real contact.
    pub placeholder_phone: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PaymentSettings {
    pub currency: String,
    /// PENDING transactions older than this read as FAILED.
    pub pending_expiry_minutes: i64,
    /// 0 disables the background reconciliation task.
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load()?;

        let backend: StorageBackend = parse_env("STORAGE_BACKEND", "mongo")?;
        let db_url = match backend {
            StorageBackend::Mongo => get_env("MONGODB_URI", None, true)?,
            StorageBackend::Memory => String::new(),
        };
        let db_name = get_env("MONGODB_DATABASE", Some("checkout_db"), false)?;

        let identity = IdentityConfig {
            algorithm: parse_env("IDENTITY_JWT_ALGORITHM", "RS256")?,
            key: Secret::new(get_env("IDENTITY_JWT_KEY", None, true)?),
            issuer: optional_env("IDENTITY_JWT_ISSUER"),
            audience: optional_env("IDENTITY_JWT_AUDIENCE"),
        };

        let gateway = GatewayConfig {
            merchant_id: get_env("PHONEPE_MERCHANT_ID", None, true)?,
            salt_key: Secret::new(get_env("PHONEPE_SALT_KEY", None, true)?),
            salt_index: get_env("PHONEPE_SALT_INDEX", Some("1"), false)?,
            api_base_url: get_env("PHONEPE_BASE_URL", Some(DEFAULT_PHONEPE_BASE_URL), false)?,
            frontend_url: get_env("FRONTEND_URL", Some("http://localhost:3000"), false)?,
            backend_url: get_env("BACKEND_URL", Some("http://localhost:5000"), false)?,
            placeholder_phone: get_env("PHONEPE_PLACEHOLDER_PHONE", Some("9999999999"), false)?,
            timeout_secs: parse_env("PHONEPE_TIMEOUT_SECONDS", "15")?,
        };

        let payments = PaymentSettings {
            currency: get_env("PAYMENT_CURRENCY", Some("INR"), false)?,
            pending_expiry_minutes: parse_env("PAYMENT_PENDING_EXPIRY_MINUTES", "30")?,
            reconcile_interval_secs: parse_env("PAYMENT_RECONCILE_INTERVAL_SECONDS", "0")?,
        };

        Ok(Self {
            common,
            database: DatabaseConfig {
                backend,
                url: Secret::new(db_url),
                db_name,
                catalog_seed: optional_env("CATALOG_SEED_FILE"),
            },
            identity,
            gateway,
            payments,
            service_name: "checkout-service".to_string(),
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
