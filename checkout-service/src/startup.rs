//! Application startup and lifecycle management.

use crate::config::{Config, StorageBackend};
use crate::handlers;
use crate::models::CatalogItem;
use crate::services::{
    AccessGate, EntitlementStore, ItemCatalog, MemoryStore, MongoStore, PaymentGateway,
    PaymentOrchestrator, PhonePeClient, Reporting, TransactionStore,
};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::identity::IdentityVerifier;
use service_core::middleware::{
    metrics_middleware, request_id_middleware, require_identity, security_headers_middleware,
    REQUEST_ID_HEADER,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// The three storage ports, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub transactions: Arc<dyn TransactionStore>,
    pub catalog: Arc<dyn ItemCatalog>,
    pub entitlements: Arc<dyn EntitlementStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: TransactionStore + ItemCatalog + EntitlementStore + 'static,
    {
        Self {
            transactions: store.clone(),
            catalog: store.clone(),
            entitlements: store,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityVerifier>,
    pub payments: Arc<PaymentOrchestrator>,
    pub access: Arc<AccessGate>,
    pub reporting: Arc<Reporting>,
    pub store_health: Arc<dyn TransactionStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, AppError> {
        let identity = IdentityVerifier::new(
            config.identity.algorithm,
            config.identity.key.expose_secret(),
            config.identity.issuer.as_deref(),
            config.identity.audience.as_deref(),
        )?;

        let payments = PaymentOrchestrator::new(
            stores.transactions.clone(),
            stores.catalog.clone(),
            stores.entitlements.clone(),
            gateway,
            config.payments.clone(),
        );
        let access = AccessGate::new(stores.catalog.clone(), stores.entitlements.clone());
        let reporting = Reporting::new(
            stores.transactions.clone(),
            stores.catalog.clone(),
            stores.entitlements.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            payments: Arc::new(payments),
            access: Arc::new(access),
            reporting: Arc::new(reporting),
            store_health: stores.transactions,
        })
    }
}

impl AsRef<IdentityVerifier> for AppState {
    fn as_ref(&self) -> &IdentityVerifier {
        &self.identity
    }
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/payment/initiate", post(handlers::payment::initiate))
        .route(
            "/payment/status/:transaction_id",
            get(handlers::payment::status),
        )
        .route("/payment/history", get(handlers::payment::history))
        .route("/user/enrollments", get(handlers::user::enrollments))
        .route("/user/dashboard", get(handlers::user::dashboard))
        .route(
            "/user/items/:item_id/access",
            get(handlers::user::item_access),
        )
        .route(
            "/user/items/:item_id/progress",
            post(handlers::user::update_progress),
        )
        .route("/admin/analytics", get(handlers::admin::analytics))
        .route(
            "/admin/payments/reconcile",
            post(handlers::admin::reconcile),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            require_identity::<AppState>,
        ));

    let api = Router::new()
        // Called by the gateway, not by a signed-in user.
        .route("/payment/callback", post(handlers::payment::callback))
        .merge(authenticated);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let stores = match config.database.backend {
            StorageBackend::Mongo => {
                let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to parse MongoDB connection string: {}", e);
                        AppError::DatabaseError(e.into())
                    })?;
                client_options.app_name = Some(config.service_name.clone());

                let client = Client::with_options(client_options).map_err(|e| {
                    tracing::error!("Failed to create MongoDB client: {}", e);
                    AppError::DatabaseError(e.into())
                })?;
                let store = MongoStore::new(&client.database(&config.database.db_name));

                store.init_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    AppError::from(e)
                })?;

                Stores::shared(Arc::new(store))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                let store = MemoryStore::new();
                if let Some(path) = &config.database.catalog_seed {
                    let count = seed_catalog(&store, path).await?;
                    tracing::info!(path = %path, count, "Catalog seeded");
                }
                Stores::shared(Arc::new(store))
            }
        };

        let gateway = PhonePeClient::new(config.gateway.clone())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
        if gateway.is_configured() {
            tracing::info!("PhonePe client initialized");
        } else {
            tracing::warn!("PhonePe credentials not configured - payments will fail");
        }

        let port = config.common.port;
        let state = AppState::new(config, stores, Arc::new(gateway))?;

        // Port 0 binds a random port for tests.
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let interval_secs = self.state.config.payments.reconcile_interval_secs;
        if interval_secs > 0 {
            spawn_reconciler(self.state.payments.clone(), Duration::from_secs(interval_secs));
        }

        tracing::info!("Checkout service listening on port {}", self.port);
        axum::serve(self.listener, router(self.state)).await
    }
}

/// Load a JSON array of catalog items into the in-memory backend.
pub async fn seed_catalog(store: &MemoryStore, path: &str) -> Result<usize, AppError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Failed to read catalog seed {}: {}", path, e))
    })?;
    let items: Vec<CatalogItem> = serde_json::from_str(&raw).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid catalog seed {}: {}", path, e))
    })?;

    let count = items.len();
    for item in items {
        store.upsert_item(item);
    }
    Ok(count)
}

fn spawn_reconciler(payments: Arc<PaymentOrchestrator>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = payments.reconcile().await {
                tracing::error!(error = %e, "Scheduled reconciliation failed");
            }
        }
    });
}
