#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use checkout_service::config::{
    Config, DatabaseConfig, GatewayConfig, IdentityConfig, PaymentSettings, StorageBackend,
};
use checkout_service::models::{CatalogItem, ItemKind};
use checkout_service::services::phonepe::{
    GatewayError, GatewayInitiation, GatewayStatus, InitiationRequest, PaymentGateway,
};
use checkout_service::services::MemoryStore;
use checkout_service::{router, AppState, Stores};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::identity::JwtAlgorithm;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub const JWT_SECRET: &str = "checkout-test-secret";
pub const TEST_USER_ID: &str = "user_2abc";
pub const OTHER_USER_ID: &str = "user_9xyz";
pub const ADMIN_USER_ID: &str = "admin_1";
pub const COURSE_ID: &str = "course-1";
pub const COURSE_PRICE: i64 = 999;

pub fn test_config() -> Config {
    Config {
        common: service_core::config::Config {
            port: 0,
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        },
        database: DatabaseConfig {
            backend: StorageBackend::Memory,
            url: Secret::new(String::new()),
            db_name: "checkout_test".to_string(),
            catalog_seed: None,
        },
        identity: IdentityConfig {
            algorithm: JwtAlgorithm::Hs256,
            key: Secret::new(JWT_SECRET.to_string()),
            issuer: None,
            audience: None,
        },
        gateway: gateway_config("http://127.0.0.1:9"),
        payments: PaymentSettings {
            currency: "INR".to_string(),
            pending_expiry_minutes: 30,
            reconcile_interval_secs: 0,
        },
        service_name: "checkout-service-test".to_string(),
    }
}

pub fn gateway_config(api_base_url: &str) -> GatewayConfig {
    GatewayConfig {
        merchant_id: "MERCHANTUAT".to_string(),
        salt_key: Secret::new("099eb0cd-02cf-4e2a-8aca-3e6c6aff0399".to_string()),
        salt_index: "1".to_string(),
        api_base_url: api_base_url.to_string(),
        frontend_url: "https://learn.example.com".to_string(),
        backend_url: "https://api.learn.example.com".to_string(),
        placeholder_phone: "9999999999".to_string(),
        timeout_secs: 15,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyScript {
    #[default]
    Success,
    Declined,
    Error,
}

/// Gateway double whose answers are set per test.
#[derive(Default)]
pub struct ScriptedGateway {
    verify_script: Mutex<VerifyScript>,
    fail_initiate: AtomicBool,
    pub initiate_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn set_verify(&self, script: VerifyScript) {
        *self.verify_script.lock().unwrap() = script;
    }

    pub fn fail_initiation(&self) {
        self.fail_initiate.store(true, Ordering::SeqCst);
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn initiate(
        &self,
        request: &InitiationRequest,
    ) -> Result<GatewayInitiation, GatewayError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(GatewayError::Provider {
                status: 500,
                body: r#"{"success":false,"code":"INTERNAL_SERVER_ERROR"}"#.to_string(),
            });
        }

        let url = format!("https://mercury.test/pay/{}", request.merchant_transaction_id);
        Ok(GatewayInitiation {
            redirect_url: url.clone(),
            raw: json!({
                "success": true,
                "code": "PAYMENT_INITIATED",
                "data": { "instrumentResponse": { "redirectInfo": { "url": url } } }
            }),
        })
    }

    async fn verify(&self, merchant_transaction_id: &str) -> Result<GatewayStatus, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        // Give racing callbacks a chance to interleave.
        tokio::task::yield_now().await;

        let script = *self.verify_script.lock().unwrap();
        let code = match script {
            VerifyScript::Success => "PAYMENT_SUCCESS",
            VerifyScript::Declined => "PAYMENT_ERROR",
            VerifyScript::Error => {
                return Err(GatewayError::InvalidResponse(
                    "connection reset by peer".to_string(),
                ))
            }
        };

        Ok(GatewayStatus {
            code: code.to_string(),
            gateway_transaction_id: Some(format!("T{}", merchant_transaction_id)),
            raw: json!({
                "success": script == VerifyScript::Success,
                "code": code,
                "data": {
                    "merchantTransactionId": merchant_transaction_id,
                    "transactionId": format!("T{}", merchant_transaction_id)
                }
            }),
        })
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let state = AppState::new(config, Stores::shared(store.clone()), gateway.clone())
            .expect("Failed to build test state");

        Self {
            store,
            gateway,
            state,
        }
    }

    /// A fresh app with [`COURSE_ID`] published at [`COURSE_PRICE`].
    pub async fn with_course() -> Self {
        let app = Self::new();
        app.seed_item(course(COURSE_ID, COURSE_PRICE));
        app
    }

    pub fn seed_item(&self, item: CatalogItem) {
        self.store.upsert_item(item);
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self.send(method, uri, token, body).await;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        self.router()
            .oneshot(request)
            .await
            .expect("Failed to execute request")
    }
}

pub fn course(id: &str, price: i64) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        kind: ItemKind::Course,
        title: format!("Course {}", id),
        slug: id.to_string(),
        price,
        discounted_price: None,
        is_published: true,
        enrolled_users: vec![],
        total_enrollments: 0,
    }
}

pub fn token_for(user_id: &str, role: Option<&str>) -> String {
    let mut claims = json!({
        "sub": user_id,
        "email": format!("{}@example.com", user_id),
        "exp": 9_999_999_999i64
    });
    if let Some(role) = role {
        claims["metadata"] = json!({ "role": role });
    }
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("Failed to sign token")
}

pub fn user_token() -> String {
    token_for(TEST_USER_ID, None)
}

pub fn admin_token() -> String {
    token_for(ADMIN_USER_ID, Some("admin"))
}
