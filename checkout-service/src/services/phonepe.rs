//! PhonePe payment gateway client.
//!
//! Implements PhonePe's Pay Page API for payment initiation and the status API
//! for out-of-band verification. Every request is signed with the
//! `X-VERIFY` checksum derived from the merchant salt key.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

pub const PAY_ENDPOINT: &str = "/pg/v1/pay";
pub const STATUS_ENDPOINT: &str = "/pg/v1/status";
/// The only status code PhonePe uses for a completed payment.
pub const PAYMENT_SUCCESS_CODE: &str = "PAYMENT_SUCCESS";

const MERCHANT_USER_ID_MAX_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),

    #[error("Invalid gateway request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Request(e) if e.is_timeout())
    }

    /// Audit record stored on the transaction when verification fails.
    pub fn audit_payload(&self) -> Value {
        match self {
            GatewayError::Provider { status, body } => json!({
                "error": "provider_error",
                "httpStatus": status,
                "providerBody": serde_json::from_str::<Value>(body)
                    .unwrap_or_else(|_| Value::String(body.clone())),
            }),
            GatewayError::Request(_) if self.is_timeout() => json!({
                "error": "timeout",
                "message": self.to_string(),
            }),
            other => json!({
                "error": "verification_failed",
                "message": other.to_string(),
            }),
        }
    }
}

/// Inputs for a pay request.
#[derive(Debug, Clone)]
pub struct InitiationRequest {
    pub merchant_transaction_id: String,
    pub user_id: String,
    /// Minor currency units (paise).
    pub amount: i64,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayInitiation {
    /// Pay page the payer is sent to.
    pub redirect_url: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub code: String,
    pub gateway_transaction_id: Option<String>,
    pub raw: Value,
}

impl GatewayStatus {
    pub fn is_success(&self) -> bool {
        self.code == PAYMENT_SUCCESS_CODE
    }
}

/// Stateless translation to and from a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, request: &InitiationRequest)
        -> Result<GatewayInitiation, GatewayError>;

    /// Ask the provider for the authoritative outcome of a transaction.
    async fn verify(&self, merchant_transaction_id: &str) -> Result<GatewayStatus, GatewayError>;
}

/// What an inbound callback claims. Untrusted: only used to find the
/// transaction to re-verify.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackNotice {
    pub merchant_transaction_id: Option<String>,
    pub transaction_id: Option<String>,
    pub code: Option<String>,
}

impl CallbackNotice {
    /// Accepts the flat JSON shape and the server-to-server
    /// `{"response": <base64 JSON>}` shape.
    pub fn parse(body: &Value) -> Self {
        if let Some(encoded) = body.get("response").and_then(Value::as_str) {
            let decoded = STANDARD
                .decode(encoded.trim())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
            if let Some(decoded) = decoded {
                let data = decoded.get("data").unwrap_or(&Value::Null);
                return Self {
                    merchant_transaction_id: string_field(data, "merchantTransactionId"),
                    transaction_id: string_field(data, "transactionId"),
                    code: string_field(&decoded, "code"),
                };
            }
        }

        Self {
            merchant_transaction_id: string_field(body, "merchantTransactionId"),
            transaction_id: string_field(body, "transactionId"),
            code: string_field(body, "code"),
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `sha256_hex(data + salt_key) + "###" + salt_index`
pub fn checksum(data: &str, salt_key: &str, salt_index: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.update(salt_key.as_bytes());
    format!("{}###{}", hex::encode(hasher.finalize()), salt_index)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayPayload<'a> {
    merchant_id: &'a str,
    merchant_transaction_id: &'a str,
    merchant_user_id: String,
    amount: i64,
    redirect_url: String,
    redirect_mode: &'static str,
    callback_url: String,
    mobile_number: &'a str,
    payment_instrument: PaymentInstrument,
}

#[derive(Debug, Serialize)]
struct PaymentInstrument {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Clone)]
pub struct PhonePeClient {
    client: Client,
    config: GatewayConfig,
}

impl PhonePeClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.merchant_id.is_empty() && !self.config.salt_key.expose_secret().is_empty()
    }

    fn sign(&self, data: &str) -> String {
        checksum(
            data,
            self.config.salt_key.expose_secret(),
            &self.config.salt_index,
        )
    }

    fn pay_payload(&self, request: &InitiationRequest) -> Result<String, GatewayError> {
        let payload = PayPayload {
            merchant_id: &self.config.merchant_id,
            merchant_transaction_id: &request.merchant_transaction_id,
            merchant_user_id: request
                .user_id
                .chars()
                .take(MERCHANT_USER_ID_MAX_LEN)
                .collect(),
            amount: request.amount,
            redirect_url: format!(
                "{}/payment/callback?transactionId={}",
                self.config.frontend_url.trim_end_matches('/'),
                request.merchant_transaction_id
            ),
            redirect_mode: "POST",
            callback_url: format!(
                "{}/api/payment/callback",
                self.config.backend_url.trim_end_matches('/')
            ),
            mobile_number: request
                .phone
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(&self.config.placeholder_phone),
            payment_instrument: PaymentInstrument { kind: "PAY_PAGE" },
        };

        let json = serde_json::to_vec(&payload)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("body is not JSON: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for PhonePeClient {
    async fn initiate(
        &self,
        request: &InitiationRequest,
    ) -> Result<GatewayInitiation, GatewayError> {
        if request.merchant_transaction_id.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "merchant transaction id is empty".to_string(),
            ));
        }
        if request.amount <= 0 {
            return Err(GatewayError::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let encoded = self.pay_payload(request)?;
        let x_verify = self.sign(&format!("{}{}", encoded, PAY_ENDPOINT));
        let url = format!(
            "{}{}",
            self.config.api_base_url.trim_end_matches('/'),
            PAY_ENDPOINT
        );

        let response = self
            .client
            .post(&url)
            .header("X-VERIFY", x_verify)
            .json(&json!({ "request": encoded }))
            .send()
            .await?;

        let raw = Self::read_json(response).await.inspect_err(|e| {
            tracing::error!(
                transaction_id = %request.merchant_transaction_id,
                error = %e,
                "PhonePe pay request failed"
            );
        })?;

        let redirect_url = raw
            .pointer("/data/instrumentResponse/redirectInfo/url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::InvalidResponse(format!("no redirect url in response: {}", raw))
            })?;

        tracing::info!(
            transaction_id = %request.merchant_transaction_id,
            amount = request.amount,
            "PhonePe payment initiated"
        );

        Ok(GatewayInitiation { redirect_url, raw })
    }

    async fn verify(&self, merchant_transaction_id: &str) -> Result<GatewayStatus, GatewayError> {
        if merchant_transaction_id.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "merchant transaction id is empty".to_string(),
            ));
        }

        let endpoint = format!(
            "{}/{}/{}",
            STATUS_ENDPOINT, self.config.merchant_id, merchant_transaction_id
        );
        let x_verify = self.sign(&endpoint);
        let url = format!(
            "{}{}",
            self.config.api_base_url.trim_end_matches('/'),
            endpoint
        );

        let response = self
            .client
            .get(&url)
            .header("X-VERIFY", x_verify)
            .header("X-MERCHANT-ID", &self.config.merchant_id)
            .send()
            .await?;

        let raw = Self::read_json(response).await?;

        let code = raw
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidResponse(format!("no status code in: {}", raw)))?;
        let gateway_transaction_id = raw
            .pointer("/data/transactionId")
            .and_then(Value::as_str)
            .map(str::to_string);

        tracing::info!(
            transaction_id = %merchant_transaction_id,
            code = %code,
            "PhonePe status verified"
        );

        Ok(GatewayStatus {
            code,
            gateway_transaction_id,
            raw,
        })
    }
}
