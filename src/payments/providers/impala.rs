//! Impala Pay mobile-money aggregator integration.
//!
//! Auth is a cached bearer token obtained with basic credentials (see
//! [`TokenCache`]). The aggregator does not hand back a usable correlation
//! id synchronously, so we mint our own external id at request time and
//! match the callback against it. The webhook body is flat (a `status`
//! field) rather than Daraja's nested wrapper.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::AppError;
use crate::payments::gateway::{GatewayError, PaymentGateway};
use crate::payments::phone;
use crate::payments::token_cache::{IssuedToken, TokenCache, TokenSource};
use crate::payments::types::{
    whole_units, CallbackOutcome, ChargeAck, ChargeRequest, ProviderName,
};

#[derive(Debug, Clone)]
pub struct ImpalaConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    pub callback_url: String,
    pub currency: String,
    /// Mobile-money network the payer is on, e.g. `m-pesa`.
    pub network: String,
    pub timeout_secs: u64,
}

impl ImpalaConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        Ok(Self {
            base_url: std::env::var("IMPALA_BASE_URL")
                .unwrap_or_else(|_| "https://payments.mam-laka.com/api/v1".to_string()),
            merchant_id: std::env::var("IMPALA_MERCHANT_ID")
                .context("IMPALA_MERCHANT_ID not set")?,
            username: std::env::var("IMPALA_USERNAME").context("IMPALA_USERNAME not set")?,
            password: std::env::var("IMPALA_PASSWORD").context("IMPALA_PASSWORD not set")?,
            display_name: std::env::var("IMPALA_DISPLAY_NAME")
                .unwrap_or_else(|_| "Duka Store".to_string()),
            callback_url: std::env::var("IMPALA_CALLBACK_URL")
                .context("IMPALA_CALLBACK_URL not set")?,
            currency: std::env::var("IMPALA_CURRENCY").unwrap_or_else(|_| "KES".to_string()),
            network: std::env::var("IMPALA_NETWORK").unwrap_or_else(|_| "m-pesa".to_string()),
            timeout_secs: std::env::var("IMPALA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        })
    }
}

/// Bootstrap fetch against the aggregator's auth endpoint.
struct ImpalaTokenSource {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

#[async_trait]
impl TokenSource for ImpalaTokenSource {
    async fn fetch_token(&self) -> Result<IssuedToken, GatewayError> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            expires_at: Option<String>,
        }

        let body: TokenResponse = serde_json::from_str(&text).map_err(|_| {
            GatewayError::Protocol {
                field: "token".to_string(),
            }
        })?;
        let token = body.token.ok_or_else(|| GatewayError::Protocol {
            field: "token".to_string(),
        })?;
        let raw_expiry = body.expires_at.ok_or_else(|| GatewayError::Protocol {
            field: "expires_at".to_string(),
        })?;

        // Present but unparseable expiry is tolerated; the cache falls
        // back to its default TTL.
        let expires_at = DateTime::parse_from_rfc3339(&raw_expiry)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        Ok(IssuedToken { token, expires_at })
    }
}

pub struct ImpalaGateway {
    config: ImpalaConfig,
    client: Client,
    tokens: TokenCache,
}

impl ImpalaGateway {
    pub fn new(config: ImpalaConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        let tokens = TokenCache::new(Arc::new(ImpalaTokenSource {
            client: client.clone(),
            base_url: config.base_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }));

        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    /// Self-generated correlation id; the callback echoes it back as
    /// `externalId`.
    fn external_id(order_ref: &str, now: DateTime<Utc>) -> String {
        format!("{}-{}", order_ref, now.timestamp_millis())
    }
}

#[async_trait]
impl PaymentGateway for ImpalaGateway {
    fn name(&self) -> ProviderName {
        ProviderName::Impala
    }

    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
        let token = self.tokens.get_token().await?;
        let payer_phone = phone::normalize_plus(&request.phone);
        let external_id = Self::external_id(&request.order_ref, Utc::now());
        let amount = whole_units(request.amount).ok_or_else(|| GatewayError::Rejected {
            code: None,
            message: format!("amount {} not representable in whole units", request.amount),
        })?;

        let body = json!({
            "impalaMerchantId": self.config.merchant_id,
            "displayName": self.config.display_name,
            "currency": self.config.currency,
            "amount": amount,
            "payerPhone": payer_phone,
            "mobileMoneySP": self.config.network,
            "externalId": external_id,
            "callbackUrl": self.config.callback_url,
        });

        info!(order_ref = %request.order_ref, %external_id, amount, "initiating Impala Pay charge");

        let response = self
            .client
            .post(format!("{}/mobile/initiate", self.config.base_url))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        let ack: Value = serde_json::from_str(&text).map_err(|_| GatewayError::Protocol {
            field: "transactionId".to_string(),
        })?;
        let provider_txn_id = string_at(&ack, &["transactionId", "id"]);

        info!(%external_id, ?provider_txn_id, "Impala Pay accepted charge");

        Ok(ChargeAck {
            correlation_id: external_id,
            provider_txn_id,
            response_code: Some(
                string_at(&ack, &["responseCode"]).unwrap_or_else(|| "0".to_string()),
            ),
            customer_message: Some(
                string_at(&ack, &["customerMessage", "message"]).unwrap_or_else(|| {
                    "Please check your phone to complete payment".to_string()
                }),
            ),
        })
    }

    fn parse_callback(&self, body: &Value) -> Result<CallbackOutcome, GatewayError> {
        parse_flat_callback(body)
    }

    async fn query_status(&self, correlation_id: &str) -> Result<CallbackOutcome, GatewayError> {
        let token = self.tokens.get_token().await?;

        let response = self
            .client
            .get(format!(
                "{}/mobile/status/{}",
                self.config.base_url, correlation_id
            ))
            .bearer_auth(&token)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        let mut body: Value = serde_json::from_str(&text).map_err(|_| GatewayError::Protocol {
            field: "status".to_string(),
        })?;
        // Status responses describe the transaction we asked about but may
        // omit the external id; patch it in before normalizing.
        if string_at(&body, &["checkoutRequestId", "externalId"]).is_none() {
            if let Value::Object(map) = &mut body {
                map.insert(
                    "externalId".to_string(),
                    Value::String(correlation_id.to_string()),
                );
            }
        }
        parse_flat_callback(&body)
    }
}

/// Normalize the aggregator's flat callback shape. Pure so the reconciler
/// can dispatch on shape without a configured gateway.
pub fn parse_flat_callback(body: &Value) -> Result<CallbackOutcome, GatewayError> {
    let status = body.get("status").and_then(Value::as_str);
    let raw_code = body.get("resultCode").and_then(Value::as_i64);

    if status.is_none() && raw_code.is_none() {
        return Err(GatewayError::Protocol {
            field: "status".to_string(),
        });
    }

    let success = status == Some("SUCCESS") || raw_code == Some(0);
    let result_code = if success { 0 } else { raw_code.unwrap_or(1) };

    let correlation_id = string_at(body, &["checkoutRequestId", "externalId"])
        .ok_or_else(|| GatewayError::Protocol {
            field: "externalId".to_string(),
        })?;
    let provider_txn_id = string_at(body, &["transactionId", "id"]);

    let result_desc = string_at(body, &["resultDesc", "message"])
        .or_else(|| status.map(str::to_string))
        .unwrap_or_default();

    let receipt_number = if success {
        string_at(body, &["mpesaReceiptNumber", "receiptNumber"])
            .or_else(|| provider_txn_id.clone())
    } else {
        None
    };

    let transaction_date = if success {
        body.get("transactionDate")
            .or_else(|| body.get("timestamp"))
            .and_then(parse_flexible_date)
    } else {
        None
    };

    Ok(CallbackOutcome {
        correlation_id,
        provider_txn_id,
        result_code,
        result_desc,
        receipt_number,
        transaction_date,
        success,
    })
}

/// First present-and-string value among `keys`.
fn string_at(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// The aggregator emits either RFC 3339 strings or epoch milliseconds.
fn parse_flexible_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

fn rejected_from_body(text: &str, http_status: u16) -> GatewayError {
    let parsed: Option<Value> = serde_json::from_str(text).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| string_at(v, &["message", "error"]))
        .unwrap_or_else(|| format!("HTTP {http_status}"));
    GatewayError::Rejected {
        code: None,
        message,
    }
}
