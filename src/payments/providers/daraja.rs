//! Direct Safaricom Daraja (M-Pesa) STK push integration.
//!
//! Every call fetches a short-lived client-credentials token and signs the
//! request with a password derived from the business short code, the
//! passkey and the current timestamp. The charge outcome arrives later on
//! the webhook as a `Body.stkCallback` wrapper.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::error::AppError;
use crate::payments::gateway::{GatewayError, PaymentGateway};
use crate::payments::phone;
use crate::payments::types::{
    whole_units, CallbackOutcome, ChargeAck, ChargeRequest, ProviderName,
};

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DarajaEnvironment {
    Sandbox,
    Production,
}

#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: DarajaEnvironment,
    pub timeout_secs: u64,
}

impl DarajaConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        let environment = match std::env::var("MPESA_ENVIRONMENT")
            .unwrap_or_else(|_| "sandbox".to_string())
            .as_str()
        {
            "production" => DarajaEnvironment::Production,
            _ => DarajaEnvironment::Sandbox,
        };

        Ok(Self {
            consumer_key: std::env::var("MPESA_CONSUMER_KEY")
                .context("MPESA_CONSUMER_KEY not set")?,
            consumer_secret: std::env::var("MPESA_CONSUMER_SECRET")
                .context("MPESA_CONSUMER_SECRET not set")?,
            short_code: std::env::var("MPESA_SHORT_CODE").context("MPESA_SHORT_CODE not set")?,
            passkey: std::env::var("MPESA_PASSKEY").context("MPESA_PASSKEY not set")?,
            callback_url: std::env::var("MPESA_CALLBACK_URL")
                .context("MPESA_CALLBACK_URL not set")?,
            environment,
            timeout_secs: std::env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        })
    }

    fn base_url(&self) -> &'static str {
        match self.environment {
            DarajaEnvironment::Sandbox => SANDBOX_BASE_URL,
            DarajaEnvironment::Production => PRODUCTION_BASE_URL,
        }
    }
}

pub struct DarajaGateway {
    config: DarajaConfig,
    client: Client,
}

impl DarajaGateway {
    pub fn new(config: DarajaConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Short-lived OAuth token, fetched per call.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let response = self
            .client
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.config.base_url()
            ))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        let body: OauthResponse = serde_json::from_str(&text).map_err(|_| {
            GatewayError::Protocol {
                field: "access_token".to_string(),
            }
        })?;
        Ok(body.access_token)
    }

    /// `base64(short_code + passkey + timestamp)`, the request-signing
    /// value Daraja expects alongside the timestamp it was derived from.
    fn password(&self, now: DateTime<Utc>) -> (String, String) {
        let timestamp = now.format("%Y%m%d%H%M%S").to_string();
        let password = BASE64.encode(format!(
            "{}{}{}",
            self.config.short_code, self.config.passkey, timestamp
        ));
        (password, timestamp)
    }
}

#[async_trait]
impl PaymentGateway for DarajaGateway {
    fn name(&self) -> ProviderName {
        ProviderName::Daraja
    }

    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
        let token = self.access_token().await?;
        let (password, timestamp) = self.password(Utc::now());
        let msisdn = phone::normalize(&request.phone);
        let amount = whole_units(request.amount).ok_or_else(|| GatewayError::Rejected {
            code: None,
            message: format!("amount {} not representable in whole units", request.amount),
        })?;

        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": msisdn,
            "PartyB": self.config.short_code,
            "PhoneNumber": msisdn,
            "CallBackURL": self.config.callback_url,
            "AccountReference": request.order_ref,
            "TransactionDesc": request.description,
        });

        info!(order_ref = %request.order_ref, amount, "initiating Daraja STK push");

        let response = self
            .client
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.base_url()
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        let ack: StkPushResponse =
            serde_json::from_str(&text).map_err(|_| GatewayError::Protocol {
                field: "CheckoutRequestID".to_string(),
            })?;
        let correlation_id = ack.checkout_request_id.ok_or_else(|| GatewayError::Protocol {
            field: "CheckoutRequestID".to_string(),
        })?;

        info!(%correlation_id, "Daraja accepted STK push");

        Ok(ChargeAck {
            correlation_id,
            provider_txn_id: ack.merchant_request_id,
            response_code: ack.response_code,
            customer_message: ack.customer_message,
        })
    }

    fn parse_callback(&self, body: &Value) -> Result<CallbackOutcome, GatewayError> {
        parse_stk_callback(body)
    }

    async fn query_status(&self, correlation_id: &str) -> Result<CallbackOutcome, GatewayError> {
        let token = self.access_token().await?;
        let (password, timestamp) = self.password(Utc::now());

        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": correlation_id,
        });

        let response = self
            .client
            .post(format!(
                "{}/mpesa/stkpushquery/v1/query",
                self.config.base_url()
            ))
            .bearer_auth(&token)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(rejected_from_body(&text, status.as_u16()));
        }

        let query: Value = serde_json::from_str(&text).map_err(|_| GatewayError::Protocol {
            field: "ResultCode".to_string(),
        })?;
        // Daraja returns ResultCode as a numeric string here, unlike the
        // callback where it is a number.
        let result_code = coerce_i64(query.get("ResultCode")).ok_or(GatewayError::Protocol {
            field: "ResultCode".to_string(),
        })?;
        let result_desc = query
            .get("ResultDesc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(CallbackOutcome {
            correlation_id: correlation_id.to_string(),
            provider_txn_id: query
                .get("MerchantRequestID")
                .and_then(Value::as_str)
                .map(str::to_string),
            result_code,
            result_desc,
            receipt_number: None,
            transaction_date: None,
            success: result_code == 0,
        })
    }
}

/// Normalize the nested `Body.stkCallback` webhook shape. Pure so the
/// reconciler can dispatch on shape without a configured gateway.
pub fn parse_stk_callback(body: &Value) -> Result<CallbackOutcome, GatewayError> {
    let callback = body
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .ok_or_else(|| GatewayError::Protocol {
            field: "Body.stkCallback".to_string(),
        })?;

    let correlation_id = callback
        .get("CheckoutRequestID")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol {
            field: "CheckoutRequestID".to_string(),
        })?
        .to_string();
    let result_code = coerce_i64(callback.get("ResultCode")).ok_or(GatewayError::Protocol {
        field: "ResultCode".to_string(),
    })?;
    let result_desc = callback
        .get("ResultDesc")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut outcome = CallbackOutcome {
        correlation_id,
        provider_txn_id: callback
            .get("MerchantRequestID")
            .and_then(Value::as_str)
            .map(str::to_string),
        result_code,
        result_desc,
        receipt_number: None,
        transaction_date: None,
        success: result_code == 0,
    };

    // Metadata items only accompany successful charges.
    if let Some(items) = callback
        .get("CallbackMetadata")
        .and_then(|m| m.get("Item"))
        .and_then(Value::as_array)
    {
        for item in items {
            let name = item.get("Name").and_then(Value::as_str);
            let value = item.get("Value");
            match (name, value) {
                (Some("MpesaReceiptNumber"), Some(v)) => {
                    outcome.receipt_number = v.as_str().map(str::to_string);
                }
                (Some("TransactionDate"), Some(v)) => {
                    outcome.transaction_date = parse_transaction_date(v);
                }
                _ => {}
            }
        }
    }

    Ok(outcome)
}

/// `ResultCode` arrives as a number in callbacks and as a numeric string
/// in query responses.
fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Daraja timestamps are compact numerics like `20240119102115`.
fn parse_transaction_date(value: &Value) -> Option<DateTime<Utc>> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn rejected_from_body(text: &str, http_status: u16) -> GatewayError {
    #[derive(Deserialize)]
    struct DarajaErrorBody {
        #[serde(rename = "errorCode")]
        error_code: Option<String>,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
    }

    let parsed: Option<DarajaErrorBody> = serde_json::from_str(text).ok();
    GatewayError::Rejected {
        code: parsed.as_ref().and_then(|e| e.error_code.clone()),
        message: parsed
            .and_then(|e| e.error_message)
            .unwrap_or_else(|| format!("HTTP {http_status}")),
    }
}

#[derive(Debug, Deserialize)]
struct OauthResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}
