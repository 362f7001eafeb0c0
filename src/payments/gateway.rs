//! Provider gateway abstraction.
//!
//! Both providers expose the same three operations; everything above this
//! trait is provider-agnostic.

use async_trait::async_trait;
use serde_json::Value;

use crate::payments::types::{CallbackOutcome, ChargeAck, ChargeRequest, ProviderName};

/// Failures surfaced by a gateway, split by what the caller can do about
/// them. `Clone` so a single-flight token fetch can hand one error to
/// every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Timeout or connection failure before a response was received.
    #[error("provider unreachable: {0}")]
    Network(String),

    /// The provider answered with a structured error.
    #[error("provider rejected request: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },

    /// A success response was missing a field we cannot proceed without.
    #[error("malformed provider response: missing {field}")]
    Protocol { field: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Network(e.to_string())
    }
}

/// Uniform surface over the mobile-money providers.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Push a charge prompt to the payer's handset. A successful return
    /// means the provider accepted the request, not that the payer paid.
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAck, GatewayError>;

    /// Normalize this provider's webhook body.
    fn parse_callback(&self, body: &Value) -> Result<CallbackOutcome, GatewayError>;

    /// Synchronously ask the provider for the current state of a charge.
    /// Fallback for when the webhook is delayed or lost.
    async fn query_status(&self, correlation_id: &str) -> Result<CallbackOutcome, GatewayError>;
}
