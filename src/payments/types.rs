//! Normalized gateway request/response types shared by both providers.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which gateway implementation handles a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    /// Direct Safaricom Daraja STK push.
    Daraja,
    /// Impala Pay mobile-money aggregator.
    Impala,
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderName::Daraja => write!(f, "daraja"),
            ProviderName::Impala => write!(f, "impala"),
        }
    }
}

impl FromStr for ProviderName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daraja" | "mpesa" => Ok(ProviderName::Daraja),
            "impala" | "impala_pay" => Ok(ProviderName::Impala),
            other => Err(format!("unknown payment provider: {other}")),
        }
    }
}

/// Payment record lifecycle. Terminal states absorb: once a record leaves
/// `Pending` it is never re-transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Completed => write!(f, "completed"),
            PaymentStatus::Failed => write!(f, "failed"),
            PaymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// Outbound charge request, already validated by the orchestrator.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub phone: String,
    pub amount: Decimal,
    pub order_ref: String,
    pub description: String,
}

/// Provider acknowledgement of an accepted charge request. The payer has
/// not paid yet; the outcome arrives later via callback or polling.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeAck {
    /// Key used to match the asynchronous outcome to the payment record.
    pub correlation_id: String,
    /// Provider-side transaction id, when issued synchronously.
    pub provider_txn_id: Option<String>,
    pub response_code: Option<String>,
    pub customer_message: Option<String>,
}

/// Normalized outcome from a webhook callback or a status query,
/// regardless of which provider produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackOutcome {
    pub correlation_id: String,
    pub provider_txn_id: Option<String>,
    pub result_code: i64,
    pub result_desc: String,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub success: bool,
}

/// Mobile-money channels only accept whole currency units; fractions are
/// rounded up so the payer covers the full order total.
pub fn whole_units(amount: Decimal) -> Option<u64> {
    amount.ceil().to_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fractional_amounts_round_up() {
        assert_eq!(whole_units(dec!(500.5)), Some(501));
        assert_eq!(whole_units(dec!(500.01)), Some(501));
        assert_eq!(whole_units(dec!(500)), Some(500));
    }

    #[test]
    fn negative_amounts_do_not_transmit() {
        assert_eq!(whole_units(dec!(-1.5)), None);
    }

    #[test]
    fn provider_name_round_trips() {
        assert_eq!("daraja".parse::<ProviderName>(), Ok(ProviderName::Daraja));
        assert_eq!("impala".parse::<ProviderName>(), Ok(ProviderName::Impala));
        assert!("paypal".parse::<ProviderName>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Cancelled.is_terminal());
    }
}
