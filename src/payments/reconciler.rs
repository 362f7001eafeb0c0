//! Webhook reconciliation.
//!
//! The webhook endpoint is public and providers retry aggressively, so
//! this path never surfaces an error to the caller: every internal outcome
//! collapses into an acknowledgement the provider recognizes. Duplicate
//! deliveries and callback-vs-poll races are absorbed by the store's
//! conditional finalization; the second writer sees zero rows updated and
//! skips the order side effect.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::error::DatabaseError;
use crate::database::order_store::OrderStore;
use crate::database::payment_repository::{Payment, PaymentFinalization, PaymentStore};
use crate::payments::gateway::GatewayError;
use crate::payments::providers::{daraja, impala};
use crate::payments::types::{CallbackOutcome, PaymentStatus};

/// Which provider produced a callback body. Detection is structural but
/// exhaustive: a body matching neither shape is a parse failure, never
/// silently treated as one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackShape {
    Daraja,
    Impala,
}

pub fn detect_shape(body: &Value) -> Result<CallbackShape, GatewayError> {
    if body
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .is_some()
    {
        return Ok(CallbackShape::Daraja);
    }
    if body.get("status").is_some() || body.get("resultCode").is_some() {
        return Ok(CallbackShape::Impala);
    }
    Err(GatewayError::Protocol {
        field: "callback shape".to_string(),
    })
}

/// Acknowledgement both providers accept: Daraja reads `ResultCode`/
/// `ResultDesc`, the aggregator reads `status`.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    pub status: String,
}

impl CallbackAck {
    pub fn ok() -> Self {
        Self {
            result_code: 0,
            result_desc: "Success".to_string(),
            status: "OK".to_string(),
        }
    }

    pub fn failure() -> Self {
        Self {
            result_code: 1,
            result_desc: "Failed to process callback".to_string(),
            status: "ERROR".to_string(),
        }
    }
}

pub struct CallbackReconciler {
    payments: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderStore>,
}

impl CallbackReconciler {
    pub fn new(payments: Arc<dyn PaymentStore>, orders: Arc<dyn OrderStore>) -> Self {
        Self { payments, orders }
    }

    /// Process a raw webhook body. Infallible by design; the returned ack
    /// is always safe to hand to the provider.
    pub async fn handle_callback(&self, body: &Value) -> CallbackAck {
        let outcome = match detect_shape(body).and_then(|shape| match shape {
            CallbackShape::Daraja => daraja::parse_stk_callback(body),
            CallbackShape::Impala => impala::parse_flat_callback(body),
        }) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("unparseable payment callback: {e}");
                return CallbackAck::failure();
            }
        };

        match self.reconcile(&outcome).await {
            Ok(()) => CallbackAck::ok(),
            Err(e) => {
                // Internal trouble is ours, not the provider's; retries
                // would not help, so acknowledge and rely on the poller.
                error!(
                    correlation_id = %outcome.correlation_id,
                    "callback reconciliation failed: {e}"
                );
                CallbackAck::ok()
            }
        }
    }

    async fn reconcile(&self, outcome: &CallbackOutcome) -> Result<(), DatabaseError> {
        // The two providers' id spaces are distinct; the provider-side
        // transaction id is the fallback key.
        let mut payment = self
            .payments
            .find_by_correlation_id(&outcome.correlation_id)
            .await?;
        if payment.is_none() {
            if let Some(txn_id) = &outcome.provider_txn_id {
                payment = self.payments.find_by_provider_txn_id(txn_id).await?;
            }
        }

        let Some(payment) = payment else {
            // The initiate transaction may not have committed yet, or the
            // callback is plain bogus. Either way acknowledging is the
            // only move that stops a retry storm.
            warn!(
                correlation_id = %outcome.correlation_id,
                provider_txn_id = ?outcome.provider_txn_id,
                "callback for unknown payment, acknowledging anyway"
            );
            return Ok(());
        };

        match self.apply_outcome(&payment, outcome).await? {
            Some(updated) => {
                info!(
                    correlation_id = %updated.correlation_id,
                    status = %updated.status,
                    "payment finalized from callback"
                );
            }
            None => {
                info!(
                    correlation_id = %payment.correlation_id,
                    status = %payment.status,
                    "duplicate or raced callback ignored"
                );
            }
        }
        Ok(())
    }

    /// Apply a normalized outcome to a payment. Shared with the status
    /// poller so both paths finalize identically. Returns `None` when the
    /// record was already terminal (idempotent no-op, no order update).
    pub async fn apply_outcome(
        &self,
        payment: &Payment,
        outcome: &CallbackOutcome,
    ) -> Result<Option<Payment>, DatabaseError> {
        if payment.status.is_terminal() {
            return Ok(None);
        }

        let status = if outcome.success {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };

        let finalized = self
            .payments
            .finalize(
                &payment.correlation_id,
                PaymentFinalization {
                    status,
                    result_code: Some(outcome.result_code),
                    result_desc: Some(outcome.result_desc.clone()),
                    receipt_number: outcome.receipt_number.clone(),
                    transaction_date: outcome.transaction_date,
                    callback_payload: serde_json::to_value(outcome).ok(),
                },
            )
            .await?;

        let Some(finalized) = finalized else {
            // Another unit of work finalized first; the order update
            // already happened exactly once over there.
            return Ok(None);
        };

        if finalized.status == PaymentStatus::Completed {
            self.confirm_order(&finalized, outcome).await?;
        }

        Ok(Some(finalized))
    }

    async fn confirm_order(
        &self,
        payment: &Payment,
        outcome: &CallbackOutcome,
    ) -> Result<(), DatabaseError> {
        match self.orders.find_by_reference(&payment.order_id).await? {
            Some(order) => {
                self.orders
                    .mark_confirmed(
                        order.id,
                        json!({
                            "status": "completed",
                            "receipt": outcome.receipt_number,
                            "completed_at": Utc::now(),
                        }),
                    )
                    .await?;
                info!(order_ref = %payment.order_id, "order confirmed");
            }
            None => {
                warn!(
                    order_ref = %payment.order_id,
                    "completed payment references a missing order"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_wrapper_is_daraja() {
        let body = json!({ "Body": { "stkCallback": { "ResultCode": 0 } } });
        assert_eq!(detect_shape(&body), Ok(CallbackShape::Daraja));
    }

    #[test]
    fn flat_status_is_impala() {
        let body = json!({ "externalId": "ORD-1-1", "status": "SUCCESS" });
        assert_eq!(detect_shape(&body), Ok(CallbackShape::Impala));

        let body = json!({ "externalId": "ORD-1-1", "resultCode": 1 });
        assert_eq!(detect_shape(&body), Ok(CallbackShape::Impala));
    }

    #[test]
    fn unrecognized_shape_fails_loudly() {
        let body = json!({ "hello": "world" });
        assert!(detect_shape(&body).is_err());
    }

    #[test]
    fn ack_shapes() {
        let ok = serde_json::to_value(CallbackAck::ok()).unwrap();
        assert_eq!(ok["ResultCode"], 0);
        assert_eq!(ok["ResultDesc"], "Success");
        assert_eq!(ok["status"], "OK");

        let failure = serde_json::to_value(CallbackAck::failure()).unwrap();
        assert_eq!(failure["ResultCode"], 1);
        assert_eq!(failure["status"], "ERROR");
    }
}
