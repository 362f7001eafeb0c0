//! On-demand status polling.
//!
//! Fallback reconciliation for when a webhook is delayed or lost. Polling
//! is best-effort enrichment: a provider query failure degrades to the
//! last known state instead of failing the request.

use std::sync::Arc;
use tracing::warn;

use crate::auth::{ensure_owner, AuthUser};
use crate::database::payment_repository::{Payment, PaymentStore};
use crate::error::{AppError, AppResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::reconciler::CallbackReconciler;
use crate::payments::types::PaymentStatus;

pub struct StatusPoller {
    payments: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<CallbackReconciler>,
}

impl StatusPoller {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<CallbackReconciler>,
    ) -> Self {
        Self {
            payments,
            gateway,
            reconciler,
        }
    }

    pub async fn check_status(
        &self,
        correlation_id: &str,
        caller: &AuthUser,
    ) -> AppResult<Payment> {
        let payment = self
            .payments
            .find_by_correlation_id(correlation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

        ensure_owner(
            caller,
            payment.user_id,
            "You can only check your own payment status",
        )?;

        // Terminal records are returned as stored; no provider call.
        if payment.status != PaymentStatus::Pending {
            return Ok(payment);
        }

        match self.gateway.query_status(correlation_id).await {
            Ok(outcome) if outcome.success => {
                if let Some(updated) = self.reconciler.apply_outcome(&payment, &outcome).await? {
                    return Ok(updated);
                }
                // A callback finalized it between our read and the update;
                // return the fresher record.
                let refreshed = self
                    .payments
                    .find_by_correlation_id(correlation_id)
                    .await?
                    .unwrap_or(payment);
                Ok(refreshed)
            }
            // Non-success query results are ambiguous while the prompt is
            // still open on the payer's handset; keep the record pending
            // and let the callback settle it.
            Ok(_) => Ok(payment),
            Err(e) => {
                warn!(correlation_id, "status query failed: {e}");
                Ok(payment)
            }
        }
    }
}
