//! Initiate and cancel flows.
//!
//! The orchestrator owns the validation that gates a provider call:
//! resolving the order, checking ownership, guarding against a second
//! charge on an already-paid order, and deriving the amount from the
//! order's persisted total. A payment row exists only after the provider
//! acknowledged the charge; a gateway failure leaves no trace.

use std::sync::Arc;
use tracing::info;

use crate::auth::{ensure_owner, AuthUser};
use crate::database::order_store::OrderStore;
use crate::database::payment_repository::{NewPayment, Payment, PaymentStore};
use crate::error::{AppError, AppResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{ChargeAck, ChargeRequest, PaymentStatus, ProviderName};
use rust_decimal::Decimal;
use serde::Serialize;

/// Composed response for a successful initiate call.
#[derive(Debug, Serialize)]
pub struct InitiateReceipt {
    pub message: String,
    pub provider: ProviderName,
    pub payment: Payment,
    pub response: ChargeAck,
}

pub struct PaymentOrchestrator {
    payments: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentOrchestrator {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            payments,
            orders,
            gateway,
        }
    }

    pub async fn initiate_payment(
        &self,
        order_ref: &str,
        phone: &str,
        caller: &AuthUser,
    ) -> AppResult<InitiateReceipt> {
        let order = self
            .orders
            .find_by_reference(order_ref)
            .await?
            .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

        ensure_owner(
            caller,
            order.customer_id,
            "You can only pay for your own orders",
        )?;

        // One completed payment per order; the provider is never called
        // for an order that is already paid.
        let existing = self.payments.find_by_order(order_ref).await?;
        if let Some(completed) = existing
            .into_iter()
            .find(|p| p.status == PaymentStatus::Completed)
        {
            return Err(AppError::Conflict {
                message: "This order has already been paid".to_string(),
                payment: Some(Box::new(completed)),
            });
        }

        let amount = order.total;
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation("Invalid order amount".to_string()));
        }

        let ack = self
            .gateway
            .initiate_charge(ChargeRequest {
                phone: phone.to_string(),
                amount,
                order_ref: order_ref.to_string(),
                description: format!("Payment for order {order_ref}"),
            })
            .await?;

        // Only now does a record exist; its correlation id is whatever the
        // gateway handed back (provider-issued or self-generated).
        let payment = self
            .payments
            .create(NewPayment {
                order_id: order_ref.to_string(),
                user_id: order.customer_id,
                amount,
                phone_number: phone.to_string(),
                provider: self.gateway.name(),
                correlation_id: ack.correlation_id.clone(),
                provider_txn_id: ack.provider_txn_id.clone(),
            })
            .await?;

        info!(
            order_ref,
            correlation_id = %payment.correlation_id,
            provider = %payment.provider,
            "payment initiated"
        );

        Ok(InitiateReceipt {
            message: "Payment initiated successfully. Please check your phone to complete payment."
                .to_string(),
            provider: self.gateway.name(),
            payment,
            response: ack,
        })
    }

    /// Explicit user cancel; only valid while the record is still pending.
    pub async fn cancel_payment(&self, id: uuid::Uuid, caller: &AuthUser) -> AppResult<Payment> {
        let payment = self
            .payments
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

        ensure_owner(
            caller,
            payment.user_id,
            "You can only cancel your own payments",
        )?;

        if payment.status != PaymentStatus::Pending {
            return Err(AppError::conflict(format!(
                "Cannot cancel payment with status: {}",
                payment.status
            )));
        }

        match self
            .payments
            .cancel(&payment.correlation_id, "Cancelled by user")
            .await?
        {
            Some(cancelled) => {
                info!(correlation_id = %cancelled.correlation_id, "payment cancelled by user");
                Ok(cancelled)
            }
            // Lost the race against a finalization; report the status the
            // record ended up with.
            None => {
                let current = self
                    .payments
                    .find_by_id(id)
                    .await?
                    .map(|p| p.status.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(AppError::conflict(format!(
                    "Cannot cancel payment with status: {current}"
                )))
            }
        }
    }
}
