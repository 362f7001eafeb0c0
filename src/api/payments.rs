//! Payment HTTP handlers.
//!
//! The callback route is public (providers cannot authenticate against
//! us); everything else expects the auth middleware to have placed an
//! [`AuthUser`] in the request extensions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{ensure_owner, AuthUser};
use crate::error::{AppError, AppResult};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub order_id: Option<String>,
    pub phone_number: Option<String>,
}

pub async fn initiate(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(request): Json<InitiateRequest>,
) -> AppResult<Json<Value>> {
    let (Some(order_id), Some(phone_number)) = (request.order_id, request.phone_number) else {
        return Err(AppError::Validation(
            "Order ID and phone number are required".to_string(),
        ));
    };

    let receipt = state
        .orchestrator
        .initiate_payment(&order_id, &phone_number, &caller)
        .await?;

    Ok(Json(json!({
        "message": receipt.message,
        "provider": receipt.provider,
        "payment": receipt.payment,
        "response": receipt.response,
    })))
}

/// Public webhook. Always answers 200 with a provider-recognized ack; the
/// reconciler downgrades every internal problem to a logged diagnostic.
pub async fn callback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let ack = state.reconciler.handle_callback(&body).await;
    match serde_json::to_value(&ack) {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "ERROR" })),
        ),
    }
}

pub async fn check_status(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(correlation_id): Path<String>,
) -> AppResult<Json<Value>> {
    let payment = state.poller.check_status(&correlation_id, &caller).await?;
    Ok(Json(json!({ "payment": payment })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let payment = state.orchestrator.cancel_payment(id, &caller).await?;
    Ok(Json(json!({
        "message": "Payment cancelled successfully",
        "payment": payment,
    })))
}

pub async fn order_payments(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(order_id): Path<String>,
) -> AppResult<Json<Value>> {
    let order = state
        .orders
        .find_by_reference(&order_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

    ensure_owner(
        &caller,
        order.customer_id,
        "You can only view payments for your own orders",
    )?;

    let payments = state.payments.find_by_order(&order_id).await?;
    Ok(Json(json!({
        "count": payments.len(),
        "payments": payments,
    })))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let payment = state
        .payments
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

    ensure_owner(
        &caller,
        payment.user_id,
        "You can only view your own payments",
    )?;

    Ok(Json(json!({ "payment": payment })))
}
