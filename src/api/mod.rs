pub mod health;
pub mod payments;

use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;

use crate::database::order_store::OrderStore;
use crate::database::payment_repository::PaymentStore;
use crate::payments::orchestrator::PaymentOrchestrator;
use crate::payments::poller::StatusPoller;
use crate::payments::reconciler::CallbackReconciler;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub reconciler: Arc<CallbackReconciler>,
    pub poller: Arc<StatusPoller>,
    pub payments: Arc<dyn PaymentStore>,
    pub orders: Arc<dyn OrderStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/payments/initiate", post(payments::initiate))
        .route("/api/payments/callback", post(payments::callback))
        .route(
            "/api/payments/status/:correlation_id",
            get(payments::check_status),
        )
        .route("/api/payments/cancel/:id", patch(payments::cancel))
        .route("/api/payments/order/:order_id", get(payments::order_payments))
        .route("/api/payments/:id", get(payments::get_payment))
        .with_state(state)
}
