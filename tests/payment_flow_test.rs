//! End-to-end orchestration tests over in-memory stores and a mock
//! gateway: initiate, callback reconciliation, polling fallback, cancel,
//! and the idempotency guarantees around all of them.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use duka_backend::auth::{AuthUser, Role};
use duka_backend::database::error::DatabaseError;
use duka_backend::database::order_store::{Order, OrderStore};
use duka_backend::database::payment_repository::{
    NewPayment, Payment, PaymentFinalization, PaymentStore,
};
use duka_backend::error::AppError;
use duka_backend::payments::gateway::{GatewayError, PaymentGateway};
use duka_backend::payments::orchestrator::PaymentOrchestrator;
use duka_backend::payments::poller::StatusPoller;
use duka_backend::payments::providers::daraja;
use duka_backend::payments::reconciler::CallbackReconciler;
use duka_backend::payments::types::{
    whole_units, CallbackOutcome, ChargeAck, ChargeRequest, PaymentStatus, ProviderName,
};

// ---------------------------------------------------------------------
// In-memory fakes
// ---------------------------------------------------------------------

#[derive(Default)]
struct InMemoryPaymentStore {
    rows: Mutex<Vec<Payment>>,
}

impl InMemoryPaymentStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn get(&self, correlation_id: &str) -> Option<Payment> {
        self.rows
            .lock()
            .await
            .iter()
            .find(|p| p.correlation_id == correlation_id)
            .cloned()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, new: NewPayment) -> Result<Payment, DatabaseError> {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            user_id: new.user_id,
            amount: new.amount,
            phone_number: new.phone_number,
            provider: new.provider,
            correlation_id: new.correlation_id,
            provider_txn_id: new.provider_txn_id,
            receipt_number: None,
            transaction_date: None,
            status: PaymentStatus::Pending,
            result_code: None,
            result_desc: None,
            callback_payload: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().await.push(payment.clone());
        Ok(payment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.rows.lock().await.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.get(correlation_id).await)
    }

    async fn find_by_provider_txn_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|p| p.provider_txn_id.as_deref() == Some(provider_txn_id))
            .cloned())
    }

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<Payment>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn finalize(
        &self,
        correlation_id: &str,
        finalization: PaymentFinalization,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().await;
        let Some(payment) = rows
            .iter_mut()
            .find(|p| p.correlation_id == correlation_id && p.status == PaymentStatus::Pending)
        else {
            return Ok(None);
        };
        payment.status = finalization.status;
        payment.result_code = finalization.result_code;
        payment.result_desc = finalization.result_desc;
        if finalization.receipt_number.is_some() {
            payment.receipt_number = finalization.receipt_number;
        }
        if finalization.transaction_date.is_some() {
            payment.transaction_date = finalization.transaction_date;
        }
        if finalization.callback_payload.is_some() {
            payment.callback_payload = finalization.callback_payload;
        }
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn cancel(
        &self,
        correlation_id: &str,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().await;
        let Some(payment) = rows
            .iter_mut()
            .find(|p| p.correlation_id == correlation_id && p.status == PaymentStatus::Pending)
        else {
            return Ok(None);
        };
        payment.status = PaymentStatus::Cancelled;
        payment.result_desc = Some(reason.to_string());
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }
}

struct InMemoryOrderStore {
    orders: Mutex<Vec<Order>>,
    confirmations: AtomicUsize,
}

impl InMemoryOrderStore {
    fn with_order(reference: &str, customer_id: Uuid, total: Decimal) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            orders: Mutex::new(vec![Order {
                id: Uuid::new_v4(),
                reference: reference.to_string(),
                customer_id,
                total,
                status: "placed".to_string(),
                payment_summary: None,
                created_at: now,
                updated_at: now,
            }]),
            confirmations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_by_reference(&self, reference: &str) -> Result<Option<Order>, DatabaseError> {
        Ok(self
            .orders
            .lock()
            .await
            .iter()
            .find(|o| o.reference == reference)
            .cloned())
    }

    async fn mark_confirmed(&self, order_id: Uuid, summary: Value) -> Result<(), DatabaseError> {
        let mut orders = self.orders.lock().await;
        if let Some(order) = orders.iter_mut().find(|o| o.id == order_id) {
            order.status = "confirmed".to_string();
            order.payment_summary = Some(summary);
            self.confirmations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Gateway double that behaves like the Daraja provider from the
/// orchestrator's point of view: issues correlation ids and records what
/// was transmitted.
struct MockGateway {
    name: ProviderName,
    initiate_calls: AtomicUsize,
    query_calls: AtomicUsize,
    transmitted_amounts: Mutex<Vec<u64>>,
    query_result: Mutex<Option<CallbackOutcome>>,
    fail_initiate: bool,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            name: ProviderName::Daraja,
            initiate_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            transmitted_amounts: Mutex::new(Vec::new()),
            query_result: Mutex::new(None),
            fail_initiate: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            name: ProviderName::Daraja,
            initiate_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            transmitted_amounts: Mutex::new(Vec::new()),
            query_result: Mutex::new(None),
            fail_initiate: true,
        })
    }

    async fn set_query_result(&self, outcome: CallbackOutcome) {
        *self.query_result.lock().await = Some(outcome);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAck, GatewayError> {
        let call = self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initiate {
            return Err(GatewayError::Network("connect timeout".to_string()));
        }
        let amount = whole_units(request.amount).ok_or_else(|| GatewayError::Rejected {
            code: None,
            message: "bad amount".to_string(),
        })?;
        self.transmitted_amounts.lock().await.push(amount);
        Ok(ChargeAck {
            correlation_id: format!("ws_CO_{call}"),
            provider_txn_id: Some(format!("29115-{call}")),
            response_code: Some("0".to_string()),
            customer_message: Some("Check your phone".to_string()),
        })
    }

    fn parse_callback(&self, body: &Value) -> Result<CallbackOutcome, GatewayError> {
        daraja::parse_stk_callback(body)
    }

    async fn query_status(&self, correlation_id: &str) -> Result<CallbackOutcome, GatewayError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        match self.query_result.lock().await.clone() {
            Some(outcome) => Ok(outcome),
            None => Ok(CallbackOutcome {
                correlation_id: correlation_id.to_string(),
                provider_txn_id: None,
                result_code: 1,
                result_desc: "still pending".to_string(),
                receipt_number: None,
                transaction_date: None,
                success: false,
            }),
        }
    }
}

struct Harness {
    payments: Arc<InMemoryPaymentStore>,
    orders: Arc<InMemoryOrderStore>,
    gateway: Arc<MockGateway>,
    orchestrator: PaymentOrchestrator,
    reconciler: Arc<CallbackReconciler>,
    poller: StatusPoller,
    customer: AuthUser,
}

fn harness_with(gateway: Arc<MockGateway>, order_total: Decimal) -> Harness {
    let customer = AuthUser {
        id: Uuid::new_v4(),
        role: Role::User,
    };
    let payments = InMemoryPaymentStore::new();
    let orders = InMemoryOrderStore::with_order("ORD-1", customer.id, order_total);

    let reconciler = Arc::new(CallbackReconciler::new(
        payments.clone() as Arc<dyn PaymentStore>,
        orders.clone() as Arc<dyn OrderStore>,
    ));
    let orchestrator = PaymentOrchestrator::new(
        payments.clone() as Arc<dyn PaymentStore>,
        orders.clone() as Arc<dyn OrderStore>,
        gateway.clone() as Arc<dyn PaymentGateway>,
    );
    let poller = StatusPoller::new(
        payments.clone() as Arc<dyn PaymentStore>,
        gateway.clone() as Arc<dyn PaymentGateway>,
        reconciler.clone(),
    );

    Harness {
        payments,
        orders,
        gateway,
        orchestrator,
        reconciler,
        poller,
        customer,
    }
}

fn harness(order_total: Decimal) -> Harness {
    harness_with(MockGateway::new(), order_total)
}

fn stk_success_callback(correlation_id: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-0",
                "CheckoutRequestID": correlation_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 500.0 },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "TransactionDate", "Value": 20240119102115_u64 },
                        { "Name": "PhoneNumber", "Value": 254722000000_u64 }
                    ]
                }
            }
        }
    })
}

// ---------------------------------------------------------------------
// Initiate
// ---------------------------------------------------------------------

#[tokio::test]
async fn initiate_creates_pending_payment_with_correlation_id() {
    let h = harness(dec!(500));

    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();

    assert_eq!(receipt.provider, ProviderName::Daraja);
    assert_eq!(receipt.payment.status, PaymentStatus::Pending);
    assert_eq!(receipt.payment.correlation_id, receipt.response.correlation_id);
    assert!(!receipt.response.correlation_id.is_empty());
}

#[tokio::test]
async fn fractional_amount_is_transmitted_rounded_up() {
    let h = harness(dec!(500.5));

    h.orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();

    let transmitted = h.gateway.transmitted_amounts.lock().await.clone();
    assert_eq!(transmitted, vec![501]);
}

#[tokio::test]
async fn missing_order_is_not_found() {
    let h = harness(dec!(500));
    let result = h
        .orchestrator
        .initiate_payment("ORD-404", "0722000000", &h.customer)
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn non_owner_cannot_initiate() {
    let h = harness(dec!(500));
    let stranger = AuthUser {
        id: Uuid::new_v4(),
        role: Role::User,
    };
    let result = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &stranger)
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
    assert_eq!(h.gateway.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn already_paid_order_conflicts_without_calling_provider() {
    let h = harness(dec!(500));

    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();
    h.reconciler
        .handle_callback(&stk_success_callback(&correlation_id))
        .await;
    assert_eq!(h.gateway.initiate_calls.load(Ordering::SeqCst), 1);

    let result = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await;

    match result {
        Err(AppError::Conflict { payment, .. }) => {
            let payment = payment.expect("conflict should carry the completed payment");
            assert_eq!(payment.status, PaymentStatus::Completed);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // The provider was not called a second time.
    assert_eq!(h.gateway.initiate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_amount_order_is_rejected_before_provider() {
    let h = harness(dec!(0));
    let result = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert_eq!(h.gateway.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gateway_failure_leaves_no_payment_row() {
    let h = harness_with(MockGateway::failing(), dec!(500));

    let result = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await;

    assert!(matches!(result, Err(AppError::Gateway(_))));
    assert!(h
        .payments
        .find_by_order("ORD-1")
        .await
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------
// Callback reconciliation
// ---------------------------------------------------------------------

#[tokio::test]
async fn success_callback_completes_payment_and_confirms_order() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();

    let ack = h
        .reconciler
        .handle_callback(&stk_success_callback(&correlation_id))
        .await;
    assert_eq!(ack.result_code, 0);

    let payment = h.payments.get(&correlation_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.receipt_number.as_deref(), Some("NLJ7RT61SV"));
    assert!(payment.transaction_date.is_some());
    assert!(payment.callback_payload.is_some());

    let order = h.orders.find_by_reference("ORD-1").await.unwrap().unwrap();
    assert_eq!(order.status, "confirmed");
    let summary = order.payment_summary.unwrap();
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["receipt"], "NLJ7RT61SV");
}

#[tokio::test]
async fn duplicate_callback_applies_exactly_one_transition_and_order_update() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();
    let body = stk_success_callback(&correlation_id);

    let first = h.reconciler.handle_callback(&body).await;
    let second = h.reconciler.handle_callback(&body).await;

    // Both deliveries are acknowledged identically.
    assert_eq!(first.result_code, 0);
    assert_eq!(second.result_code, 0);
    // But the order was confirmed exactly once.
    assert_eq!(h.orders.confirmations.load(Ordering::SeqCst), 1);
    let payment = h.payments.get(&correlation_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn failure_callback_marks_payment_failed_without_touching_order() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();

    let body = json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-0",
                "CheckoutRequestID": correlation_id,
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }
        }
    });
    h.reconciler.handle_callback(&body).await;

    let payment = h.payments.get(&correlation_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.result_desc.as_deref(),
        Some("Request cancelled by user")
    );
    assert_eq!(h.orders.confirmations.load(Ordering::SeqCst), 0);
    let order = h.orders.find_by_reference("ORD-1").await.unwrap().unwrap();
    assert_eq!(order.status, "placed");
}

#[tokio::test]
async fn callback_for_unknown_payment_is_acknowledged() {
    let h = harness(dec!(500));
    let ack = h
        .reconciler
        .handle_callback(&stk_success_callback("ws_CO_never_seen"))
        .await;
    assert_eq!(ack.result_code, 0);
    assert_eq!(ack.status, "OK");
}

#[tokio::test]
async fn unrecognized_callback_shape_gets_failure_ack() {
    let h = harness(dec!(500));
    let ack = h
        .reconciler
        .handle_callback(&json!({ "unexpected": true }))
        .await;
    assert_eq!(ack.result_code, 1);
    assert_eq!(ack.status, "ERROR");
}

#[tokio::test]
async fn impala_callback_matches_by_provider_txn_id() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let txn_id = receipt.payment.provider_txn_id.clone().unwrap();

    // Correlation id the store has never seen; the provider-side
    // transaction id is the fallback key.
    let body = json!({
        "externalId": "some-other-space-9999",
        "transactionId": txn_id,
        "status": "SUCCESS",
        "receiptNumber": "AGG-REC-1"
    });
    h.reconciler.handle_callback(&body).await;

    let payment = h
        .payments
        .get(&receipt.payment.correlation_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
}

// ---------------------------------------------------------------------
// Status polling
// ---------------------------------------------------------------------

#[tokio::test]
async fn poll_finalizes_pending_payment_when_provider_reports_success() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();

    h.gateway
        .set_query_result(CallbackOutcome {
            correlation_id: correlation_id.clone(),
            provider_txn_id: None,
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            receipt_number: Some("NLJ7RT61SV".to_string()),
            transaction_date: Some(Utc::now()),
            success: true,
        })
        .await;

    let payment = h
        .poller
        .check_status(&correlation_id, &h.customer)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(h.orders.confirmations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn poll_on_terminal_payment_skips_provider_query() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();
    h.reconciler
        .handle_callback(&stk_success_callback(&correlation_id))
        .await;

    let payment = h
        .poller
        .check_status(&correlation_id, &h.customer)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(h.gateway.query_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn poll_degrades_to_stored_state_when_query_is_inconclusive() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();

    // Default mock query result is a non-success outcome.
    let payment = h
        .poller
        .check_status(&correlation_id, &h.customer)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(h.gateway.query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn poll_is_ownership_checked() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let stranger = AuthUser {
        id: Uuid::new_v4(),
        role: Role::User,
    };

    let result = h
        .poller
        .check_status(&receipt.payment.correlation_id, &stranger)
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
}

// ---------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------

#[tokio::test]
async fn pending_payment_can_be_cancelled() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();

    let cancelled = h
        .orchestrator
        .cancel_payment(receipt.payment.id, &h.customer)
        .await
        .unwrap();

    assert_eq!(cancelled.status, PaymentStatus::Cancelled);
    assert_eq!(cancelled.result_desc.as_deref(), Some("Cancelled by user"));
}

#[tokio::test]
async fn completed_payment_cannot_be_cancelled() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();
    h.reconciler
        .handle_callback(&stk_success_callback(&correlation_id))
        .await;

    let result = h
        .orchestrator
        .cancel_payment(receipt.payment.id, &h.customer)
        .await;

    match result {
        Err(AppError::Conflict { message, .. }) => {
            assert_eq!(message, "Cannot cancel payment with status: completed");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // Record unchanged.
    let payment = h.payments.get(&correlation_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.receipt_number.as_deref(), Some("NLJ7RT61SV"));
}

#[tokio::test]
async fn cancelled_payment_ignores_late_callback() {
    let h = harness(dec!(500));
    let receipt = h
        .orchestrator
        .initiate_payment("ORD-1", "0722000000", &h.customer)
        .await
        .unwrap();
    let correlation_id = receipt.payment.correlation_id.clone();
    h.orchestrator
        .cancel_payment(receipt.payment.id, &h.customer)
        .await
        .unwrap();

    let ack = h
        .reconciler
        .handle_callback(&stk_success_callback(&correlation_id))
        .await;

    assert_eq!(ack.result_code, 0);
    let payment = h.payments.get(&correlation_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert_eq!(h.orders.confirmations.load(Ordering::SeqCst), 0);
}
