//! Payment record store.
//!
//! The entity is append-only plus finalization: rows are created by the
//! orchestrator once the provider acknowledges a charge, and mutated only
//! through the conditional `finalize`/`cancel` transitions, which refuse
//! to touch a record that already left `pending`. That conditional
//! `WHERE status = 'pending'` is what makes a callback racing a poll safe
//! without row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{PaymentStatus, ProviderName};

/// Persisted payment record.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub phone_number: String,
    pub provider: ProviderName,
    /// Canonical key matching an asynchronous outcome to this record.
    /// Provider-issued for Daraja, self-generated for Impala.
    pub correlation_id: String,
    /// Provider-side transaction id; a separate id space from the
    /// correlation id, kept as a secondary lookup key.
    pub provider_txn_id: Option<String>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub status: PaymentStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub callback_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields the orchestrator supplies when persisting a freshly acknowledged
/// charge. Everything else starts empty/pending.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub phone_number: String,
    pub provider: ProviderName,
    pub correlation_id: String,
    pub provider_txn_id: Option<String>,
}

/// Terminal transition applied by the reconciler or poller.
#[derive(Debug, Clone)]
pub struct PaymentFinalization {
    pub status: PaymentStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub callback_payload: Option<Value>,
}

/// Store seam for payment records. The Postgres implementation below is
/// used in production; tests run against an in-memory fake.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create(&self, payment: NewPayment) -> Result<Payment, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn find_by_provider_txn_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<Payment>, DatabaseError>;

    /// Atomic conditional transition out of `pending`. Returns the updated
    /// record, or `None` when the record was already terminal (someone
    /// else finalized first) so the caller can treat it as a no-op.
    async fn finalize(
        &self,
        correlation_id: &str,
        finalization: PaymentFinalization,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// `pending -> cancelled`, same conditional semantics as `finalize`.
    async fn cancel(
        &self,
        correlation_id: &str,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError>;
}

const COLUMNS: &str = "id, order_id, user_id, amount, phone_number, provider, correlation_id, \
     provider_txn_id, receipt_number, transaction_date, status, result_code, result_desc, \
     callback_payload, created_at, updated_at";

/// Row shape as stored; enums travel as text.
#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    user_id: Uuid,
    amount: Decimal,
    phone_number: String,
    provider: String,
    correlation_id: String,
    provider_txn_id: Option<String>,
    receipt_number: Option<String>,
    transaction_date: Option<DateTime<Utc>>,
    status: String,
    result_code: Option<i64>,
    result_desc: Option<String>,
    callback_payload: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::from_str(&row.status)
            .map_err(|e| DatabaseError::new(DatabaseErrorKind::QueryError { message: e }))?;
        let provider = ProviderName::from_str(&row.provider)
            .map_err(|e| DatabaseError::new(DatabaseErrorKind::QueryError { message: e }))?;

        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            amount: row.amount,
            phone_number: row.phone_number,
            provider,
            correlation_id: row.correlation_id,
            provider_txn_id: row.provider_txn_id,
            receipt_number: row.receipt_number,
            transaction_date: row.transaction_date,
            status,
            result_code: row.result_code,
            result_desc: row.result_desc,
            callback_payload: row.callback_payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed payment store.
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments \
               (order_id, user_id, amount, phone_number, provider, correlation_id, provider_txn_id, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending') \
             RETURNING {COLUMNS}"
        ))
        .bind(&payment.order_id)
        .bind(payment.user_id)
        .bind(payment.amount)
        .bind(&payment.phone_number)
        .bind(payment.provider.to_string())
        .bind(&payment.correlation_id)
        .bind(&payment.provider_txn_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!("SELECT {COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {COLUMNS} FROM payments WHERE correlation_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn find_by_provider_txn_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {COLUMNS} FROM payments WHERE provider_txn_id = $1"
        ))
        .bind(provider_txn_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<Payment>, DatabaseError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {COLUMNS} FROM payments WHERE order_id = $1 ORDER BY created_at DESC"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn finalize(
        &self,
        correlation_id: &str,
        finalization: PaymentFinalization,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments \
             SET status = $1, result_code = $2, result_desc = $3, \
                 receipt_number = COALESCE($4, receipt_number), \
                 transaction_date = COALESCE($5, transaction_date), \
                 callback_payload = COALESCE($6, callback_payload), \
                 updated_at = NOW() \
             WHERE correlation_id = $7 AND status = 'pending' \
             RETURNING {COLUMNS}"
        ))
        .bind(finalization.status.to_string())
        .bind(finalization.result_code)
        .bind(&finalization.result_desc)
        .bind(&finalization.receipt_number)
        .bind(finalization.transaction_date)
        .bind(&finalization.callback_payload)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn cancel(
        &self,
        correlation_id: &str,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments \
             SET status = 'cancelled', result_desc = $1, updated_at = NOW() \
             WHERE correlation_id = $2 AND status = 'pending' \
             RETURNING {COLUMNS}"
        ))
        .bind(reason)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }
}
