//! Order collaborator.
//!
//! Orders are owned by the rest of the backend; the payment subsystem only
//! reads amount/ownership and, on a successful charge, flips the order to
//! confirmed with a payment summary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::database::error::DatabaseError;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    /// Human-facing order reference, e.g. `ORD-1`. Payments link to this.
    pub reference: String,
    pub customer_id: Uuid,
    pub total: Decimal,
    pub status: String,
    pub payment_summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_reference(&self, reference: &str) -> Result<Option<Order>, DatabaseError>;

    /// Confirm the order and attach a payment summary
    /// `{status, receipt, completed_at}`.
    async fn mark_confirmed(&self, order_id: Uuid, summary: Value) -> Result<(), DatabaseError>;
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_by_reference(&self, reference: &str) -> Result<Option<Order>, DatabaseError> {
        sqlx::query_as::<_, Order>(
            "SELECT id, reference, customer_id, total, status, payment_summary, created_at, updated_at \
             FROM orders WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_confirmed(&self, order_id: Uuid, summary: Value) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE orders SET status = 'confirmed', payment_summary = $1, updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(summary)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
