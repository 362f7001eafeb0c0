//! Duka order/payment backend.
//!
//! The core of this crate is the payment orchestration subsystem under
//! [`payments`]: a provider-agnostic mobile-money gateway abstraction with
//! two implementations (direct Daraja STK push and the Impala aggregator),
//! webhook reconciliation with polling fallback, and a persisted payment
//! record kept consistent with its linked order.

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod payments;
