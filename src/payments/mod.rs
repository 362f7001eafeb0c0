//! Payment orchestration subsystem.
//!
//! Layered leaves-first: [`phone`] and [`token_cache`] feed the
//! [`providers`], which implement the [`gateway::PaymentGateway`]
//! abstraction; [`orchestrator`], [`reconciler`] and [`poller`] sit on top
//! of the gateway and the payment/order stores.

pub mod gateway;
pub mod orchestrator;
pub mod phone;
pub mod poller;
pub mod providers;
pub mod reconciler;
pub mod token_cache;
pub mod types;
