//! Gateway implementations.
//!
//! `daraja` talks to Safaricom's Daraja API directly with per-request
//! signed credentials; `impala` goes through the Impala Pay aggregator
//! with a cached bearer token.

pub mod daraja;
pub mod impala;

pub use daraja::DarajaGateway;
pub use impala::ImpalaGateway;
