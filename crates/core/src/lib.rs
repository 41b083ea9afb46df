//! FinSight Core - Domain entities, services, and traits.
//!
//! This crate contains the broker session lifecycle, the TTL cache, and the
//! portfolio aggregation logic. It is storage- and vendor-agnostic: credential
//! persistence is implemented by `finsight-storage-sqlite` and broker REST
//! clients by `finsight-connect`.

pub mod brokers;
pub mod cache;
pub mod constants;
pub mod errors;
pub mod portfolio;

// Re-export common types from broker and portfolio modules
pub use brokers::{BrokerType, ClientSession};
pub use portfolio::{Holding, HoldingType, Portfolio};

// Re-export error types
pub use errors::Error;
pub use errors::Result;
