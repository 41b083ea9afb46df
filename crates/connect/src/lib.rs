//! FinSight Connect - REST clients for the supported brokerages.
//!
//! Each client implements `finsight_core::brokers::BrokerClient` and normalizes
//! the vendor's holdings and positions into `finsight_core::Holding`.
//! [`DefaultBrokerClientFactory`] is the factory the connection manager uses.

mod common;
mod factory;
pub mod icici_direct;
pub mod zerodha;

pub use common::sha256_hex;
pub use factory::DefaultBrokerClientFactory;
pub use icici_direct::IciciDirectClient;
pub use zerodha::ZerodhaClient;
