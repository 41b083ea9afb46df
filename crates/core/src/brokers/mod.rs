//! Brokers module - broker session models, traits, and the connection manager.

mod brokers_model;
mod brokers_traits;
mod connection_manager;
mod errors;

#[cfg(test)]
mod connection_manager_tests;

// Re-export the public interface
pub use brokers_model::{
    BrokerCredential, BrokerType, CachedToken, ClientSession, NewBrokerCredential,
    RefreshSummary, TokenGrant, TokenState,
};
pub use brokers_traits::{
    BrokerClient, BrokerClientFactory, BrokerConnectionServiceTrait, CredentialsRepositoryTrait,
};
pub use connection_manager::{BrokerConnectionManager, ConnectionManagerConfig};
pub use errors::BrokerError;
