//! Broker session error types.

use thiserror::Error;

use super::brokers_model::BrokerType;

/// Errors raised while authenticating with, refreshing, or fetching from a broker.
///
/// `CredentialNotFound` is a normal "not connected" signal for the aggregator;
/// `UpstreamFetchFailed` is isolated per call and never fails a portfolio read.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("No {broker} credentials stored for user {user_id}")]
    CredentialNotFound { user_id: String, broker: BrokerType },

    #[error("{broker} authentication failed: {reason}")]
    AuthenticationFailed { broker: BrokerType, reason: String },

    #[error("{broker} token refresh failed: {reason}")]
    TokenRefreshFailed { broker: BrokerType, reason: String },

    #[error("{broker} {operation} request failed: {reason}")]
    UpstreamFetchFailed {
        broker: BrokerType,
        operation: String,
        reason: String,
    },

    #[error("Unsupported broker: {0}")]
    UnsupportedBroker(String),
}

impl BrokerError {
    pub fn authentication(broker: BrokerType, reason: impl Into<String>) -> Self {
        BrokerError::AuthenticationFailed {
            broker,
            reason: reason.into(),
        }
    }

    pub fn refresh(broker: BrokerType, reason: impl Into<String>) -> Self {
        BrokerError::TokenRefreshFailed {
            broker,
            reason: reason.into(),
        }
    }

    pub fn upstream(
        broker: BrokerType,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        BrokerError::UpstreamFetchFailed {
            broker,
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}
