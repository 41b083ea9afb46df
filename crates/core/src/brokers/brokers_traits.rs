//! Broker client, credential repository, and connection service traits.
//!
//! These traits define the contracts for broker session operations without any
//! vendor- or database-specific types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::brokers_model::{
    BrokerCredential, BrokerType, ClientSession, NewBrokerCredential, RefreshSummary, TokenGrant,
    TokenState,
};
use crate::errors::Result;
use crate::portfolio::Holding;

/// Capability provider for one brokerage account.
///
/// Implementations own the vendor wire protocol. A client is created with an
/// API key and secret and becomes usable once it holds an access token, either
/// through `login` or `set_access_token`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn broker_type(&self) -> BrokerType;

    /// URL the user visits to obtain a request token.
    fn login_url(&self) -> String;

    /// Exchanges a request token for an access token and keeps it on the client.
    async fn login(&mut self, request_token: &str) -> Result<TokenGrant>;

    /// Whether `refresh_token` can run without user interaction.
    fn can_auto_refresh(&self) -> bool;

    /// Obtains a new access token and keeps it on the client.
    async fn refresh_token(&mut self) -> Result<TokenGrant>;

    fn access_token(&self) -> Option<&str>;

    fn set_access_token(&mut self, access_token: String);

    fn set_refresh_token(&mut self, refresh_token: Option<String>);

    /// Fetches long-term holdings, normalized to `Holding`.
    async fn get_holdings(&self) -> Result<Vec<Holding>>;

    /// Fetches open positions, normalized to `Holding`.
    async fn get_positions(&self) -> Result<Vec<Holding>>;
}

/// Builds broker clients keyed by broker type.
pub trait BrokerClientFactory: Send + Sync {
    fn create(&self, broker_type: BrokerType, api_key: &str, api_secret: &str)
        -> Box<dyn BrokerClient>;
}

/// Trait defining the contract for broker credential persistence.
///
/// At most one credential exists per (user, broker) pair.
#[async_trait]
pub trait CredentialsRepositoryTrait: Send + Sync {
    /// Inserts or replaces the credential for the (user, broker) pair.
    async fn save_credentials(&self, credential: NewBrokerCredential)
        -> Result<BrokerCredential>;

    fn get_credentials(
        &self,
        user_id: &str,
        broker_type: BrokerType,
    ) -> Result<Option<BrokerCredential>>;

    /// Replaces token, refresh token, and expiry in a single write.
    async fn update_access_token(
        &self,
        user_id: &str,
        broker_type: BrokerType,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: DateTime<Utc>,
    ) -> Result<()>;

    fn has_credentials(&self, user_id: &str, broker_type: BrokerType) -> Result<bool>;

    /// Deletes the credential. Returns the number of deleted records.
    async fn delete_credentials(&self, user_id: &str, broker_type: BrokerType) -> Result<usize>;

    fn get_credentials_for_all_users(&self) -> Result<Vec<BrokerCredential>>;

    /// Credentials whose stored expiry is set and earlier than `now`.
    fn get_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<BrokerCredential>>;
}

/// Trait defining the contract for broker session lifecycle operations.
#[async_trait]
pub trait BrokerConnectionServiceTrait: Send + Sync {
    /// Logs in with a request token and persists the resulting session.
    async fn connect(
        &self,
        user_id: &str,
        broker_type: BrokerType,
        api_key: &str,
        api_secret: &str,
        request_token: &str,
    ) -> Result<ClientSession>;

    /// Rebuilds a live client. `None` means the user has to connect again.
    fn get_client(&self, user_id: &str, broker_type: BrokerType)
        -> Result<Option<ClientSession>>;

    async fn disconnect(&self, user_id: &str, broker_type: BrokerType) -> Result<()>;

    /// Runs one refresh sweep over every stored credential.
    ///
    /// Returns `None` when another sweep is already running.
    async fn refresh_all(&self) -> Result<Option<RefreshSummary>>;

    fn session_state(&self, user_id: &str, broker_type: BrokerType) -> Result<TokenState>;

    fn login_url(&self, broker_type: BrokerType, api_key: &str) -> String;
}
