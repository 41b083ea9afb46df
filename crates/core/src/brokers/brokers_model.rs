//! Broker domain models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::brokers_traits::BrokerClient;
use super::errors::BrokerError;
use crate::constants::{
    ICICI_TOKEN_LIFETIME_HOURS, TOKEN_CACHE_PREFIX, ZERODHA_TOKEN_LIFETIME_HOURS,
};
use crate::errors::Error;

/// Supported brokerages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerType {
    #[serde(rename = "zerodha")]
    Zerodha,
    #[serde(rename = "icici")]
    IciciDirect,
}

impl BrokerType {
    /// Every supported broker, in fan-out order.
    pub const ALL: [BrokerType; 2] = [BrokerType::Zerodha, BrokerType::IciciDirect];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerType::Zerodha => "zerodha",
            BrokerType::IciciDirect => "icici",
        }
    }

    /// How long a freshly issued access token stays valid.
    pub fn token_lifetime(&self) -> Duration {
        match self {
            BrokerType::Zerodha => Duration::hours(ZERODHA_TOKEN_LIFETIME_HOURS),
            BrokerType::IciciDirect => Duration::hours(ICICI_TOKEN_LIFETIME_HOURS),
        }
    }

    /// Cache key of the access token held for `user_id` at this broker.
    pub fn token_cache_key(&self, user_id: &str) -> String {
        format!("{}:{}:{}", TOKEN_CACHE_PREFIX, self.as_str(), user_id)
    }
}

impl fmt::Display for BrokerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zerodha" => Ok(BrokerType::Zerodha),
            "icici" | "icici_direct" | "icicidirect" => Ok(BrokerType::IciciDirect),
            other => Err(BrokerError::UnsupportedBroker(other.to_string()).into()),
        }
    }
}

/// Stored credential for one (user, broker) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCredential {
    pub user_id: String,
    pub broker_type: BrokerType,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BrokerCredential {
    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expiry.is_some_and(|expiry| expiry < now)
    }

    /// True when the stored expiry is unknown or falls within `threshold` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.token_expiry {
            // A window reaching past the representable range covers every expiry.
            Some(expiry) => expiry
                .checked_sub_signed(threshold)
                .map_or(true, |window_start| now > window_start),
            None => true,
        }
    }
}

/// Input model for saving credentials after a successful login.
#[derive(Debug, Clone)]
pub struct NewBrokerCredential {
    pub user_id: String,
    pub broker_type: BrokerType,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expiry: DateTime<Utc>,
}

/// Tokens issued by a broker on login or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Access token mirrored in the token cache.
///
/// Token and expiry are written together so readers never observe a new token
/// with an old expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Observable lifecycle state of a (user, broker) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenState {
    /// No credential row exists; the user must connect.
    NoCredential,
    /// A cached token exists and is outside the refresh window.
    Valid,
    /// A cached token exists but expires within the refresh window.
    NearExpiry,
    /// The row exists but no usable token is cached. Retried by the sweep.
    Invalid,
}

impl TokenState {
    pub fn evaluate(
        credential: Option<&BrokerCredential>,
        cached: Option<&CachedToken>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Self {
        let Some(credential) = credential else {
            return TokenState::NoCredential;
        };
        match cached {
            None => TokenState::Invalid,
            Some(token) if token.expires_at <= now => TokenState::Invalid,
            Some(_) if credential.expires_within(now, threshold) => TokenState::NearExpiry,
            Some(_) => TokenState::Valid,
        }
    }
}

/// Authenticated broker handle rebuilt on demand from a credential and a cached token.
#[derive(Clone)]
pub struct ClientSession {
    pub user_id: String,
    pub broker_type: BrokerType,
    pub client: Arc<dyn BrokerClient>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClientSession {
    pub fn new(
        user_id: impl Into<String>,
        broker_type: BrokerType,
        client: Arc<dyn BrokerClient>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            broker_type,
            client,
            expires_at,
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("user_id", &self.user_id)
            .field("broker_type", &self.broker_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Outcome counts of one token refresh sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub checked: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub not_refreshable: usize,
    pub up_to_date: usize,
}
