use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::brokers_model::{
    BrokerCredential, BrokerType, CachedToken, ClientSession, NewBrokerCredential,
    RefreshSummary, TokenState,
};
use super::brokers_traits::{
    BrokerClientFactory, BrokerConnectionServiceTrait, CredentialsRepositoryTrait,
};
use super::errors::BrokerError;
use crate::cache::CacheStore;
use crate::constants::DEFAULT_REFRESH_THRESHOLD_SECS;
use crate::errors::{Error, Result, ValidationError};

/// Tunables of the broker session lifecycle.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Tokens expiring within this window are refreshed by the sweep.
    pub refresh_threshold: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
        }
    }
}

enum RefreshOutcome {
    Refreshed,
    NotRefreshable,
}

/// Clears the single-flight flag when a sweep ends, including on early return.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the authentication and refresh lifecycle of every (user, broker) pair.
///
/// No client is kept between calls: `get_client` rebuilds one from the stored
/// credential and the cached token each time.
pub struct BrokerConnectionManager {
    repository: Arc<dyn CredentialsRepositoryTrait>,
    token_cache: Arc<dyn CacheStore<CachedToken>>,
    factory: Arc<dyn BrokerClientFactory>,
    config: ConnectionManagerConfig,
    sweep_in_progress: AtomicBool,
}

impl BrokerConnectionManager {
    pub fn new(
        repository: Arc<dyn CredentialsRepositoryTrait>,
        token_cache: Arc<dyn CacheStore<CachedToken>>,
        factory: Arc<dyn BrokerClientFactory>,
        config: ConnectionManagerConfig,
    ) -> Self {
        Self {
            repository,
            token_cache,
            factory,
            config,
            sweep_in_progress: AtomicBool::new(false),
        }
    }

    fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.refresh_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS as i64))
    }

    fn cache_token(
        &self,
        user_id: &str,
        broker_type: BrokerType,
        access_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ttl = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        let token = CachedToken {
            access_token: access_token.to_string(),
            expires_at,
        };
        self.token_cache
            .set(&broker_type.token_cache_key(user_id), token, ttl)
            .map_err(|e| Error::Persistence(format!("token cache write failed: {}", e)))
    }

    fn needs_refresh(
        &self,
        credential: &BrokerCredential,
        cached: Option<&CachedToken>,
        now: DateTime<Utc>,
    ) -> bool {
        cached.is_none() || credential.expires_within(now, self.refresh_threshold())
    }

    async fn refresh_credential(&self, credential: &BrokerCredential) -> Result<RefreshOutcome> {
        let broker_type = credential.broker_type;
        let mut client =
            self.factory
                .create(broker_type, &credential.api_key, &credential.api_secret);
        if let Some(access_token) = &credential.access_token {
            client.set_access_token(access_token.clone());
        }
        client.set_refresh_token(credential.refresh_token.clone());

        if !client.can_auto_refresh() {
            return Ok(RefreshOutcome::NotRefreshable);
        }

        let grant = client.refresh_token().await.map_err(|e| match e {
            Error::Broker(BrokerError::TokenRefreshFailed { .. }) => e,
            other => BrokerError::refresh(broker_type, other.to_string()).into(),
        })?;

        let now = Utc::now();
        let expires_at = now + broker_type.token_lifetime();
        let refresh_token = grant
            .refresh_token
            .or_else(|| credential.refresh_token.clone());

        self.repository
            .update_access_token(
                &credential.user_id,
                broker_type,
                &grant.access_token,
                refresh_token.as_deref(),
                expires_at,
            )
            .await?;
        self.cache_token(
            &credential.user_id,
            broker_type,
            &grant.access_token,
            expires_at,
            now,
        )?;

        Ok(RefreshOutcome::Refreshed)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(ValidationError::MissingField(
            field.to_string(),
        )));
    }
    Ok(())
}

fn key_prefix(api_key: &str) -> String {
    api_key.chars().take(8).collect()
}

#[async_trait]
impl BrokerConnectionServiceTrait for BrokerConnectionManager {
    async fn connect(
        &self,
        user_id: &str,
        broker_type: BrokerType,
        api_key: &str,
        api_secret: &str,
        request_token: &str,
    ) -> Result<ClientSession> {
        require("user_id", user_id)?;
        require("api_key", api_key)?;
        require("api_secret", api_secret)?;
        require("request_token", request_token)?;

        info!(
            "Connecting user {} to {} (api key {}...)",
            user_id,
            broker_type,
            key_prefix(api_key)
        );

        let mut client = self.factory.create(broker_type, api_key, api_secret);
        let grant = client.login(request_token).await.map_err(|e| {
            warn!("{} login failed for user {}: {}", broker_type, user_id, e);
            match e {
                Error::Broker(BrokerError::AuthenticationFailed { .. }) => e,
                other => BrokerError::authentication(broker_type, other.to_string()).into(),
            }
        })?;

        let now = Utc::now();
        let expires_at = now + broker_type.token_lifetime();

        self.repository
            .save_credentials(NewBrokerCredential {
                user_id: user_id.to_string(),
                broker_type,
                api_key: api_key.to_string(),
                api_secret: api_secret.to_string(),
                access_token: grant.access_token.clone(),
                refresh_token: grant.refresh_token.clone(),
                token_expiry: expires_at,
            })
            .await?;
        self.cache_token(user_id, broker_type, &grant.access_token, expires_at, now)?;

        info!(
            "Connected user {} to {}, token valid until {}",
            user_id, broker_type, expires_at
        );
        Ok(ClientSession::new(
            user_id,
            broker_type,
            Arc::from(client),
            Some(expires_at),
        ))
    }

    fn get_client(
        &self,
        user_id: &str,
        broker_type: BrokerType,
    ) -> Result<Option<ClientSession>> {
        let Some(credential) = self.repository.get_credentials(user_id, broker_type)? else {
            return Ok(None);
        };
        let Some(token) = self.token_cache.get(&broker_type.token_cache_key(user_id)) else {
            debug!(
                "No cached {} token for user {}, reconnect required",
                broker_type, user_id
            );
            return Ok(None);
        };

        let mut client =
            self.factory
                .create(broker_type, &credential.api_key, &credential.api_secret);
        client.set_access_token(token.access_token);
        client.set_refresh_token(credential.refresh_token);

        Ok(Some(ClientSession::new(
            user_id,
            broker_type,
            Arc::from(client),
            Some(token.expires_at),
        )))
    }

    async fn disconnect(&self, user_id: &str, broker_type: BrokerType) -> Result<()> {
        self.token_cache
            .delete(&broker_type.token_cache_key(user_id));
        let deleted = self
            .repository
            .delete_credentials(user_id, broker_type)
            .await?;
        info!(
            "Disconnected user {} from {} ({} credential rows removed)",
            user_id, broker_type, deleted
        );
        Ok(())
    }

    async fn refresh_all(&self) -> Result<Option<RefreshSummary>> {
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Token refresh sweep already running, skipping");
            return Ok(None);
        }
        let _guard = SweepGuard(&self.sweep_in_progress);

        let now = Utc::now();
        let credentials = self.repository.get_credentials_for_all_users()?;
        match self.repository.get_expired_tokens(now) {
            Ok(expired) if !expired.is_empty() => {
                debug!("{} stored tokens are past their expiry", expired.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to list expired tokens: {}", e),
        }

        let mut summary = RefreshSummary::default();
        for credential in &credentials {
            summary.checked += 1;
            let cached = self
                .token_cache
                .get(&credential.broker_type.token_cache_key(&credential.user_id));
            if !self.needs_refresh(credential, cached.as_ref(), now) {
                summary.up_to_date += 1;
                continue;
            }

            match self.refresh_credential(credential).await {
                Ok(RefreshOutcome::Refreshed) => {
                    debug!(
                        "Refreshed {} token for user {}",
                        credential.broker_type, credential.user_id
                    );
                    summary.refreshed += 1;
                }
                Ok(RefreshOutcome::NotRefreshable) => {
                    debug!(
                        "{} token for user {} cannot be refreshed automatically",
                        credential.broker_type, credential.user_id
                    );
                    summary.not_refreshable += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to refresh {} token for user {}: {}",
                        credential.broker_type, credential.user_id, e
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Token refresh sweep: {} checked, {} refreshed, {} failed, {} not refreshable, {} up to date",
            summary.checked,
            summary.refreshed,
            summary.failed,
            summary.not_refreshable,
            summary.up_to_date
        );
        Ok(Some(summary))
    }

    fn session_state(&self, user_id: &str, broker_type: BrokerType) -> Result<TokenState> {
        let credential = self.repository.get_credentials(user_id, broker_type)?;
        let cached = self.token_cache.get(&broker_type.token_cache_key(user_id));
        Ok(TokenState::evaluate(
            credential.as_ref(),
            cached.as_ref(),
            Utc::now(),
            self.refresh_threshold(),
        ))
    }

    fn login_url(&self, broker_type: BrokerType, api_key: &str) -> String {
        self.factory.create(broker_type, api_key, "").login_url()
    }
}
