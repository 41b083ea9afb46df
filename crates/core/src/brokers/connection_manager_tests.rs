#[cfg(test)]
mod tests {
    use crate::brokers::{
        BrokerClient, BrokerClientFactory, BrokerConnectionManager, BrokerConnectionServiceTrait,
        BrokerCredential, BrokerError, BrokerType, CachedToken, ConnectionManagerConfig,
        CredentialsRepositoryTrait, NewBrokerCredential, TokenGrant, TokenState,
    };
    use crate::cache::{CacheStore, TtlCache};
    use crate::errors::{Error, Result};
    use crate::portfolio::Holding;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    // --- Mock CredentialsRepository ---
    #[derive(Clone, Default)]
    struct MockCredentialsRepository {
        rows: Arc<Mutex<HashMap<(String, BrokerType), BrokerCredential>>>,
    }

    impl MockCredentialsRepository {
        fn insert(&self, credential: BrokerCredential) {
            self.rows.lock().unwrap().insert(
                (credential.user_id.clone(), credential.broker_type),
                credential,
            );
        }

        fn row(&self, user_id: &str, broker_type: BrokerType) -> Option<BrokerCredential> {
            self.rows
                .lock()
                .unwrap()
                .get(&(user_id.to_string(), broker_type))
                .cloned()
        }

        fn count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CredentialsRepositoryTrait for MockCredentialsRepository {
        async fn save_credentials(
            &self,
            credential: NewBrokerCredential,
        ) -> Result<BrokerCredential> {
            let now = Utc::now();
            let saved = BrokerCredential {
                user_id: credential.user_id,
                broker_type: credential.broker_type,
                api_key: credential.api_key,
                api_secret: credential.api_secret,
                access_token: Some(credential.access_token),
                refresh_token: credential.refresh_token,
                token_expiry: Some(credential.token_expiry),
                created_at: now,
                updated_at: now,
            };
            self.insert(saved.clone());
            Ok(saved)
        }

        fn get_credentials(
            &self,
            user_id: &str,
            broker_type: BrokerType,
        ) -> Result<Option<BrokerCredential>> {
            Ok(self.row(user_id, broker_type))
        }

        async fn update_access_token(
            &self,
            user_id: &str,
            broker_type: BrokerType,
            access_token: &str,
            refresh_token: Option<&str>,
            token_expiry: DateTime<Utc>,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(&(user_id.to_string(), broker_type))
                .ok_or_else(|| BrokerError::CredentialNotFound {
                    user_id: user_id.to_string(),
                    broker: broker_type,
                })?;
            row.access_token = Some(access_token.to_string());
            row.refresh_token = refresh_token.map(str::to_string);
            row.token_expiry = Some(token_expiry);
            row.updated_at = Utc::now();
            Ok(())
        }

        fn has_credentials(&self, user_id: &str, broker_type: BrokerType) -> Result<bool> {
            Ok(self.row(user_id, broker_type).is_some())
        }

        async fn delete_credentials(
            &self,
            user_id: &str,
            broker_type: BrokerType,
        ) -> Result<usize> {
            let removed = self
                .rows
                .lock()
                .unwrap()
                .remove(&(user_id.to_string(), broker_type));
            Ok(usize::from(removed.is_some()))
        }

        fn get_credentials_for_all_users(&self) -> Result<Vec<BrokerCredential>> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        fn get_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<BrokerCredential>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.is_token_expired(now))
                .cloned()
                .collect())
        }
    }

    // --- Scripted BrokerClient ---
    #[derive(Default)]
    struct ClientScript {
        login_fails: AtomicBool,
        refresh_fails: AtomicBool,
        not_refreshable: AtomicBool,
        hold_refresh: AtomicBool,
        created: AtomicUsize,
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        refresh_started: Notify,
        release_refresh: Notify,
    }

    struct MockBrokerClient {
        broker_type: BrokerType,
        access_token: Option<String>,
        refresh_token: Option<String>,
        script: Arc<ClientScript>,
    }

    #[async_trait]
    impl BrokerClient for MockBrokerClient {
        fn broker_type(&self) -> BrokerType {
            self.broker_type
        }

        fn login_url(&self) -> String {
            format!("https://login.example/{}", self.broker_type)
        }

        async fn login(&mut self, request_token: &str) -> Result<TokenGrant> {
            self.script.logins.fetch_add(1, Ordering::SeqCst);
            if self.script.login_fails.load(Ordering::SeqCst) {
                return Err(Error::Unexpected("invalid request token".to_string()));
            }
            let access_token = format!("access-{}", request_token);
            self.access_token = Some(access_token.clone());
            Ok(TokenGrant {
                access_token,
                refresh_token: Some("refresh-1".to_string()),
            })
        }

        fn can_auto_refresh(&self) -> bool {
            !self.script.not_refreshable.load(Ordering::SeqCst)
        }

        async fn refresh_token(&mut self) -> Result<TokenGrant> {
            if self.script.hold_refresh.load(Ordering::SeqCst) {
                self.script.refresh_started.notify_one();
                self.script.release_refresh.notified().await;
            }
            let n = self.script.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.script.refresh_fails.load(Ordering::SeqCst) {
                return Err(Error::Unexpected("broker unavailable".to_string()));
            }
            let access_token = format!("refreshed-{}", n);
            self.access_token = Some(access_token.clone());
            Ok(TokenGrant {
                access_token,
                refresh_token: None,
            })
        }

        fn access_token(&self) -> Option<&str> {
            self.access_token.as_deref()
        }

        fn set_access_token(&mut self, access_token: String) {
            self.access_token = Some(access_token);
        }

        fn set_refresh_token(&mut self, refresh_token: Option<String>) {
            self.refresh_token = refresh_token;
        }

        async fn get_holdings(&self) -> Result<Vec<Holding>> {
            Ok(Vec::new())
        }

        async fn get_positions(&self) -> Result<Vec<Holding>> {
            Ok(Vec::new())
        }
    }

    struct MockClientFactory {
        script: Arc<ClientScript>,
    }

    impl BrokerClientFactory for MockClientFactory {
        fn create(
            &self,
            broker_type: BrokerType,
            _api_key: &str,
            _api_secret: &str,
        ) -> Box<dyn BrokerClient> {
            self.script.created.fetch_add(1, Ordering::SeqCst);
            Box::new(MockBrokerClient {
                broker_type,
                access_token: None,
                refresh_token: None,
                script: self.script.clone(),
            })
        }
    }

    struct Fixture {
        manager: Arc<BrokerConnectionManager>,
        repository: MockCredentialsRepository,
        cache: Arc<TtlCache<CachedToken>>,
        script: Arc<ClientScript>,
    }

    fn fixture() -> Fixture {
        let repository = MockCredentialsRepository::default();
        let cache: Arc<TtlCache<CachedToken>> = Arc::new(TtlCache::new());
        let script = Arc::new(ClientScript::default());
        let manager = BrokerConnectionManager::new(
            Arc::new(repository.clone()),
            cache.clone(),
            Arc::new(MockClientFactory {
                script: script.clone(),
            }),
            ConnectionManagerConfig::default(),
        );
        Fixture {
            manager: Arc::new(manager),
            repository,
            cache,
            script,
        }
    }

    fn stored_credential(user_id: &str, expiry: DateTime<Utc>) -> BrokerCredential {
        BrokerCredential {
            user_id: user_id.to_string(),
            broker_type: BrokerType::Zerodha,
            api_key: "kite-key".to_string(),
            api_secret: "kite-secret".to_string(),
            access_token: Some("stale-token".to_string()),
            refresh_token: Some("refresh-0".to_string()),
            token_expiry: Some(expiry),
            created_at: expiry - Duration::hours(24),
            updated_at: expiry - Duration::hours(24),
        }
    }

    fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
        let drift = (actual - expected).num_seconds().abs();
        assert!(drift <= 5, "expected {} to be close to {}", actual, expected);
    }

    #[tokio::test]
    async fn test_connect_persists_credential_and_caches_token() {
        let f = fixture();
        let session = f
            .manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();

        assert_eq!(session.user_id, "u1");
        assert_eq!(session.client.access_token(), Some("access-req-1"));

        let row = f.repository.row("u1", BrokerType::Zerodha).unwrap();
        assert_eq!(row.access_token.as_deref(), Some("access-req-1"));
        assert_eq!(row.refresh_token.as_deref(), Some("refresh-1"));
        assert_close(row.token_expiry.unwrap(), Utc::now() + Duration::hours(24));

        let cached = f.cache.get("token:zerodha:u1").unwrap();
        assert_eq!(cached.access_token, "access-req-1");
        assert_eq!(Some(cached.expires_at), row.token_expiry);
    }

    #[tokio::test]
    async fn test_connect_icici_uses_twelve_hour_expiry() {
        let f = fixture();
        let session = f
            .manager
            .connect("u1", BrokerType::IciciDirect, "app-key", "secret", "session-1")
            .await
            .unwrap();

        assert_close(session.expires_at.unwrap(), Utc::now() + Duration::hours(12));
        assert!(f.cache.get("token:icici:u1").is_some());
    }

    #[tokio::test]
    async fn test_connect_login_failure_persists_nothing() {
        let f = fixture();
        f.script.login_fails.store(true, Ordering::SeqCst);

        let err = f
            .manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "bad")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Broker(BrokerError::AuthenticationFailed {
                broker: BrokerType::Zerodha,
                ..
            })
        ));
        assert_eq!(f.repository.count(), 0);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_request_token() {
        let f = fixture();
        let err = f
            .manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "  ")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.script.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_client_without_credential_is_not_found() {
        let f = fixture();
        assert!(f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_client_without_cached_token_is_not_found() {
        let f = fixture();
        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();
        f.cache.delete("token:zerodha:u1");

        assert!(f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_client_rebuilds_client_on_every_call() {
        let f = fixture();
        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();
        let created_after_connect = f.script.created.load(Ordering::SeqCst);

        let first = f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .unwrap();
        let second = f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .unwrap();

        assert_eq!(first.client.access_token(), Some("access-req-1"));
        assert_eq!(second.client.access_token(), Some("access-req-1"));
        assert!(!Arc::ptr_eq(&first.client, &second.client));
        assert_eq!(
            f.script.created.load(Ordering::SeqCst),
            created_after_connect + 2
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture();
        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();

        f.manager.disconnect("u1", BrokerType::Zerodha).await.unwrap();
        f.manager.disconnect("u1", BrokerType::Zerodha).await.unwrap();

        assert_eq!(f.repository.count(), 0);
        assert!(f.cache.get("token:zerodha:u1").is_none());
        assert!(f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_refreshes_expired_credential_without_deleting_it() {
        let f = fixture();
        let now = Utc::now();
        f.repository
            .insert(stored_credential("u1", now - Duration::hours(1)));

        let expired = f.repository.get_expired_tokens(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, "u1");

        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.failed, 0);

        let row = f.repository.row("u1", BrokerType::Zerodha).unwrap();
        assert_eq!(row.access_token.as_deref(), Some("refreshed-1"));
        // The broker issued no new refresh token, so the stored one is kept.
        assert_eq!(row.refresh_token.as_deref(), Some("refresh-0"));
        assert!(row.token_expiry.unwrap() > Utc::now());

        let cached = f.cache.get("token:zerodha:u1").unwrap();
        assert_eq!(cached.access_token, "refreshed-1");
        assert_eq!(Some(cached.expires_at), row.token_expiry);
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_credential_untouched() {
        let f = fixture();
        let original = stored_credential("u1", Utc::now() - Duration::hours(1));
        f.repository.insert(original.clone());
        f.script.refresh_fails.store(true, Ordering::SeqCst);

        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.refreshed, 0);
        assert_eq!(f.repository.row("u1", BrokerType::Zerodha), Some(original));
        assert!(f.cache.get("token:zerodha:u1").is_none());

        // The next sweep retries the same row.
        f.script.refresh_fails.store(false, Ordering::SeqCst);
        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.refreshed, 1);
        assert_eq!(f.script.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_all_skips_tokens_outside_threshold() {
        let f = fixture();
        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();

        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.up_to_date, 1);
        assert_eq!(f.script.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_all_refreshes_when_cached_token_is_missing() {
        let f = fixture();
        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();
        f.cache.delete("token:zerodha:u1");

        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.refreshed, 1);
        assert!(f
            .manager
            .get_client("u1", BrokerType::Zerodha)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_refresh_all_counts_clients_that_cannot_refresh() {
        let f = fixture();
        f.repository
            .insert(stored_credential("u1", Utc::now() - Duration::hours(1)));
        f.script.not_refreshable.store(true, Ordering::SeqCst);

        let summary = f.manager.refresh_all().await.unwrap().unwrap();
        assert_eq!(summary.not_refreshable, 1);
        assert_eq!(f.script.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(f.repository.count(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let f = fixture();
        f.repository
            .insert(stored_credential("u1", Utc::now() - Duration::hours(1)));
        f.script.hold_refresh.store(true, Ordering::SeqCst);

        let manager = f.manager.clone();
        let first = tokio::spawn(async move { manager.refresh_all().await });
        f.script.refresh_started.notified().await;

        assert!(f.manager.refresh_all().await.unwrap().is_none());

        f.script.release_refresh.notify_one();
        let summary = first.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.refreshed, 1);

        // The guard is released once the first sweep finishes.
        f.script.hold_refresh.store(false, Ordering::SeqCst);
        assert!(f.manager.refresh_all().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_state_follows_lifecycle() {
        let f = fixture();
        assert_eq!(
            f.manager.session_state("u1", BrokerType::Zerodha).unwrap(),
            TokenState::NoCredential
        );

        f.manager
            .connect("u1", BrokerType::Zerodha, "kite-key", "kite-secret", "req-1")
            .await
            .unwrap();
        assert_eq!(
            f.manager.session_state("u1", BrokerType::Zerodha).unwrap(),
            TokenState::Valid
        );

        f.cache.delete("token:zerodha:u1");
        assert_eq!(
            f.manager.session_state("u1", BrokerType::Zerodha).unwrap(),
            TokenState::Invalid
        );

        f.manager.disconnect("u1", BrokerType::Zerodha).await.unwrap();
        assert_eq!(
            f.manager.session_state("u1", BrokerType::Zerodha).unwrap(),
            TokenState::NoCredential
        );
    }

    #[tokio::test]
    async fn test_login_url_comes_from_broker_client() {
        let f = fixture();
        assert_eq!(
            f.manager.login_url(BrokerType::IciciDirect, "app-key"),
            "https://login.example/icici"
        );
    }
}
