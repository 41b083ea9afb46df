//! Background schedulers that keep broker tokens and portfolios fresh.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use finsight_core::brokers::{BrokerType, TokenState};
use finsight_core::portfolio::FetchContext;
use tracing::{debug, info, warn};

use crate::main_lib::AppState;

/// Starts the periodic token refresh sweep. The first sweep runs immediately.
/// With `warm_portfolios`, each sweep is followed by a portfolio warm-up.
pub fn start_token_refresh_scheduler(
    state: Arc<AppState>,
    period: Duration,
    warm_portfolios: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Token refresh scheduler started ({}s interval)", period.as_secs());

        let mut refresh_interval = interval(period);
        refresh_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            refresh_interval.tick().await;
            run_token_refresh(&state).await;
            if warm_portfolios {
                run_portfolio_warmup(&state).await;
            }
        }
    })
}

async fn run_token_refresh(state: &AppState) {
    debug!("Running scheduled token refresh...");
    match state.connection_service.refresh_all().await {
        Ok(Some(summary)) => debug!(
            "Token refresh sweep: {} checked, {} refreshed, {} failed",
            summary.checked, summary.refreshed, summary.failed
        ),
        Ok(None) => debug!("Token refresh skipped: previous sweep still running"),
        Err(e) => warn!("Token refresh sweep failed: {}", e),
    }
}

fn has_live_session(state: &AppState, user_id: &str) -> bool {
    BrokerType::ALL.into_iter().any(|broker_type| {
        matches!(
            state.connection_service.session_state(user_id, broker_type),
            Ok(TokenState::Valid | TokenState::NearExpiry)
        )
    })
}

/// Refreshes the stored portfolio of every user holding a live broker session.
/// Users whose sessions all lapsed keep their last stored snapshot.
async fn run_portfolio_warmup(state: &AppState) -> usize {
    let users: BTreeSet<String> = match state.credentials_repository.get_credentials_for_all_users()
    {
        Ok(credentials) => credentials.into_iter().map(|c| c.user_id).collect(),
        Err(e) => {
            warn!("Portfolio warm-up skipped: {}", e);
            return 0;
        }
    };

    let ctx = FetchContext::new();
    let mut warmed = 0;
    for user_id in users.iter().filter(|user_id| has_live_session(state, user_id)) {
        match state.portfolio_service.refresh_portfolio(&ctx, user_id).await {
            Ok(()) => warmed += 1,
            Err(e) => warn!("Portfolio warm-up failed for user {}: {}", user_id, e),
        }
    }
    debug!("Portfolio warm-up refreshed {} of {} users", warmed, users.len());
    warmed
}

/// Starts the periodic cleanup of expired token and portfolio cache entries.
pub fn start_cache_sweep_scheduler(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Cache sweep scheduler started ({}s interval)", period.as_secs());

        let mut sweep_interval = interval(period);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Nothing can have expired at startup.
        sweep_interval.tick().await;

        loop {
            sweep_interval.tick().await;
            run_cache_sweep(&state);
        }
    })
}

fn run_cache_sweep(state: &AppState) -> usize {
    let tokens = state.token_cache.delete_expired();
    let portfolios = state.portfolio_cache.delete_expired();
    if tokens + portfolios > 0 {
        debug!(
            "Cache sweep removed {} token and {} portfolio entries",
            tokens, portfolios
        );
    }
    tokens + portfolios
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::main_lib::{build_state, build_state_with_factory};
    use async_trait::async_trait;
    use finsight_core::brokers::{
        BrokerClient, BrokerClientFactory, CachedToken, NewBrokerCredential, TokenGrant,
    };
    use finsight_core::{Holding, Portfolio, Result};
    use tempfile::tempdir;

    struct OfflineClient {
        broker_type: BrokerType,
        access_token: Option<String>,
    }

    #[async_trait]
    impl BrokerClient for OfflineClient {
        fn broker_type(&self) -> BrokerType {
            self.broker_type
        }

        fn login_url(&self) -> String {
            String::new()
        }

        async fn login(&mut self, _request_token: &str) -> Result<TokenGrant> {
            unimplemented!()
        }

        fn can_auto_refresh(&self) -> bool {
            false
        }

        async fn refresh_token(&mut self) -> Result<TokenGrant> {
            unimplemented!()
        }

        fn access_token(&self) -> Option<&str> {
            self.access_token.as_deref()
        }

        fn set_access_token(&mut self, access_token: String) {
            self.access_token = Some(access_token);
        }

        fn set_refresh_token(&mut self, _refresh_token: Option<String>) {}

        async fn get_holdings(&self) -> Result<Vec<Holding>> {
            Ok(Vec::new())
        }

        async fn get_positions(&self) -> Result<Vec<Holding>> {
            Ok(Vec::new())
        }
    }

    struct OfflineFactory;

    impl BrokerClientFactory for OfflineFactory {
        fn create(
            &self,
            broker_type: BrokerType,
            _api_key: &str,
            _api_secret: &str,
        ) -> Box<dyn BrokerClient> {
            Box::new(OfflineClient {
                broker_type,
                access_token: None,
            })
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.db_path = dir.path().join("fs.db").to_string_lossy().to_string();
        config
    }

    async fn save_zerodha_credential(state: &AppState, user_id: &str) {
        state
            .credentials_repository
            .save_credentials(NewBrokerCredential {
                user_id: user_id.to_string(),
                broker_type: BrokerType::Zerodha,
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                access_token: "access".to_string(),
                refresh_token: None,
                token_expiry: chrono::Utc::now() + chrono::Duration::hours(24),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_warmup_refreshes_only_users_with_live_sessions() {
        let dir = tempdir().unwrap();
        let state = build_state_with_factory(&test_config(&dir), Arc::new(OfflineFactory))
            .await
            .unwrap();

        save_zerodha_credential(&state, "live").await;
        save_zerodha_credential(&state, "lapsed").await;
        state
            .token_cache
            .set(
                &BrokerType::Zerodha.token_cache_key("live"),
                CachedToken {
                    access_token: "access".to_string(),
                    expires_at: chrono::Utc::now() + chrono::Duration::hours(24),
                },
                Duration::from_secs(3600),
            )
            .unwrap();

        assert_eq!(run_portfolio_warmup(&state).await, 1);
        assert!(state.portfolio_cache.get("portfolio:live").is_some());
        assert!(state.portfolio_cache.get("portfolio:lapsed").is_none());
    }

    #[tokio::test]
    async fn test_warmup_without_users_is_a_no_op() {
        let dir = tempdir().unwrap();
        let state = build_state(&test_config(&dir)).await.unwrap();
        assert_eq!(run_portfolio_warmup(&state).await, 0);
    }

    #[tokio::test]
    async fn test_cache_sweep_removes_only_expired_entries() {
        let dir = tempdir().unwrap();
        let state = build_state(&test_config(&dir)).await.unwrap();

        let token = CachedToken {
            access_token: "t".to_string(),
            expires_at: chrono::Utc::now(),
        };
        state
            .token_cache
            .set("token:zerodha:u1", token.clone(), Duration::ZERO)
            .unwrap();
        state
            .token_cache
            .set("token:zerodha:u2", token, Duration::from_secs(3600))
            .unwrap();
        state
            .portfolio_cache
            .set(
                "portfolio:u1",
                Portfolio::from_holdings(Vec::new(), chrono::Utc::now()),
                Duration::ZERO,
            )
            .unwrap();

        assert_eq!(run_cache_sweep(&state), 2);
        assert!(state.token_cache.get("token:zerodha:u2").is_some());
        assert_eq!(run_cache_sweep(&state), 0);
    }
}
