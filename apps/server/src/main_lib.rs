use std::sync::Arc;

use finsight_connect::DefaultBrokerClientFactory;
use finsight_core::brokers::{
    BrokerClientFactory, BrokerConnectionManager, BrokerConnectionServiceTrait, CachedToken,
    ConnectionManagerConfig, CredentialsRepositoryTrait,
};
use finsight_core::cache::{CacheStore, TtlCache};
use finsight_core::portfolio::{
    AggregatorConfig, PortfolioAggregator, PortfolioRepositoryTrait, PortfolioServiceTrait,
};
use finsight_core::Portfolio;
use finsight_storage_sqlite::{
    brokers::CredentialsRepository,
    db::{self, write_actor},
    portfolio::PortfolioRepository,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{Config, LogFormat};

pub struct AppState {
    pub credentials_repository: Arc<dyn CredentialsRepositoryTrait>,
    pub connection_service: Arc<dyn BrokerConnectionServiceTrait>,
    pub portfolio_service: Arc<dyn PortfolioServiceTrait>,
    pub token_cache: Arc<dyn CacheStore<CachedToken>>,
    pub portfolio_cache: Arc<dyn CacheStore<Portfolio>>,
    pub db_path: String,
}

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init(),
    }
}

pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let factory: Arc<dyn BrokerClientFactory> = Arc::new(DefaultBrokerClientFactory::new());
    build_state_with_factory(config, factory).await
}

pub async fn build_state_with_factory(
    config: &Config,
    factory: Arc<dyn BrokerClientFactory>,
) -> anyhow::Result<Arc<AppState>> {
    let db_path = db::init(&config.db_path)?;
    tracing::info!("Database path in use: {}", db_path);

    let pool = db::create_pool(&db_path)?;
    db::run_migrations(&pool)?;
    let writer = write_actor::spawn_writer((*pool).clone());

    let credentials_repository: Arc<dyn CredentialsRepositoryTrait> =
        Arc::new(CredentialsRepository::new(pool.clone(), writer.clone()));
    let portfolio_repository: Arc<dyn PortfolioRepositoryTrait> =
        Arc::new(PortfolioRepository::new(pool.clone(), writer));
    let token_cache: Arc<dyn CacheStore<CachedToken>> = Arc::new(TtlCache::<CachedToken>::new());
    let portfolio_cache: Arc<dyn CacheStore<Portfolio>> = Arc::new(TtlCache::<Portfolio>::new());

    let connection_service: Arc<dyn BrokerConnectionServiceTrait> =
        Arc::new(BrokerConnectionManager::new(
            credentials_repository.clone(),
            token_cache.clone(),
            factory,
            ConnectionManagerConfig {
                refresh_threshold: config.token_refresh_threshold,
            },
        ));

    let portfolio_service: Arc<dyn PortfolioServiceTrait> = Arc::new(PortfolioAggregator::new(
        connection_service.clone(),
        portfolio_cache.clone(),
        portfolio_repository,
        AggregatorConfig {
            cache_ttl: config.cache_ttl,
            request_timeout: config.request_timeout,
            timeout_policy: config.timeout_policy,
        },
    ));

    Ok(Arc::new(AppState {
        credentials_repository,
        connection_service,
        portfolio_service,
        token_cache,
        portfolio_cache,
        db_path,
    }))
}
