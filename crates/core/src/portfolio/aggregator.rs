use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::holding_merger::merge_holdings_at;
use super::portfolio_model::{Holding, HoldingType, Portfolio};
use super::portfolio_traits::{PortfolioRepositoryTrait, PortfolioServiceTrait};
use crate::brokers::{BrokerClient, BrokerConnectionServiceTrait, BrokerType};
use crate::cache::{portfolio_cache_key, CacheStore};
use crate::constants::DEFAULT_PORTFOLIO_CACHE_TTL_SECS;
use crate::errors::{Error, Result};

/// What a request-driven refresh does when its deadline passes before every
/// broker call has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Abandon in-flight calls and fail the request with `Error::Timeout`.
    #[default]
    Fail,
    /// Abandon in-flight calls and build the portfolio from the calls that
    /// already returned. The partial snapshot is returned but not cached.
    UsePartial,
}

impl FromStr for TimeoutPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(TimeoutPolicy::Fail),
            "partial" | "use_partial" => Ok(TimeoutPolicy::UsePartial),
            other => Err(Error::InvalidConfigValue(format!(
                "unknown timeout policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Maximum age of a cached snapshot served without refreshing.
    pub cache_ttl: Duration,
    /// Upper bound on one refresh, applied on top of any caller deadline.
    pub request_timeout: Option<Duration>,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_PORTFOLIO_CACHE_TTL_SECS),
            request_timeout: None,
            timeout_policy: TimeoutPolicy::Fail,
        }
    }
}

/// Per-request context carrying the caller's deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchContext {
    deadline: Option<Instant>,
}

impl FetchContext {
    /// A context without a deadline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// A timeout too large to represent as an instant leaves the context unbounded.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Holdings,
    Positions,
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKind::Holdings => f.write_str("holdings"),
            FetchKind::Positions => f.write_str("positions"),
        }
    }
}

struct FetchOutcome {
    slot: usize,
    broker_type: BrokerType,
    kind: FetchKind,
    result: Result<Vec<Holding>>,
}

fn fetch_call(
    slot: usize,
    client: Arc<dyn BrokerClient>,
    broker_type: BrokerType,
    kind: FetchKind,
) -> BoxFuture<'static, FetchOutcome> {
    async move {
        let result = match kind {
            FetchKind::Holdings => client.get_holdings().await,
            FetchKind::Positions => client.get_positions().await,
        };
        FetchOutcome {
            slot,
            broker_type,
            kind,
            result,
        }
    }
    .boxed()
}

/// Snapshot built by one refresh, and whether every broker call joined.
struct RefreshedSnapshot {
    portfolio: Portfolio,
    complete: bool,
}

/// Aggregates holdings across every broker a user has connected.
///
/// Complete snapshots are saved to the durable store and cached per user under
/// `portfolio:<user_id>` unfiltered; type and platform filters are applied on read.
pub struct PortfolioAggregator {
    connections: Arc<dyn BrokerConnectionServiceTrait>,
    cache: Arc<dyn CacheStore<Portfolio>>,
    repository: Arc<dyn PortfolioRepositoryTrait>,
    config: AggregatorConfig,
}

impl PortfolioAggregator {
    pub fn new(
        connections: Arc<dyn BrokerConnectionServiceTrait>,
        cache: Arc<dyn CacheStore<Portfolio>>,
        repository: Arc<dyn PortfolioRepositoryTrait>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            connections,
            cache,
            repository,
            config,
        }
    }

    fn effective_deadline(&self, ctx: &FetchContext) -> Option<Instant> {
        let configured = self
            .config
            .request_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        match (ctx.deadline(), configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_fresh(&self, last_updated: DateTime<Utc>) -> bool {
        let age = (Utc::now() - last_updated)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age <= self.config.cache_ttl
    }

    fn fresh_snapshot(&self, user_id: &str) -> Option<Portfolio> {
        let snapshot = self.cache.get(&portfolio_cache_key(user_id))?;
        if !self.is_fresh(snapshot.last_updated) {
            debug!("Cached portfolio for user {} is stale", user_id);
            return None;
        }
        Some(snapshot)
    }

    /// Time of the stored snapshot when it is still within the cache TTL.
    fn fresh_stored_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let stored_at = self.repository.get_portfolio_last_updated(user_id)?;
        Ok(stored_at.filter(|at| self.is_fresh(*at)))
    }

    /// Serves a read from the durable store after a cache miss. Unfiltered reads
    /// warm the cache with the stored snapshot.
    fn stored_snapshot(
        &self,
        user_id: &str,
        type_filter: Option<HoldingType>,
    ) -> Result<Option<Portfolio>> {
        let Some(stored_at) = self.fresh_stored_at(user_id)? else {
            return Ok(None);
        };
        debug!("Serving portfolio for user {} from the store", user_id);
        let Some(wanted) = type_filter else {
            let snapshot =
                Portfolio::from_holdings(self.repository.get_holdings(user_id)?, stored_at);
            if let Err(e) = self.cache.set(
                &portfolio_cache_key(user_id),
                snapshot.clone(),
                self.config.cache_ttl,
            ) {
                warn!("Failed to warm portfolio cache for user {}: {}", user_id, e);
            }
            return Ok(Some(snapshot));
        };
        let holdings = self.repository.get_holdings_by_type(user_id, wanted)?;
        Ok(Some(Portfolio::from_holdings(holdings, stored_at)))
    }

    async fn refresh_snapshot(&self, ctx: &FetchContext, user_id: &str) -> Result<Portfolio> {
        let refreshed = self.collect(ctx, user_id).await?;
        if !refreshed.complete {
            warn!(
                "Returning partial portfolio for user {} without storing it",
                user_id
            );
            return Ok(refreshed.portfolio);
        }

        let portfolio = refreshed.portfolio;
        self.repository
            .save_holdings(user_id, portfolio.holdings.clone(), portfolio.last_updated)
            .await
            .map_err(|e| Error::Persistence(format!("portfolio save failed: {}", e)))?;
        self.cache
            .set(
                &portfolio_cache_key(user_id),
                portfolio.clone(),
                self.config.cache_ttl,
            )
            .map_err(|e| Error::Persistence(format!("portfolio snapshot write failed: {}", e)))?;
        Ok(portfolio)
    }

    /// Fans out one holdings and one positions call per connected broker and
    /// joins them before merging. A session lookup failure aborts the refresh.
    async fn collect(&self, ctx: &FetchContext, user_id: &str) -> Result<RefreshedSnapshot> {
        let mut calls = FuturesUnordered::new();
        for broker_type in BrokerType::ALL {
            let session = self
                .connections
                .get_client(user_id, broker_type)
                .inspect_err(|e| {
                    warn!(
                        "Failed to load {} session for user {}: {}",
                        broker_type, user_id, e
                    )
                })?;
            match session {
                Some(session) => {
                    for kind in [FetchKind::Holdings, FetchKind::Positions] {
                        calls.push(fetch_call(
                            calls.len(),
                            session.client.clone(),
                            broker_type,
                            kind,
                        ));
                    }
                }
                None => debug!("User {} has no live {} session", user_id, broker_type),
            }
        }

        let mut slots: Vec<Vec<Holding>> = vec![Vec::new(); calls.len()];
        let deadline = self.effective_deadline(ctx);
        let mut complete = true;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, calls.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        complete = false;
                        break;
                    }
                },
                None => calls.next().await,
            };
            let Some(outcome) = next else {
                break;
            };
            match outcome.result {
                Ok(holdings) => slots[outcome.slot] = holdings,
                Err(e) => warn!(
                    "{} {} fetch failed for user {}: {}",
                    outcome.broker_type, outcome.kind, user_id, e
                ),
            }
        }

        if !complete {
            let abandoned = calls.len();
            drop(calls);
            match self.config.timeout_policy {
                TimeoutPolicy::Fail => {
                    return Err(Error::Timeout(format!(
                        "portfolio refresh for user {} abandoned {} broker calls",
                        user_id, abandoned
                    )));
                }
                TimeoutPolicy::UsePartial => {
                    warn!(
                        "Portfolio refresh for user {} timed out with {} broker calls pending",
                        user_id, abandoned
                    );
                }
            }
        }

        let now = Utc::now();
        let holdings = merge_holdings_at(slots, now);
        let portfolio = Portfolio::from_holdings(holdings, now);
        info!(
            "Refreshed portfolio for user {}: {} holdings, total value {}",
            user_id,
            portfolio.holdings.len(),
            portfolio.total_value
        );
        Ok(RefreshedSnapshot {
            portfolio,
            complete,
        })
    }
}

#[async_trait]
impl PortfolioServiceTrait for PortfolioAggregator {
    async fn get_portfolio(
        &self,
        ctx: &FetchContext,
        user_id: &str,
        force_refresh: bool,
        type_filter: Option<HoldingType>,
    ) -> Result<Portfolio> {
        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot(user_id) {
                return Ok(snapshot.filtered(type_filter));
            }
            if let Some(stored) = self.stored_snapshot(user_id, type_filter)? {
                return Ok(stored);
            }
        }
        let snapshot = self.refresh_snapshot(ctx, user_id).await?;
        Ok(snapshot.filtered(type_filter))
    }

    async fn get_platform_portfolio(
        &self,
        ctx: &FetchContext,
        user_id: &str,
        platform: BrokerType,
        force_refresh: bool,
    ) -> Result<Portfolio> {
        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot(user_id) {
                return Ok(snapshot.for_platform(platform));
            }
            if let Some(stored_at) = self.fresh_stored_at(user_id)? {
                let holdings = self.repository.get_platform_holdings(user_id, platform)?;
                return Ok(Portfolio::from_holdings(holdings, stored_at));
            }
        }
        let snapshot = self.refresh_snapshot(ctx, user_id).await?;
        Ok(snapshot.for_platform(platform))
    }

    async fn refresh_portfolio(&self, ctx: &FetchContext, user_id: &str) -> Result<()> {
        self.refresh_snapshot(ctx, user_id).await.map(|_| ())
    }
}
