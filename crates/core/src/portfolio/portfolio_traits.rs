use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::aggregator::FetchContext;
use super::portfolio_model::{Holding, HoldingType, Portfolio};
use crate::brokers::BrokerType;
use crate::errors::Result;

/// Trait defining the contract for portfolio read operations.
#[async_trait]
pub trait PortfolioServiceTrait: Send + Sync {
    /// Returns the user's portfolio, refreshing it when forced or stale, limited
    /// to `type_filter` when given.
    async fn get_portfolio(
        &self,
        ctx: &FetchContext,
        user_id: &str,
        force_refresh: bool,
        type_filter: Option<HoldingType>,
    ) -> Result<Portfolio>;

    /// Same freshness rules as `get_portfolio`, limited to one broker's holdings.
    async fn get_platform_portfolio(
        &self,
        ctx: &FetchContext,
        user_id: &str,
        platform: BrokerType,
        force_refresh: bool,
    ) -> Result<Portfolio>;

    /// Fetches from every connected broker and stores a new snapshot.
    async fn refresh_portfolio(&self, ctx: &FetchContext, user_id: &str) -> Result<()>;
}

/// Durable store holding the last complete snapshot per user.
#[async_trait]
pub trait PortfolioRepositoryTrait: Send + Sync {
    /// Replaces every stored holding for `user_id` and records `snapshot_at` as the
    /// snapshot time. Returns the number of holdings written.
    async fn save_holdings(
        &self,
        user_id: &str,
        holdings: Vec<Holding>,
        snapshot_at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Stored holdings in merge order.
    fn get_holdings(&self, user_id: &str) -> Result<Vec<Holding>>;

    fn get_platform_holdings(&self, user_id: &str, platform: BrokerType) -> Result<Vec<Holding>>;

    fn get_holdings_by_type(
        &self,
        user_id: &str,
        holding_type: HoldingType,
    ) -> Result<Vec<Holding>>;

    /// Time of the last saved snapshot, `None` when the user has never been saved.
    fn get_portfolio_last_updated(&self, user_id: &str) -> Result<Option<DateTime<Utc>>>;
}
