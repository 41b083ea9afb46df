//! Portfolio module - holding models, the merger, and the multi-broker aggregator.

mod aggregator;
pub mod holding_merger;
mod portfolio_model;
mod portfolio_traits;


// Re-export the public interface
pub use aggregator::{AggregatorConfig, FetchContext, PortfolioAggregator, TimeoutPolicy};
pub use holding_merger::{merge_holdings, merge_holdings_at};
pub use portfolio_model::{Holding, HoldingType, Portfolio};
pub use portfolio_traits::{PortfolioRepositoryTrait, PortfolioServiceTrait};
