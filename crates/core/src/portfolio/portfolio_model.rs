//! Portfolio domain models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::brokers::BrokerType;
use crate::errors::{Error, ValidationError};

/// Asset class of a holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldingType {
    Stock,
    MutualFund,
}

impl HoldingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldingType::Stock => "stock",
            HoldingType::MutualFund => "mutualfund",
        }
    }

    /// Parses a request filter. `"all"` and the empty string mean no filter.
    pub fn parse_filter(value: &str) -> Result<Option<HoldingType>, Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(None),
            other => other.parse().map(Some),
        }
    }
}

impl fmt::Display for HoldingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stock" => Ok(HoldingType::Stock),
            "mutualfund" | "mutual_fund" => Ok(HoldingType::MutualFund),
            other => Err(Error::Validation(ValidationError::InvalidInput(format!(
                "unknown holding type '{}'",
                other
            )))),
        }
    }
}

/// One normalized holding or position reported by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub item_name: String,
    #[serde(default)]
    pub isin: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub last_traded_price: Decimal,
    pub current_value: Decimal,
    pub day_change: Decimal,
    pub day_change_percent: Decimal,
    #[serde(rename = "totalPnL")]
    pub total_pnl: Decimal,
    pub platform: BrokerType,
    #[serde(rename = "type")]
    pub holding_type: HoldingType,
    pub last_updated: DateTime<Utc>,
}

impl Holding {
    /// Deduplication key: the ISIN when known, otherwise platform and name.
    pub fn identity_key(&self) -> String {
        if self.isin.is_empty() {
            format!("{}:{}", self.platform, self.item_name)
        } else {
            self.isin.clone()
        }
    }
}

/// Aggregated view of a user's holdings across brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub holdings: Vec<Holding>,
    pub total_value: Decimal,
    pub total_day_change: Decimal,
    pub total_day_change_pct: Decimal,
    #[serde(rename = "totalPnL")]
    pub total_pnl: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Portfolio {
    /// Builds a portfolio whose totals are the sums over `holdings`.
    pub fn from_holdings(holdings: Vec<Holding>, last_updated: DateTime<Utc>) -> Self {
        let total_value: Decimal = holdings.iter().map(|h| h.current_value).sum();
        let total_day_change: Decimal = holdings.iter().map(|h| h.day_change).sum();
        let total_pnl: Decimal = holdings.iter().map(|h| h.total_pnl).sum();
        let total_day_change_pct = total_day_change
            .checked_div(total_value)
            .filter(|_| !total_value.is_zero())
            .map(|ratio| ratio * Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO);

        Self {
            holdings,
            total_value,
            total_day_change,
            total_day_change_pct,
            total_pnl,
            last_updated,
        }
    }

    /// Returns a copy limited to `holding_type` with totals recomputed over the subset.
    pub fn filtered(&self, holding_type: Option<HoldingType>) -> Portfolio {
        match holding_type {
            None => self.clone(),
            Some(wanted) => Portfolio::from_holdings(
                self.holdings
                    .iter()
                    .filter(|h| h.holding_type == wanted)
                    .cloned()
                    .collect(),
                self.last_updated,
            ),
        }
    }

    /// Returns a copy limited to holdings sourced from `platform`.
    pub fn for_platform(&self, platform: BrokerType) -> Portfolio {
        Portfolio::from_holdings(
            self.holdings
                .iter()
                .filter(|h| h.platform == platform)
                .cloned()
                .collect(),
            self.last_updated,
        )
    }
}
