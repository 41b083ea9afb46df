//! Database models for stored portfolio holdings.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use finsight_core::errors::Error;
use finsight_core::{BrokerType, Holding, HoldingType};
use rust_decimal::Decimal;
use std::str::FromStr;

/// One merged holding row. `position` keeps the merge order within a user.
///
/// Decimal columns are stored as TEXT to avoid float rounding.
#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::portfolio_holdings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PortfolioHoldingDB {
    pub user_id: String,
    pub position: i32,
    pub item_name: String,
    pub isin: String,
    pub quantity: String,
    pub average_price: String,
    pub last_traded_price: String,
    pub current_value: String,
    pub day_change: String,
    pub day_change_percent: String,
    pub total_pnl: String,
    pub platform: String,
    pub holding_type: String,
    pub last_updated: NaiveDateTime,
}

#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::portfolio_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PortfolioSnapshotDB {
    pub user_id: String,
    pub refreshed_at: NaiveDateTime,
}

impl PortfolioHoldingDB {
    pub fn from_domain(user_id: &str, position: i32, holding: Holding) -> Self {
        Self {
            user_id: user_id.to_string(),
            position,
            item_name: holding.item_name,
            isin: holding.isin,
            quantity: holding.quantity.to_string(),
            average_price: holding.average_price.to_string(),
            last_traded_price: holding.last_traded_price.to_string(),
            current_value: holding.current_value.to_string(),
            day_change: holding.day_change.to_string(),
            day_change_percent: holding.day_change_percent.to_string(),
            total_pnl: holding.total_pnl.to_string(),
            platform: holding.platform.as_str().to_string(),
            holding_type: holding.holding_type.as_str().to_string(),
            last_updated: holding.last_updated.naive_utc(),
        }
    }
}

impl TryFrom<PortfolioHoldingDB> for Holding {
    type Error = Error;

    fn try_from(db: PortfolioHoldingDB) -> Result<Self, Self::Error> {
        let platform: BrokerType = db.platform.parse()?;
        let holding_type: HoldingType = db.holding_type.parse()?;
        Ok(Self {
            item_name: db.item_name,
            isin: db.isin,
            quantity: Decimal::from_str(&db.quantity).unwrap_or_default(),
            average_price: Decimal::from_str(&db.average_price).unwrap_or_default(),
            last_traded_price: Decimal::from_str(&db.last_traded_price).unwrap_or_default(),
            current_value: Decimal::from_str(&db.current_value).unwrap_or_default(),
            day_change: Decimal::from_str(&db.day_change).unwrap_or_default(),
            day_change_percent: Decimal::from_str(&db.day_change_percent).unwrap_or_default(),
            total_pnl: Decimal::from_str(&db.total_pnl).unwrap_or_default(),
            platform,
            holding_type,
            last_updated: db.last_updated.and_utc(),
        })
    }
}
