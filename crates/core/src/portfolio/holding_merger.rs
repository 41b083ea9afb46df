//! Deduplication of holdings reported by several brokers.
//!
//! Holdings are grouped by [`Holding::identity_key`], in first-seen order.
//! Inside a group, records from the same platform are accumulated into one
//! (see [`accumulate_same_platform`]); if the group still spans several
//! platforms, the most recently updated one wins wholesale (see
//! [`resolve_cross_platform`]).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::portfolio_model::Holding;

/// Merges holding lists using the current time for accumulated records.
pub fn merge_holdings(lists: Vec<Vec<Holding>>) -> Vec<Holding> {
    merge_holdings_at(lists, Utc::now())
}

/// Merges holding lists, stamping accumulated records with `now`.
pub fn merge_holdings_at(lists: Vec<Vec<Holding>>, now: DateTime<Utc>) -> Vec<Holding> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Holding>> = HashMap::new();

    for holding in lists.into_iter().flatten() {
        let key = holding.identity_key();
        match groups.get_mut(&key) {
            Some(group) => group.push(holding),
            None => {
                order.push(key.clone());
                groups.insert(key, vec![holding]);
            }
        }
    }

    order
        .iter()
        .filter_map(|key| groups.remove(key))
        .filter_map(|group| merge_group(group, now))
        .collect()
}

/// A platform's contribution to a group: its merged record and the newest
/// source timestamp behind it.
struct PlatformEntry {
    newest: DateTime<Utc>,
    holding: Holding,
}

fn merge_group(group: Vec<Holding>, now: DateTime<Utc>) -> Option<Holding> {
    if group.len() == 1 {
        return group.into_iter().next();
    }

    let mut by_platform: Vec<Vec<Holding>> = Vec::new();
    for holding in group {
        match by_platform
            .iter_mut()
            .find(|records| records[0].platform == holding.platform)
        {
            Some(records) => records.push(holding),
            None => by_platform.push(vec![holding]),
        }
    }

    let entries: Vec<PlatformEntry> = by_platform
        .into_iter()
        .filter_map(|records| {
            let newest = records.iter().map(|h| h.last_updated).max()?;
            let holding = if records.len() == 1 {
                records.into_iter().next()?
            } else {
                accumulate_same_platform(&records, now)?
            };
            Some(PlatformEntry { newest, holding })
        })
        .collect();

    most_recent_index(entries.iter().map(|e| e.newest))
        .and_then(|index| entries.into_iter().nth(index))
        .map(|entry| entry.holding)
}

/// Index of the latest timestamp; ties go to the later entry.
fn most_recent_index(timestamps: impl Iterator<Item = DateTime<Utc>>) -> Option<usize> {
    let mut best: Option<(usize, DateTime<Utc>)> = None;
    for (index, timestamp) in timestamps.enumerate() {
        match best {
            Some((_, current)) if timestamp < current => {}
            _ => best = Some((index, timestamp)),
        }
    }
    best.map(|(index, _)| index)
}

/// Same-platform accumulation policy.
///
/// Sums quantity, current value, day change, and P&L; derives the average
/// price and day change percentage from the sums; keeps the name, platform,
/// type, and last traded price of the most recent record. Returns `None` for an
/// empty slice.
pub fn accumulate_same_platform(records: &[Holding], now: DateTime<Utc>) -> Option<Holding> {
    let latest = most_recent_index(records.iter().map(|h| h.last_updated))?;
    let base = &records[latest];

    let quantity: Decimal = records.iter().map(|h| h.quantity).sum();
    let current_value: Decimal = records.iter().map(|h| h.current_value).sum();
    let day_change: Decimal = records.iter().map(|h| h.day_change).sum();
    let total_pnl: Decimal = records.iter().map(|h| h.total_pnl).sum();

    let average_price = if quantity.is_zero() {
        Decimal::ZERO
    } else {
        current_value.checked_div(quantity).unwrap_or(Decimal::ZERO)
    };

    let previous_value = current_value - day_change;
    let day_change_percent = if previous_value.is_zero() {
        Decimal::ZERO
    } else {
        day_change
            .checked_div(previous_value)
            .map(|ratio| ratio * Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO)
    };

    Some(Holding {
        item_name: base.item_name.clone(),
        isin: base.isin.clone(),
        quantity,
        average_price,
        last_traded_price: base.last_traded_price,
        current_value,
        day_change,
        day_change_percent,
        total_pnl,
        platform: base.platform,
        holding_type: base.holding_type,
        last_updated: now,
    })
}

/// Cross-platform collision policy: the most recently updated record wins
/// unchanged. Ties go to the later record. Returns `None` for an empty slice.
pub fn resolve_cross_platform(candidates: &[Holding]) -> Option<Holding> {
    most_recent_index(candidates.iter().map(|h| h.last_updated))
        .map(|index| candidates[index].clone())
}
