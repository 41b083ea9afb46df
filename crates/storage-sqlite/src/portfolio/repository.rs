use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::upsert::excluded;
use diesel::SqliteConnection;
use finsight_core::portfolio::PortfolioRepositoryTrait;
use finsight_core::{BrokerType, Holding, HoldingType, Result};
use log::{debug, warn};
use std::sync::Arc;

use super::model::{PortfolioHoldingDB, PortfolioSnapshotDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::{IntoCore, StorageError};
use crate::schema::{portfolio_holdings, portfolio_snapshots};

/// Rows per INSERT, kept under SQLite's bound-parameter limit.
const INSERT_CHUNK: usize = 500;

pub struct PortfolioRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl PortfolioRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        PortfolioRepository { pool, writer }
    }

    fn load_holdings(
        &self,
        user: &str,
        platform: Option<&str>,
        holding_type: Option<&str>,
    ) -> Result<Vec<Holding>> {
        let mut conn = get_connection(&self.pool)?;

        let mut query = portfolio_holdings::table
            .filter(portfolio_holdings::user_id.eq(user))
            .select(PortfolioHoldingDB::as_select())
            .order(portfolio_holdings::position.asc())
            .into_boxed();

        if let Some(platform) = platform {
            query = query.filter(portfolio_holdings::platform.eq(platform));
        }
        if let Some(holding_type) = holding_type {
            query = query.filter(portfolio_holdings::holding_type.eq(holding_type));
        }

        let rows = query.load::<PortfolioHoldingDB>(&mut conn).into_core()?;
        Ok(Self::into_domain(rows))
    }

    /// Converts loaded rows, skipping any with an unknown platform or type.
    fn into_domain(rows: Vec<PortfolioHoldingDB>) -> Vec<Holding> {
        rows.into_iter()
            .filter_map(|row| {
                let key = format!("{}/{}", row.user_id, row.position);
                match Holding::try_from(row) {
                    Ok(holding) => Some(holding),
                    Err(e) => {
                        warn!("Skipping unreadable holding {}: {}", key, e);
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl PortfolioRepositoryTrait for PortfolioRepository {
    async fn save_holdings(
        &self,
        user: &str,
        holdings: Vec<Holding>,
        snapshot_at: DateTime<Utc>,
    ) -> Result<usize> {
        let user_owned = user.to_string();
        let rows: Vec<PortfolioHoldingDB> = holdings
            .into_iter()
            .enumerate()
            .map(|(position, holding)| PortfolioHoldingDB::from_domain(user, position as i32, holding))
            .collect();

        let written = self
            .writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                diesel::delete(
                    portfolio_holdings::table.filter(portfolio_holdings::user_id.eq(user_owned.as_str())),
                )
                .execute(conn)
                .map_err(StorageError::from)?;

                let mut written = 0;
                for chunk in rows.chunks(INSERT_CHUNK) {
                    written += diesel::insert_into(portfolio_holdings::table)
                        .values(chunk)
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }

                let snapshot = PortfolioSnapshotDB {
                    user_id: user_owned,
                    refreshed_at: snapshot_at.naive_utc(),
                };
                diesel::insert_into(portfolio_snapshots::table)
                    .values(&snapshot)
                    .on_conflict(portfolio_snapshots::user_id)
                    .do_update()
                    .set(portfolio_snapshots::refreshed_at.eq(excluded(portfolio_snapshots::refreshed_at)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(written)
            })
            .await?;

        debug!("Stored {} holdings for user {}", written, user);
        Ok(written)
    }

    fn get_holdings(&self, user: &str) -> Result<Vec<Holding>> {
        self.load_holdings(user, None, None)
    }

    fn get_platform_holdings(&self, user: &str, platform: BrokerType) -> Result<Vec<Holding>> {
        self.load_holdings(user, Some(platform.as_str()), None)
    }

    fn get_holdings_by_type(&self, user: &str, holding_type: HoldingType) -> Result<Vec<Holding>> {
        self.load_holdings(user, None, Some(holding_type.as_str()))
    }

    fn get_portfolio_last_updated(&self, user: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = get_connection(&self.pool)?;
        let refreshed_at = portfolio_snapshots::table
            .find(user)
            .select(portfolio_snapshots::refreshed_at)
            .first::<NaiveDateTime>(&mut conn)
            .optional()
            .into_core()?;
        Ok(refreshed_at.map(|at| at.and_utc()))
    }
}
