//! SQLite storage implementation for stored portfolio snapshots.

mod model;
mod repository;

pub use model::{PortfolioHoldingDB, PortfolioSnapshotDB};
pub use repository::PortfolioRepository;
