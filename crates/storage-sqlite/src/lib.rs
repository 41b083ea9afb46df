//! SQLite storage implementation for FinSight.
//!
//! This is the only crate with Diesel dependencies. It implements
//! `CredentialsRepositoryTrait` and `PortfolioRepositoryTrait` from
//! `finsight-core` and owns:
//! - Database connection pooling and PRAGMA setup
//! - Embedded Diesel migrations
//! - The single-writer actor used for every write
//!
//! ```text
//! core (domain)          connect (broker APIs)
//!       │
//!       ▼
//! storage-sqlite (this crate)
//!       │
//!       ▼
//!   SQLite DB
//! ```

pub mod brokers;
pub mod db;
pub mod errors;
pub mod portfolio;
pub mod schema;

pub use brokers::CredentialsRepository;
pub use portfolio::PortfolioRepository;
pub use db::{
    create_pool, get_connection, init, run_migrations, spawn_writer, DbConnection, DbPool,
    WriteHandle,
};
pub use errors::{IntoCore, StorageError};

pub use finsight_core::errors::{DatabaseError, Error, Result};
