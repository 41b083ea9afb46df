//! SQLite storage implementation for broker credentials.

mod model;
mod repository;

pub use model::BrokerCredentialDB;
pub use repository::CredentialsRepository;
