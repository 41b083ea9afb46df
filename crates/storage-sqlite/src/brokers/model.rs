//! Database models for broker credentials.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use finsight_core::brokers::{BrokerCredential, NewBrokerCredential};
use finsight_core::errors::Error;
use finsight_core::BrokerType;

/// Database model for a stored broker credential.
///
/// Timestamps are stored as naive UTC.
#[derive(Queryable, Selectable, Insertable, Identifiable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::broker_credentials)]
#[diesel(primary_key(user_id, broker_type))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BrokerCredentialDB {
    pub user_id: String,
    pub broker_type: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl BrokerCredentialDB {
    pub fn from_new(domain: NewBrokerCredential, now: NaiveDateTime) -> Self {
        Self {
            user_id: domain.user_id,
            broker_type: domain.broker_type.as_str().to_string(),
            api_key: domain.api_key,
            api_secret: domain.api_secret,
            access_token: Some(domain.access_token),
            refresh_token: domain.refresh_token,
            token_expiry: Some(domain.token_expiry.naive_utc()),
            created_at: now,
            updated_at: now,
        }
    }
}

impl TryFrom<BrokerCredentialDB> for BrokerCredential {
    type Error = Error;

    fn try_from(db: BrokerCredentialDB) -> Result<Self, Self::Error> {
        let broker_type: BrokerType = db.broker_type.parse()?;
        Ok(Self {
            user_id: db.user_id,
            broker_type,
            api_key: db.api_key,
            api_secret: db.api_secret,
            access_token: db.access_token.filter(|t| !t.is_empty()),
            refresh_token: db.refresh_token.filter(|t| !t.is_empty()),
            token_expiry: db.token_expiry.map(|t| t.and_utc()),
            created_at: db.created_at.and_utc(),
            updated_at: db.updated_at.and_utc(),
        })
    }
}
