use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::upsert::excluded;
use diesel::SqliteConnection;
use finsight_core::brokers::{
    BrokerCredential, BrokerError, CredentialsRepositoryTrait, NewBrokerCredential,
};
use finsight_core::{BrokerType, Result};
use log::warn;
use std::sync::Arc;

use super::model::BrokerCredentialDB;
use crate::db::{get_connection, WriteHandle};
use crate::errors::{IntoCore, StorageError};
use crate::schema::broker_credentials;
use crate::schema::broker_credentials::dsl::*;

pub struct CredentialsRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl CredentialsRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        CredentialsRepository { pool, writer }
    }

    /// Converts loaded rows, skipping any with an unknown broker type.
    fn into_domain(rows: Vec<BrokerCredentialDB>) -> Vec<BrokerCredential> {
        rows.into_iter()
            .filter_map(|row| {
                let key = format!("{}/{}", row.user_id, row.broker_type);
                match BrokerCredential::try_from(row) {
                    Ok(credential) => Some(credential),
                    Err(e) => {
                        warn!("Skipping unreadable credential {}: {}", key, e);
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl CredentialsRepositoryTrait for CredentialsRepository {
    async fn save_credentials(&self, credential: NewBrokerCredential) -> Result<BrokerCredential> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<BrokerCredential> {
                let row = BrokerCredentialDB::from_new(credential, Utc::now().naive_utc());

                let saved = diesel::insert_into(broker_credentials::table)
                    .values(&row)
                    .on_conflict((user_id, broker_type))
                    .do_update()
                    .set((
                        api_key.eq(excluded(api_key)),
                        api_secret.eq(excluded(api_secret)),
                        access_token.eq(excluded(access_token)),
                        refresh_token.eq(excluded(refresh_token)),
                        token_expiry.eq(excluded(token_expiry)),
                        updated_at.eq(excluded(updated_at)),
                    ))
                    .returning(BrokerCredentialDB::as_returning())
                    .get_result(conn)
                    .map_err(StorageError::from)?;
                BrokerCredential::try_from(saved)
            })
            .await
    }

    fn get_credentials(
        &self,
        user: &str,
        broker: BrokerType,
    ) -> Result<Option<BrokerCredential>> {
        let mut conn = get_connection(&self.pool)?;
        let row = broker_credentials
            .find((user, broker.as_str()))
            .select(BrokerCredentialDB::as_select())
            .first::<BrokerCredentialDB>(&mut conn)
            .optional()
            .into_core()?;
        row.map(BrokerCredential::try_from).transpose()
    }

    async fn update_access_token(
        &self,
        user: &str,
        broker: BrokerType,
        new_access_token: &str,
        new_refresh_token: Option<&str>,
        new_expiry: DateTime<Utc>,
    ) -> Result<()> {
        let user_owned = user.to_string();
        let token_owned = new_access_token.to_string();
        let refresh_owned = new_refresh_token.map(str::to_string);

        let updated = {
            let user_owned = user_owned.clone();
            self.writer
                .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                    Ok(diesel::update(broker_credentials.find((user_owned, broker.as_str())))
                        .set((
                            access_token.eq(Some(token_owned)),
                            refresh_token.eq(refresh_owned),
                            token_expiry.eq(Some(new_expiry.naive_utc())),
                            updated_at.eq(Utc::now().naive_utc()),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?)
                })
                .await?
        };

        if updated == 0 {
            return Err(BrokerError::CredentialNotFound {
                user_id: user_owned,
                broker,
            }
            .into());
        }
        Ok(())
    }

    fn has_credentials(&self, user: &str, broker: BrokerType) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let count: i64 = broker_credentials
            .find((user, broker.as_str()))
            .count()
            .get_result(&mut conn)
            .into_core()?;
        Ok(count > 0)
    }

    async fn delete_credentials(&self, user: &str, broker: BrokerType) -> Result<usize> {
        let user_owned = user.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(broker_credentials.find((user_owned, broker.as_str())))
                    .execute(conn)
                    .map_err(StorageError::from)?)
            })
            .await
    }

    fn get_credentials_for_all_users(&self) -> Result<Vec<BrokerCredential>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = broker_credentials
            .select(BrokerCredentialDB::as_select())
            .order((user_id.asc(), broker_type.asc()))
            .load::<BrokerCredentialDB>(&mut conn)
            .into_core()?;
        Ok(Self::into_domain(rows))
    }

    fn get_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<BrokerCredential>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = broker_credentials
            .filter(token_expiry.is_not_null())
            .filter(token_expiry.lt(now.naive_utc()))
            .select(BrokerCredentialDB::as_select())
            .order((user_id.asc(), broker_type.asc()))
            .load::<BrokerCredentialDB>(&mut conn)
            .into_core()?;
        Ok(Self::into_domain(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations, spawn_writer};
    use chrono::{Duration, TimeZone};
    use diesel::RunQueryDsl;
    use finsight_core::errors::Error;
    use tempfile::tempdir;

    async fn create_test_repository() -> (
        CredentialsRepository,
        Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        tempfile::TempDir,
    ) {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        crate::db::init(&db_path_str).expect("Failed to init database");
        let pool = create_pool(&db_path_str).expect("Failed to create pool");
        run_migrations(&pool).expect("Failed to run migrations");
        let writer = spawn_writer((*pool).clone());

        let repo = CredentialsRepository::new(Arc::clone(&pool), writer);
        (repo, pool, temp_dir)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn new_credential(user: &str, broker: BrokerType, expiry: DateTime<Utc>) -> NewBrokerCredential {
        NewBrokerCredential {
            user_id: user.to_string(),
            broker_type: broker,
            api_key: format!("{}-key", user),
            api_secret: format!("{}-secret", user),
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            token_expiry: expiry,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_credentials() {
        let (repo, _pool, _dir) = create_test_repository().await;

        let saved = repo
            .save_credentials(new_credential("u1", BrokerType::Zerodha, at(10)))
            .await
            .unwrap();
        assert_eq!(saved.access_token.as_deref(), Some("access-1"));

        let loaded = repo
            .get_credentials("u1", BrokerType::Zerodha)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.api_key, "u1-key");
        assert_eq!(loaded.api_secret, "u1-secret");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(loaded.token_expiry, Some(at(10)));
        assert!(repo.has_credentials("u1", BrokerType::Zerodha).unwrap());

        assert!(repo
            .get_credentials("u1", BrokerType::IciciDirect)
            .unwrap()
            .is_none());
        assert!(!repo.has_credentials("u2", BrokerType::Zerodha).unwrap());
    }

    #[tokio::test]
    async fn test_save_replaces_existing_pair() {
        let (repo, _pool, _dir) = create_test_repository().await;

        let first = repo
            .save_credentials(new_credential("u1", BrokerType::Zerodha, at(10)))
            .await
            .unwrap();

        let mut replacement = new_credential("u1", BrokerType::Zerodha, at(20));
        replacement.api_key = "new-key".to_string();
        replacement.access_token = "access-2".to_string();
        replacement.refresh_token = None;
        let second = repo.save_credentials(replacement).await.unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.api_key, "new-key");
        assert_eq!(second.refresh_token, None);
        assert_eq!(second.token_expiry, Some(at(20)));
        assert_eq!(repo.get_credentials_for_all_users().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_access_token() {
        let (repo, _pool, _dir) = create_test_repository().await;
        repo.save_credentials(new_credential("u1", BrokerType::IciciDirect, at(1)))
            .await
            .unwrap();

        repo.update_access_token("u1", BrokerType::IciciDirect, "access-2", Some("refresh-2"), at(13))
            .await
            .unwrap();

        let loaded = repo
            .get_credentials("u1", BrokerType::IciciDirect)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("access-2"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(loaded.token_expiry, Some(at(13)));
        assert_eq!(loaded.api_key, "u1-key");
    }

    #[tokio::test]
    async fn test_update_access_token_for_missing_pair() {
        let (repo, _pool, _dir) = create_test_repository().await;

        let err = repo
            .update_access_token("ghost", BrokerType::Zerodha, "t", None, at(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Broker(BrokerError::CredentialNotFound { .. })
        ));
        assert!(repo.get_credentials_for_all_users().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_credentials_counts_rows() {
        let (repo, _pool, _dir) = create_test_repository().await;
        repo.save_credentials(new_credential("u1", BrokerType::Zerodha, at(10)))
            .await
            .unwrap();
        repo.save_credentials(new_credential("u1", BrokerType::IciciDirect, at(10)))
            .await
            .unwrap();

        assert_eq!(repo.delete_credentials("u1", BrokerType::Zerodha).await.unwrap(), 1);
        assert_eq!(repo.delete_credentials("u1", BrokerType::Zerodha).await.unwrap(), 0);
        assert!(repo.has_credentials("u1", BrokerType::IciciDirect).unwrap());
    }

    #[tokio::test]
    async fn test_get_expired_tokens() {
        let (repo, pool, _dir) = create_test_repository().await;
        repo.save_credentials(new_credential("expired", BrokerType::Zerodha, at(8)))
            .await
            .unwrap();
        repo.save_credentials(new_credential("valid", BrokerType::Zerodha, at(12)))
            .await
            .unwrap();
        repo.save_credentials(new_credential("no-expiry", BrokerType::IciciDirect, at(8)))
            .await
            .unwrap();

        let mut conn = get_connection(&pool).unwrap();
        diesel::sql_query("UPDATE broker_credentials SET token_expiry = NULL WHERE user_id = 'no-expiry'")
            .execute(&mut conn)
            .unwrap();

        let expired = repo.get_expired_tokens(at(10)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, "expired");

        let later = repo.get_expired_tokens(at(10) + Duration::hours(4)).unwrap();
        assert_eq!(later.len(), 2);
    }

    #[tokio::test]
    async fn test_listing_skips_unknown_broker_rows() {
        let (repo, pool, _dir) = create_test_repository().await;
        repo.save_credentials(new_credential("u1", BrokerType::Zerodha, at(10)))
            .await
            .unwrap();

        let mut conn = get_connection(&pool).unwrap();
        diesel::sql_query(
            "INSERT INTO broker_credentials (user_id, broker_type, api_key, api_secret) \
             VALUES ('u2', 'upstox', 'k', 's')",
        )
        .execute(&mut conn)
        .unwrap();

        let all = repo.get_credentials_for_all_users().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "u1");
    }
}
