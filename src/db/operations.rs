use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::models::{NewUser, Session, User, UserPreferences};
use crate::db::store::{SessionStore, StoreError, UserStore};
use crate::error::AppError;

const USER_COLUMNS: &str =
    "id, email, password_hash, first_name, last_name, phone, created_at, updated_at";
const SESSION_COLUMNS: &str = "id, user_id, token, expires_at, created_at";

/// Postgres-backed implementation of the user and session stores.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| AppError::InternalError(format!("Migration failed: {}", e)))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_transaction(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(store_error)
    }

    async fn insert_user_with_transaction(
        user: &User,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, password_hash, first_name, last_name, phone, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(user.created_at)
        .bind(user.updated_at)
        .fetch_one(&mut **transaction)
        .await
        .map_err(store_error)
    }

    async fn insert_preferences_with_transaction(
        prefs: &UserPreferences,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<UserPreferences, StoreError> {
        sqlx::query_as::<_, UserPreferences>(
            r#"
            INSERT INTO user_preferences (user_id, preferred_venue_id, favorite_drinks, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING user_id, preferred_venue_id, favorite_drinks, created_at
            "#,
        )
        .bind(prefs.user_id)
        .bind(prefs.preferred_venue_id)
        .bind(&prefs.favorite_drinks)
        .bind(prefs.created_at)
        .fetch_one(&mut **transaction)
        .await
        .map_err(store_error)
    }
}

#[async_trait]
impl UserStore for DbOperations {
    async fn create_user_with_preferences(
        &self,
        user: NewUser,
    ) -> Result<(User, UserPreferences), StoreError> {
        let user = user.into_user();
        let prefs = UserPreferences::empty(user.id);

        let mut transaction = self.begin_transaction().await?;

        let result = async {
            let user = Self::insert_user_with_transaction(&user, &mut transaction).await?;
            let prefs = Self::insert_preferences_with_transaction(&prefs, &mut transaction).await?;
            Ok::<_, StoreError>((user, prefs))
        }
        .await;

        match result {
            Ok(created) => {
                transaction.commit().await.map_err(store_error)?;
                Ok(created)
            }
            Err(e) => {
                transaction.rollback().await.map_err(store_error)?;
                Err(e)
            }
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(store_error)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl SessionStore for DbOperations {
    async fn insert_session(&self, session: &Session) -> Result<Session, StoreError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            INSERT INTO user_sessions (id, user_id, token, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.token)
        .bind(session.expires_at)
        .bind(session.created_at)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(store_error)
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(store_error)
    }

    async fn rotate_session_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE user_sessions SET token = $1, expires_at = $2
            WHERE id = $3 AND token = $4
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(new_token)
        .bind(expires_at)
        .bind(id)
        .bind(old_token)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(store_error)
    }

    async fn delete_session_by_token(&self, token: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE token = $1")
            .bind(token)
            .execute(self.pool.as_ref())
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_session(&self, id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at < $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Duplicate(db_err.constraint().unwrap_or("unique").to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
