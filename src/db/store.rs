//! Storage seams used by the authentication core.
//!
//! Every operation is a single atomic round-trip against the backing store.
//! Nothing above this layer caches rows or holds locks across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::{NewUser, Session, User, UserPreferences};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Carries the constraint name.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts the user and an empty preferences record as one unit. Fails
    /// with `StoreError::Duplicate` when the email is already taken.
    async fn create_user_with_preferences(
        &self,
        user: NewUser,
    ) -> Result<(User, UserPreferences), StoreError>;

    /// `email` must already be normalized.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<Session, StoreError>;

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError>;

    /// Replaces token and expiry of session `id` in place, but only while it
    /// still holds `old_token`. Returns `None` when no row matched.
    async fn rotate_session_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    /// Returns the number of rows removed; zero is not an error.
    async fn delete_session_by_token(&self, token: &str) -> Result<u64, StoreError>;

    async fn delete_session(&self, id: Uuid) -> Result<u64, StoreError>;

    /// Removes every session with `expires_at < now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
