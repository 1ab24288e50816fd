//! In-process store with the same uniqueness guarantees as the Postgres schema.
//!
//! All tables sit behind a single lock so each trait call is atomic, which is
//! the same contract the database gives for single statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{NewUser, Session, User, UserPreferences};
use crate::db::store::{SessionStore, StoreError, UserStore};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    users_by_email: HashMap<String, Uuid>,
    preferences: HashMap<Uuid, UserPreferences>,
    sessions: HashMap<Uuid, Session>,
    sessions_by_token: HashMap<String, Uuid>,
}

impl Tables {
    fn insert_user(&mut self, user: &User) {
        self.users_by_email.insert(user.email.clone(), user.id);
        self.users.insert(user.id, user.clone());
    }

    fn remove_user(&mut self, user: &User) {
        self.users_by_email.remove(&user.email);
        self.users.remove(&user.id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_preferences: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the expiry of the session holding `token`. Returns false when
    /// there is no such session.
    pub async fn set_session_expiry(&self, token: &str, expires_at: DateTime<Utc>) -> bool {
        let mut tables = self.tables.write().await;
        let Some(id) = tables.sessions_by_token.get(token).copied() else {
            return false;
        };
        match tables.sessions.get_mut(&id) {
            Some(session) => {
                session.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    /// The next preferences write fails with a backend error, as a storage fault would.
    pub fn fail_next_preferences_write(&self) {
        self.fail_preferences.store(true, Ordering::SeqCst);
    }

    fn insert_preferences(
        &self,
        tables: &mut Tables,
        prefs: UserPreferences,
    ) -> Result<UserPreferences, StoreError> {
        if self.fail_preferences.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("preferences write failed".into()));
        }
        if tables.preferences.contains_key(&prefs.user_id) {
            return Err(StoreError::Duplicate("user_preferences_pkey".into()));
        }
        tables.preferences.insert(prefs.user_id, prefs.clone());
        Ok(prefs)
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn find_preferences(&self, user_id: Uuid) -> Option<UserPreferences> {
        self.tables.read().await.preferences.get(&user_id).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user_with_preferences(
        &self,
        user: NewUser,
    ) -> Result<(User, UserPreferences), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.users_by_email.contains_key(&user.email) {
            return Err(StoreError::Duplicate("users_email_key".into()));
        }

        let user = user.into_user();
        tables.insert_user(&user);

        // Both rows or neither
        match self.insert_preferences(&mut tables, UserPreferences::empty(user.id)) {
            Ok(prefs) => Ok((user, prefs)),
            Err(e) => {
                tables.remove_user(&user);
                Err(e)
            }
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users_by_email
            .get(email)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<Session, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions_by_token.contains_key(&session.token) {
            return Err(StoreError::Duplicate("user_sessions_token_key".into()));
        }
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate("user_sessions_pkey".into()));
        }

        tables.sessions_by_token.insert(session.token.clone(), session.id);
        tables.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions_by_token
            .get(token)
            .and_then(|id| tables.sessions.get(id))
            .cloned())
    }

    async fn rotate_session_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let mut tables = self.tables.write().await;
        let matches = tables
            .sessions
            .get(&id)
            .map(|s| s.token == old_token)
            .unwrap_or(false);
        if !matches {
            return Ok(None);
        }
        if tables.sessions_by_token.contains_key(new_token) {
            return Err(StoreError::Duplicate("user_sessions_token_key".into()));
        }

        tables.sessions_by_token.remove(old_token);
        tables.sessions_by_token.insert(new_token.to_string(), id);
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend("session index out of sync".into()))?;
        session.token = new_token.to_string();
        session.expires_at = expires_at;
        Ok(Some(session.clone()))
    }

    async fn delete_session_by_token(&self, token: &str) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.sessions_by_token.remove(token) {
            Some(id) => Ok(tables.sessions.remove(&id).map_or(0, |_| 1)),
            None => Ok(0),
        }
    }

    async fn delete_session(&self, id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.sessions.remove(&id) {
            Some(session) => {
                tables.sessions_by_token.remove(&session.token);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let expired: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .cloned()
            .collect();

        for session in &expired {
            tables.sessions.remove(&session.id);
            tables.sessions_by_token.remove(&session.token);
        }
        Ok(expired.len() as u64)
    }
}
