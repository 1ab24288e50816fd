use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::password::PasswordHasher;
use crate::auth::token::{TokenCodec, TokenVerification};
use crate::db::models::{NewUser, Session, User};
use crate::db::store::{SessionStore, StoreError, UserStore};
use crate::error::AuthError;

/// Stands in for a real password hash when the login email is unknown.
const DUMMY_PASSWORD: &str = "drinkdesk-unknown-account";

/// Lower-cases and trims an email. Applied before every write and every lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

/// Result of every call that issues a token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub user: User,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    hasher: Arc<dyn PasswordHasher>,
    codec: TokenCodec,
    session_lifetime: Duration,
    dummy_hash: OnceCell<String>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        hasher: Arc<dyn PasswordHasher>,
        codec: TokenCodec,
        session_lifetime: Duration,
    ) -> Self {
        Self {
            users,
            sessions,
            hasher,
            codec,
            session_lifetime,
            dummy_hash: OnceCell::new(),
        }
    }

    pub async fn register(&self, input: RegisterInput) -> Result<AuthOutcome, AuthError> {
        let email = normalize_email(&input.email);

        // Fast path only; the unique constraint in the store is what actually decides.
        if self.users.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailExists);
        }

        let password_hash = self.hash_password(&input.password).await?;
        let new_user = NewUser {
            email,
            password_hash,
            first_name: input.first_name,
            last_name: input.last_name,
            phone: input.phone,
        };

        let (user, _prefs) = match self.users.create_user_with_preferences(new_user).await {
            Ok(created) => created,
            Err(StoreError::Duplicate(constraint)) => {
                debug!(%constraint, "Registration lost a uniqueness race");
                return Err(AuthError::EmailExists);
            }
            Err(e) => return Err(e.into()),
        };

        info!(user_id = %user.id, "User registered");
        self.issue_session(user).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthOutcome, AuthError> {
        let email = normalize_email(email);

        let Some(user) = self.users.find_user_by_email(&email).await? else {
            // Unknown accounts still cost one verification
            let dummy = self.dummy_hash().await?;
            self.verify_password(password, dummy).await?;
            warn!("Login rejected: unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify_password(password, &user.password_hash).await? {
            warn!(user_id = %user.id, "Login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        info!(user_id = %user.id, "User logged in");
        self.issue_session(user).await
    }

    /// Idempotent: a token whose session is already gone still logs out successfully.
    pub async fn logout(&self, token: Option<&str>) -> Result<(), AuthError> {
        let token = token.ok_or(AuthError::NoToken)?;
        let removed = self.sessions.delete_session_by_token(token).await?;
        debug!(removed, "Logout processed");
        Ok(())
    }

    pub async fn refresh(&self, old_token: &str) -> Result<AuthOutcome, AuthError> {
        // Expired-by-signature is rejected the same way as malformed here
        let subject = match self.codec.verify(old_token) {
            TokenVerification::Valid(subject) => subject,
            TokenVerification::Expired | TokenVerification::Malformed => {
                return Err(AuthError::InvalidToken)
            }
        };

        let session = self
            .sessions
            .find_session_by_token(old_token)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        if session.user_id != subject.user_id {
            warn!(session_id = %session.id, "Token subject does not own the session");
            return Err(AuthError::InvalidToken);
        }

        if session.is_expired() {
            self.sessions.delete_session(session.id).await?;
            info!(session_id = %session.id, "Expired session removed during refresh");
            return Err(AuthError::SessionExpired);
        }

        let user = self
            .users
            .find_user_by_id(session.user_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        let issued_at = Utc::now();
        let expires_at = issued_at + self.session_lifetime;
        let token = self
            .codec
            .mint_window(user.id, &user.email, issued_at, expires_at)?;

        // Guarded on the old token, so two concurrent refreshes cannot both win
        let rotated = self
            .sessions
            .rotate_session_token(session.id, old_token, &token, expires_at)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        info!(user_id = %user.id, session_id = %rotated.id, "Session refreshed");
        Ok(AuthOutcome {
            user,
            token: rotated.token,
            expires_at: rotated.expires_at,
        })
    }

    pub async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.users.find_user_by_id(user_id).await?)
    }

    pub fn session_lifetime(&self) -> Duration {
        self.session_lifetime
    }

    async fn issue_session(&self, user: User) -> Result<AuthOutcome, AuthError> {
        let issued_at = Utc::now();
        let token = self.codec.mint_window(
            user.id,
            &user.email,
            issued_at,
            issued_at + self.session_lifetime,
        )?;
        let session = self
            .sessions
            .insert_session(&Session::new_at(user.id, token, issued_at, self.session_lifetime))
            .await?;

        debug!(user_id = %user.id, session_id = %session.id, "Session created");
        Ok(AuthOutcome {
            user,
            token: session.token,
            expires_at: session.expires_at,
        })
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        run_blocking(move || hasher.hash(&password)).await
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        run_blocking(move || hasher.verify(&password, &hash)).await
    }

    async fn dummy_hash(&self) -> Result<&str, AuthError> {
        self.dummy_hash
            .get_or_try_init(|| self.hash_password(DUMMY_PASSWORD))
            .await
            .map(String::as_str)
    }
}

/// Argon2 work runs on the blocking pool, off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Internal(format!("Password task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::{Argon2Hasher, MockPasswordHasher};
    use crate::auth::token::Claims;
    use crate::db::MemoryStore;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    const SECRET: &str = "test_secret";

    fn service_with(store: &MemoryStore, hasher: Arc<dyn PasswordHasher>) -> AuthService {
        AuthService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            hasher,
            TokenCodec::new(SECRET),
            Duration::days(7),
        )
    }

    fn service(store: &MemoryStore) -> AuthService {
        service_with(store, Arc::new(Argon2Hasher::new()))
    }

    fn input(email: &str, password: &str) -> RegisterInput {
        RegisterInput {
            email: email.to_string(),
            password: password.to_string(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            phone: None,
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[tokio::test]
    async fn test_register_issues_session() {
        let store = MemoryStore::new();
        let auth = service(&store);

        let outcome = auth.register(input("alice@Example.com", "Secret123!")).await.unwrap();

        assert_eq!(outcome.user.email, "alice@example.com");
        assert_ne!(outcome.user.password_hash, "Secret123!");
        let session = store.find_session_by_token(&outcome.token).await.unwrap().unwrap();
        assert_eq!(session.user_id, outcome.user.id);
        assert_eq!(session.expires_at, outcome.expires_at);
        assert_eq!(session.expires_at - session.created_at, Duration::days(7));
        assert!(store.find_preferences(outcome.user.id).await.is_some());

        match TokenCodec::new(SECRET).verify(&outcome.token) {
            TokenVerification::Valid(subject) => assert_eq!(subject.user_id, outcome.user.id),
            other => panic!("unexpected verification result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_duplicate_email_ignores_case() {
        let store = MemoryStore::new();
        let auth = service(&store);

        auth.register(input("alice@example.com", "Secret123!")).await.unwrap();
        let err = auth.register(input("ALICE@example.COM", "Other123!")).await.unwrap_err();
        assert_eq!(err, AuthError::EmailExists);
    }

    #[tokio::test]
    async fn test_register_rolls_back_when_preferences_fail() {
        let store = MemoryStore::new();
        let auth = service(&store);
        store.fail_next_preferences_write();

        let err = auth.register(input("alice@example.com", "Secret123!")).await.unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
        assert!(store.find_user_by_email("alice@example.com").await.unwrap().is_none());
        assert_eq!(store.session_count().await, 0);

        let outcome = auth.register(input("alice@example.com", "Secret123!")).await.unwrap();
        assert!(store.find_preferences(outcome.user.id).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_yield_one_user() {
        let store = MemoryStore::new();
        let auth = Arc::new(service(&store));

        let a = tokio::spawn({
            let auth = auth.clone();
            async move { auth.register(input("race@example.com", "Secret123!")).await }
        });
        let b = tokio::spawn({
            let auth = auth.clone();
            async move { auth.register(input("RACE@example.com", "Secret123!")).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(AuthError::EmailExists)))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
    }

    #[tokio::test]
    async fn test_register_hashes_password_once() {
        let store = MemoryStore::new();
        let mut hasher = MockPasswordHasher::new();
        hasher
            .expect_hash()
            .withf(|password: &str| password == "Secret123!")
            .times(1)
            .returning(|_| Ok("hashed".to_string()));
        hasher.expect_verify().never();

        let auth = service_with(&store, Arc::new(hasher));
        let outcome = auth.register(input("bob@example.com", "Secret123!")).await.unwrap();
        assert_eq!(outcome.user.password_hash, "hashed");
    }

    #[tokio::test]
    async fn test_login_is_case_insensitive_and_keeps_other_sessions() {
        let store = MemoryStore::new();
        let auth = service(&store);

        let registered = auth.register(input("alice@Example.com", "Secret123!")).await.unwrap();
        let logged_in = auth.login("ALICE@EXAMPLE.COM", "Secret123!").await.unwrap();

        assert_eq!(logged_in.user.id, registered.user.id);
        assert_ne!(logged_in.token, registered.token);
        assert!(store.find_session_by_token(&registered.token).await.unwrap().is_some());
        assert_eq!(store.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let store = MemoryStore::new();
        let auth = service(&store);
        auth.register(input("alice@example.com", "Secret123!")).await.unwrap();

        let unknown = auth.login("nobody@example.com", "Secret123!").await.unwrap_err();
        let wrong = auth.login("alice@example.com", "Wrong123!").await.unwrap_err();

        assert_eq!(unknown, AuthError::InvalidCredentials);
        assert_eq!(wrong, AuthError::InvalidCredentials);
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[tokio::test]
    async fn test_login_unknown_email_still_verifies() {
        let store = MemoryStore::new();
        let mut hasher = MockPasswordHasher::new();
        hasher
            .expect_hash()
            .withf(|password: &str| password == DUMMY_PASSWORD)
            .times(1)
            .returning(|_| Ok("dummy-hash".to_string()));
        hasher
            .expect_verify()
            .withf(|password: &str, hash: &str| password == "whatever1" && hash == "dummy-hash")
            .times(2)
            .returning(|_, _| Ok(false));

        let auth = service_with(&store, Arc::new(hasher));
        for _ in 0..2 {
            let err = auth.login("ghost@example.com", "whatever1").await.unwrap_err();
            assert_eq!(err, AuthError::InvalidCredentials);
        }
    }

    #[tokio::test]
    async fn test_login_unknown_email_with_real_hasher() {
        let store = MemoryStore::new();
        let auth = service(&store);

        let err = auth.login("ghost@example.com", DUMMY_PASSWORD).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert!(auth.dummy_hash().await.unwrap().starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn test_logout_requires_token_and_is_idempotent() {
        let store = MemoryStore::new();
        let auth = service(&store);
        let outcome = auth.register(input("alice@example.com", "Secret123!")).await.unwrap();

        assert_eq!(auth.logout(None).await.unwrap_err(), AuthError::NoToken);
        auth.logout(Some(&outcome.token)).await.unwrap();
        auth.logout(Some(&outcome.token)).await.unwrap();
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_rotates_in_place() {
        let store = MemoryStore::new();
        let auth = service(&store);
        let outcome = auth.register(input("alice@example.com", "Secret123!")).await.unwrap();
        let before = store.find_session_by_token(&outcome.token).await.unwrap().unwrap();

        let refreshed = auth.refresh(&outcome.token).await.unwrap();

        assert_ne!(refreshed.token, outcome.token);
        assert_eq!(refreshed.user.id, outcome.user.id);
        let after = store.find_session_by_token(&refreshed.token).await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(store.session_count().await, 1);

        // The old token is gone for good
        assert_eq!(auth.refresh(&outcome.token).await.unwrap_err(), AuthError::SessionNotFound);
    }

    fn token_expiry(token: &str) -> i64 {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &DecodingKey::from_secret(SECRET.as_bytes()), &validation)
            .unwrap()
            .claims
            .exp
    }

    #[tokio::test]
    async fn test_token_expiry_matches_session_row() {
        let store = MemoryStore::new();
        let auth = service(&store);
        let outcome = auth.register(input("alice@example.com", "Secret123!")).await.unwrap();
        assert_eq!(token_expiry(&outcome.token), outcome.expires_at.timestamp());

        let refreshed = auth.refresh(&outcome.token).await.unwrap();
        assert_eq!(token_expiry(&refreshed.token), refreshed.expires_at.timestamp());
        let row = store.find_session_by_token(&refreshed.token).await.unwrap().unwrap();
        assert_eq!(row.expires_at, refreshed.expires_at);
    }

    #[tokio::test]
    async fn test_refresh_rejects_bad_tokens() {
        let store = MemoryStore::new();
        let auth = service(&store);
        let codec = TokenCodec::new(SECRET);

        assert_eq!(auth.refresh("garbage").await.unwrap_err(), AuthError::InvalidToken);

        let expired = codec
            .mint(Uuid::new_v4(), "alice@example.com", Duration::seconds(-60))
            .unwrap();
        assert_eq!(auth.refresh(&expired).await.unwrap_err(), AuthError::InvalidToken);

        let orphan = codec.mint(Uuid::new_v4(), "alice@example.com", Duration::days(7)).unwrap();
        assert_eq!(auth.refresh(&orphan).await.unwrap_err(), AuthError::SessionNotFound);
    }

    #[tokio::test]
    async fn test_refresh_expired_session_deletes_row() {
        let store = MemoryStore::new();
        let auth = service(&store);
        let outcome = auth.register(input("alice@example.com", "Secret123!")).await.unwrap();
        store
            .set_session_expiry(&outcome.token, Utc::now() - Duration::minutes(1))
            .await;

        assert_eq!(auth.refresh(&outcome.token).await.unwrap_err(), AuthError::SessionExpired);
        assert!(store.find_session_by_token(&outcome.token).await.unwrap().is_none());
        assert_eq!(auth.refresh(&outcome.token).await.unwrap_err(), AuthError::SessionNotFound);
    }
}
