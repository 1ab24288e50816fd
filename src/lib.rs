pub mod auth;
pub mod config;
pub mod db;
pub mod error;

use actix_web::{web, HttpResponse};
use serde::Serialize;
use std::sync::Arc;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{AuthService, RequestAuthenticator, SessionJanitor};
pub use db::{DbOperations, MemoryStore, SessionStore, UserStore};

use auth::{Argon2Hasher, TokenCodec};
use error::ValidationError;

/// Envelope for every successful response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data }
    }
}

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Malformed JSON bodies are reported as validation failures.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        AppError::ValidationError(ValidationError::new(format!("Invalid request body: {}", err)))
            .into()
    })
}

/// Registers every route of the service. Expects `web::Data<AppState>` to be set.
pub fn configure_app(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/health", web::get().to(health_check));
    auth::handlers::configure(cfg);
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth_service: Arc<AuthService>,
    pub authenticator: RequestAuthenticator,
    pub janitor: SessionJanitor,
    pub db: Option<DbOperations>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        if config.database.is_memory() {
            tracing::warn!("Using the in-memory store; data will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            return Ok(Self::from_stores(config, store.clone(), store));
        }

        let db = DbOperations::new_with_options(
            &config.database.url,
            config.database.max_connections,
            std::time::Duration::from_secs(config.database.acquire_timeout_secs),
        )
        .await?;
        db.run_migrations().await?;

        let store = Arc::new(db.clone());
        let mut state = Self::from_stores(config, store.clone(), store);
        state.db = Some(db);
        Ok(state)
    }

    pub fn from_stores(
        config: Settings,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let codec = TokenCodec::new(&config.auth.jwt_secret);
        let auth_service = AuthService::new(
            users,
            sessions.clone(),
            Arc::new(Argon2Hasher::new()),
            codec.clone(),
            config.auth.session_lifetime(),
        );

        Self {
            config: Arc::new(config),
            auth_service: Arc::new(auth_service),
            authenticator: RequestAuthenticator::new(codec, sessions.clone()),
            janitor: SessionJanitor::new(sessions),
            db: None,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.close().await;
        }
        Ok(())
    }
}
