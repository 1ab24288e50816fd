use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use validator::Validate;

use crate::auth::middleware::{bearer_token_from_request, Identity, MaybeIdentity};
use crate::auth::service::RegisterInput;
use crate::db::models::User;
use crate::error::{AppError, DatabaseError};
use crate::{ApiResponse, AppState};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 50, message = "First name must be 1-50 characters"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 50, message = "Last name must be 1-50 characters"))]
    pub last_name: String,
    #[validate(length(min = 7, max = 20, message = "Phone must be 7-20 characters"))]
    pub phone: Option<String>,
}

impl RegisterRequest {
    /// Names are trimmed before length checks, so whitespace-only names are rejected.
    pub fn trimmed(mut self) -> Self {
        self.first_name = self.first_name.trim().to_string();
        self.last_name = self.last_name.trim().to_string();
        self
    }
}

impl From<RegisterRequest> for RegisterInput {
    fn from(req: RegisterRequest) -> Self {
        RegisterInput {
            email: req.email,
            password: req.password,
            first_name: req.first_name,
            last_name: req.last_name,
            phone: req.phone,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub identity: Identity,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

pub async fn register(
    req: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req = req.into_inner().trimmed();
    req.validate()?;

    match state.auth_service.register(req.into()).await {
        Ok(outcome) => {
            info!(user_id = %outcome.user.id, "Registration successful");
            Ok(HttpResponse::Created().json(ApiResponse::success(outcome)))
        }
        Err(e) => {
            info!(code = e.code(), "Registration failed");
            Err(e.into())
        }
    }
}

pub async fn login(
    req: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    req.validate()?;

    let outcome = state.auth_service.login(&req.email, &req.password).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}

pub async fn logout(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state
        .auth_service
        .logout(bearer_token_from_request(&req))
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({
        "message": "Successfully logged out"
    }))))
}

pub async fn refresh(
    req: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    req.validate()?;

    let outcome = state.auth_service.refresh(&req.token).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}

/// Protected resource: the caller's own profile.
pub async fn me(
    identity: Identity,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let user = state
        .auth_service
        .find_user(identity.user_id)
        .await?
        .ok_or_else(|| {
            error!(user_id = %identity.user_id, "Authenticated session has no user");
            AppError::DatabaseError(DatabaseError::NotFound)
        })?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(MeResponse { identity, user })))
}

pub async fn status(identity: MaybeIdentity) -> HttpResponse {
    let MaybeIdentity(identity) = identity;
    HttpResponse::Ok().json(ApiResponse::success(StatusResponse {
        authenticated: identity.is_some(),
        identity,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout))
            .route("/refresh", web::post().to(refresh))
            .route("/me", web::get().to(me))
            .route("/status", web::get().to(status)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_validation() {
        let request = RegisterRequest {
            email: "not-an-email".into(),
            password: "short".into(),
            first_name: "".into(),
            last_name: "Liddell".into(),
            phone: Some("12".into()),
        };

        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
        assert!(fields.contains_key("first_name"));
        assert!(fields.contains_key("phone"));
        assert!(!fields.contains_key("last_name"));
    }

    #[test]
    fn test_valid_register_request() {
        let request = RegisterRequest {
            email: "alice@Example.com".into(),
            password: "Secret123!".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            phone: None,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_blank_names_are_rejected_after_trim() {
        let request = RegisterRequest {
            email: "alice@example.com".into(),
            password: "Secret123!".into(),
            first_name: "   ".into(),
            last_name: "  Liddell ".into(),
            phone: None,
        }
        .trimmed();

        assert_eq!(request.last_name, "Liddell");
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("first_name"));
        assert!(!errors.field_errors().contains_key("last_name"));
    }

    #[test]
    fn test_login_request_validation() {
        let request = LoginRequest {
            email: "ALICE@EXAMPLE.COM".into(),
            password: "".into(),
        };
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("password"));
        assert!(!errors.field_errors().contains_key("email"));
    }
}
