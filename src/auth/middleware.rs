//! Request-time authentication.
//!
//! `RequestAuthenticator::authenticate` is the single verification chain.
//! The `Identity` extractor surfaces its failures; `MaybeIdentity` discards them.

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::token::{TokenCodec, TokenVerification};
use crate::db::store::SessionStore;
use crate::error::{AppError, AuthError};
use crate::AppState;

pub const BEARER_PREFIX: &str = "Bearer ";

/// The caller behind an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
    pub session_id: Uuid,
}

/// Optional authentication; `None` whenever anything in the chain fails.
#[derive(Debug, Clone)]
pub struct MaybeIdentity(pub Option<Identity>);

/// Pulls the token out of an `Authorization` header value.
pub fn bearer_token(header_value: Option<&str>) -> Option<&str> {
    header_value.and_then(|h| h.strip_prefix(BEARER_PREFIX))
}

pub fn bearer_token_from_request(req: &HttpRequest) -> Option<&str> {
    bearer_token(
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok()),
    )
}

#[derive(Clone)]
pub struct RequestAuthenticator {
    codec: TokenCodec,
    sessions: Arc<dyn SessionStore>,
}

impl RequestAuthenticator {
    pub fn new(codec: TokenCodec, sessions: Arc<dyn SessionStore>) -> Self {
        Self { codec, sessions }
    }

    /// `authorization` is the raw header value, if any.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, AuthError> {
        let token = bearer_token(authorization).ok_or(AuthError::NoToken)?;

        let subject = match self.codec.verify(token) {
            TokenVerification::Valid(subject) => subject,
            TokenVerification::Expired => return Err(AuthError::TokenExpired),
            TokenVerification::Malformed => return Err(AuthError::InvalidToken),
        };

        let session = self
            .sessions
            .find_session_by_token(token)
            .await?
            .ok_or(AuthError::SessionNotFound)?;

        if session.is_expired() {
            // Zero rows means someone else already removed it; that is fine
            let removed = self.sessions.delete_session(session.id).await?;
            info!(session_id = %session.id, removed, "Removed expired session");
            return Err(AuthError::SessionExpired);
        }

        if session.user_id != subject.user_id {
            warn!(session_id = %session.id, "Token subject does not own the session");
            return Err(AuthError::InvalidToken);
        }

        Ok(Identity {
            user_id: subject.user_id,
            email: subject.email,
            session_id: session.id,
        })
    }

    /// Never fails. Side effects of the chain (expired-row cleanup) still run.
    pub async fn authenticate_optional(&self, authorization: Option<&str>) -> Option<Identity> {
        match self.authenticate(authorization).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(code = e.code(), "Proceeding unauthenticated");
                None
            }
        }
    }
}

fn authorization_header(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
}

fn authenticator(req: &HttpRequest) -> Option<RequestAuthenticator> {
    req.app_data::<web::Data<AppState>>()
        .map(|state| state.authenticator.clone())
}

impl FromRequest for Identity {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let header = authorization_header(req);
        let authenticator = authenticator(req);

        Box::pin(async move {
            let authenticator = authenticator.ok_or_else(|| {
                AppError::InternalError("Application state is not configured".into())
            })?;
            Ok(authenticator.authenticate(header.as_deref()).await?)
        })
    }
}

impl FromRequest for MaybeIdentity {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let header = authorization_header(req);
        let authenticator = authenticator(req);

        Box::pin(async move {
            let identity = match authenticator {
                Some(authenticator) => authenticator.authenticate_optional(header.as_deref()).await,
                None => None,
            };
            Ok(MaybeIdentity(identity))
        })
    }
}
