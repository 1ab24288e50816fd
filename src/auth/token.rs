//! Signed bearer tokens (HS256 JWT).
//!
//! The codec is pure: it never touches the session store. Whether a token is
//! still honoured is decided by the session row, not by the token alone.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    /// Per-issuance marker; keeps two tokens minted in the same instant distinct.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerification {
    Valid(TokenSubject),
    /// Signature checks out but `exp` has passed.
    Expired,
    /// Bad signature, wrong algorithm, or not a token at all.
    Malformed,
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn mint(&self, user_id: Uuid, email: &str, lifetime: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        self.mint_window(user_id, email, now, now + lifetime)
    }

    /// Mints a token valid from `issued_at` until `expires_at`, so callers can
    /// stamp the same instants onto the session row.
    pub fn mint_window(
        &self,
        user_id: Uuid,
        email: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            jti: uniqueness_marker(user_id),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to encode token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> TokenVerification {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => match Uuid::parse_str(&data.claims.sub) {
                Ok(user_id) => TokenVerification::Valid(TokenSubject {
                    user_id,
                    email: data.claims.email,
                }),
                Err(_) => TokenVerification::Malformed,
            },
            // jsonwebtoken checks the signature before claims, so this implies a good signature
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => TokenVerification::Expired,
            Err(_) => TokenVerification::Malformed,
        }
    }
}

fn uniqueness_marker(user_id: Uuid) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}-{}-{:016x}", user_id, nanos, suffix)
}
