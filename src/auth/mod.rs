//! Authentication module for the drinkdesk server
//!
//! Password hashing, signed bearer tokens, the session-backed
//! authentication service, request authentication and expired-session
//! cleanup.

pub mod handlers;
pub mod janitor;
pub mod middleware;
pub mod password;
pub mod service;
pub mod token;

pub use janitor::SessionJanitor;
pub use middleware::{Identity, MaybeIdentity, RequestAuthenticator};
pub use password::{Argon2Hasher, PasswordHasher};
pub use service::{normalize_email, AuthOutcome, AuthService, RegisterInput};
pub use token::{TokenCodec, TokenSubject, TokenVerification};
