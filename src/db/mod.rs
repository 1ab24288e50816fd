//! Database module for the drinkdesk server
//!
//! Row models, the store traits the auth core depends on, and the Postgres
//! and in-memory implementations of those traits.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{NewUser, Session, User, UserPreferences};
pub use operations::DbOperations;
pub use store::{SessionStore, StoreError, UserStore};
