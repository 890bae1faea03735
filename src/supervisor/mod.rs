//! Background supervision
//!
//! - Connection guard: keeps quote streams alive outside the daily pause
//! - Credentials: shared session token and its periodic refresh

pub mod connection_guard;
pub mod credentials;

pub use connection_guard::{ConnectionGuard, GuardAction};
pub use credentials::{Authenticator, CredentialRefresher, CredentialStore};
