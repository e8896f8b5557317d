//! Authentication module for managing the console session.
//!
//! This module provides:
//! - `Session`: credential and identity, persisted through a `DurableStore`
//! - `SessionExpiry`: the sign-out path shared by explicit logout and
//!   401 handling, which also drops user-scoped cached data
//!
//! Only the session slice is ever persisted; cached query data is not.

pub mod expiry;
pub mod session;

pub use expiry::{SessionExpiry, UserScopes, USER_SCOPE_KIND};
pub use session::{Credential, Identity, PersistedSlice, Session, SessionData, SESSION_STORAGE_KEY};
