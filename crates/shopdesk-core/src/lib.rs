//! Shopdesk core library.
//!
//! Client-side request cache and invalidation layer for the shopdesk admin
//! console. Server reads are cached per endpoint and arguments, concurrent
//! requests for the same data share one fetch, and mutations invalidate
//! cached reads through declared tags. The signed-in session survives
//! restarts through a durable store.
//!
//! Start with [`Console::init`], which restores the session before anything
//! else can be requested.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod console;
pub mod store;

pub use api::{Endpoint, EndpointError, QueryError, TagTemplate};
pub use auth::{Credential, Identity, Session, SessionData};
pub use cache::{CacheConfig, CacheKey, EntrySnapshot, QueryStatus, RequestCache, Tag};
pub use config::{Config, StorageBackend};
pub use console::{Console, ConsoleConfig, Subscription};
pub use store::{DurableStore, FileStore, KeyringStore, MemoryStore};
