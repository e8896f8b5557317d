//! Durable key-value storage for the persisted session slice.
//!
//! This module provides:
//! - `DurableStore`: the storage contract (`get` / `set` / `remove`)
//! - `FileStore`: one file per key under the application cache directory
//! - `KeyringStore`: secure OS-level storage via keyring
//! - `MemoryStore`: process-local storage for tests and ephemeral runs

pub mod file;
pub mod keychain;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Stored bytes for `key`, or `None` if nothing was written.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
