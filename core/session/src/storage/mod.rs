//! String key-value stores used to persist authorizations and mock key material.
use crate::error::SessionError;
use async_trait::async_trait;

pub mod file;
pub mod ram;

pub use file::FileStore;
pub use ram::RamStore;

/// Minimal last-write-wins string store.
///
/// Writes replace a whole value at once so a concurrent reader sees either
/// the previous value, the new one, or nothing.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, SessionError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), SessionError>;

    async fn remove_item(&self, key: &str) -> Result<(), SessionError>;
}
