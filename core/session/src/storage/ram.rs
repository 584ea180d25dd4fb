use super::KeyValueStore;
use crate::error::SessionError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory store, lost when dropped.
#[derive(Debug, Default)]
pub struct RamStore {
    internal_storage: RwLock<HashMap<String, String>>,
}

impl RamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.internal_storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.internal_storage.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for RamStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.internal_storage.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), SessionError> {
        self.internal_storage
            .write()
            .await
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), SessionError> {
        self.internal_storage.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_write_wins() {
        let store = RamStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.get_item("k").await.unwrap(), None);
        store.set_item("k", "one".to_string()).await.unwrap();
        store.set_item("k", "two".to_string()).await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len().await, 1);
        store.remove_item("k").await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap(), None);
    }
}
