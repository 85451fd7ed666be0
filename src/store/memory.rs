use super::{ClaimedSwap, KvBackend, StoreError, record_claimed_by};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;

/// Process-local backend. Contents are lost when the process exits.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().await;
        if guard.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        guard.insert(key.to_string(), value);
        Ok(true)
    }

    async fn claimed_swap(
        &self,
        owner_key: &str,
        token: &str,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<ClaimedSwap, StoreError> {
        let mut guard = self.entries.lock().await;
        let owned = guard
            .get(owner_key)
            .is_some_and(|raw| record_claimed_by(raw, token));
        if !owned {
            return Ok(ClaimedSwap::NotOwner);
        }
        if guard.get(key).map(String::as_str) != expected {
            return Ok(ClaimedSwap::Mismatch);
        }
        guard.insert(key.to_string(), value);
        Ok(ClaimedSwap::Swapped)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
