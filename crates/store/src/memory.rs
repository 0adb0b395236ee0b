//! In-memory job backend.
//!
//! Ephemeral: every record is lost when the daemon exits. Selected only when
//! no persistent backend is configured, with a loud startup warning.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::backend::{JobBackend, StoreError};

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        warn!(
            "!!! Warning !!!: no persistence backend configured; falling back to the in-memory \
             store! Jobs will not be saved when the daemon terminates!"
        );
        Self::default()
    }
}

#[async_trait]
impl JobBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .map(|(id, body)| (id.clone(), body.clone()))
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(id.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_cycle() {
        let backend = MemoryBackend::default();
        assert!(backend.get("a").await.unwrap().is_none());

        backend.put("a", "{\"id\":\"a\"}").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().unwrap(), "{\"id\":\"a\"}");

        backend.put("a", "{\"id\":\"a\",\"v\":2}").await.unwrap();
        assert!(backend.get("a").await.unwrap().unwrap().contains("v"));

        backend.delete("a").await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
        // Deleting again is not an error.
        backend.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_is_id_ordered() {
        let backend = MemoryBackend::default();
        backend.put("zeta", "{}").await.unwrap();
        backend.put("alpha", "{}").await.unwrap();
        let all = backend.load_all().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
