use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::ingress::AlbIngress;

/// Aggregates by id (`namespace/name`)
#[derive(Default)]
pub struct IngressCache {
    entries: RwLock<BTreeMap<String, Arc<AlbIngress>>>,
}

impl IngressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<AlbIngress>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Store `ingress` under its own id, returning any aggregate it replaced
    pub async fn insert(&self, ingress: Arc<AlbIngress>) -> Option<Arc<AlbIngress>> {
        self.entries
            .write()
            .await
            .insert(ingress.id().to_string(), ingress)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<AlbIngress>> {
        self.entries.write().await.remove(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Snapshot of every cached aggregate
    pub async fn all(&self) -> Vec<Arc<AlbIngress>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
