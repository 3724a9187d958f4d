//! Workload → container id cache.
//!
//! The engine's labels are authoritative. This map only saves a label
//! query on the hot path and can be dropped at any time; [`resolve`]
//! rebuilds entries on a miss.
//!
//! [`resolve`]: ContainerRegistry::resolve

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::{ContainerEngine, EngineResult, WORKLOAD_LABEL};

#[derive(Debug, Default)]
pub struct ContainerRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workload_id: &str, container_id: &str) {
        self.entries
            .write()
            .await
            .insert(workload_id.to_string(), container_id.to_string());
    }

    pub async fn remove(&self, workload_id: &str) -> Option<String> {
        self.entries.write().await.remove(workload_id)
    }

    pub async fn get(&self, workload_id: &str) -> Option<String> {
        self.entries.read().await.get(workload_id).cloned()
    }

    /// Forget every entry, as after an agent restart.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Container id for `workload_id`: cache first, then a label query.
    ///
    /// `Ok(None)` means no container carries the workload's label. The
    /// engine is queried without holding the lock.
    pub async fn resolve(
        &self,
        workload_id: &str,
        engine: &dyn ContainerEngine,
    ) -> EngineResult<Option<String>> {
        if let Some(id) = self.get(workload_id).await {
            return Ok(Some(id));
        }
        let Some(found) = engine.find_by_label(WORKLOAD_LABEL, workload_id).await? else {
            return Ok(None);
        };
        debug!(%workload_id, container_id = %found.id, "registry repopulated from labels");
        self.insert(workload_id, &found.id).await;
        Ok(Some(found.id))
    }
}
