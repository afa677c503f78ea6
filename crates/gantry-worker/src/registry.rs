//! Registry of live worker agents.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::WorkerError;
use crate::runtime::{Artifact, Volume, WorkerAgent};

/// Tracks the worker agents the core may place work on.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn WorkerAgent>>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a worker agent under its name.
    pub fn register(&self, agent: Arc<dyn WorkerAgent>) {
        let name = agent.name().to_string();
        tracing::debug!(worker = name, "registering worker");
        if let Ok(mut workers) = self.workers.write() {
            workers.insert(name, agent);
        }
    }

    /// Look up a worker by name.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerNotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<dyn WorkerAgent>, WorkerError> {
        self.workers
            .read()
            .map_err(|_| WorkerError::LockPoisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| WorkerError::WorkerNotFound(name.to_string()))
    }

    /// All registered workers, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<dyn WorkerAgent>> {
        self.workers
            .read()
            .map(|workers| workers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve an artifact to its volume on the authoritative worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::VolumeNotFound`] when the volume is gone.
    pub async fn volume_for_artifact(
        &self,
        artifact: &Artifact,
    ) -> Result<Arc<dyn Volume>, WorkerError> {
        let worker = self.get(&artifact.worker)?;
        worker
            .find_volume(&artifact.volume)
            .await?
            .ok_or_else(|| WorkerError::VolumeNotFound {
                worker: artifact.worker.clone(),
                handle: artifact.volume.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemCluster, MemWorkerConfig};

    #[tokio::test]
    async fn register_and_lookup() {
        let cluster = MemCluster::new();
        let registry = cluster.registry();
        cluster.add_worker(MemWorkerConfig::named("w1"));

        assert!(registry.get("w1").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(WorkerError::WorkerNotFound(_))
        ));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn volume_for_artifact_resolves_and_rejects_missing() {
        let cluster = MemCluster::new();
        let registry = cluster.registry();
        let worker = cluster.add_worker(MemWorkerConfig::named("w1"));

        let volume = worker
            .create_volume(crate::runtime::VolumeSpec {
                strategy: crate::runtime::VolumeStrategy::Empty,
                privileged: false,
            })
            .await
            .unwrap();

        let artifact = Artifact::new("w1", volume.handle());
        let found = registry.volume_for_artifact(&artifact).await.unwrap();
        assert_eq!(found.handle(), volume.handle());

        let missing = Artifact::new("w1", "gone");
        assert!(matches!(
            registry.volume_for_artifact(&missing).await,
            Err(WorkerError::VolumeNotFound { .. })
        ));
    }
}
