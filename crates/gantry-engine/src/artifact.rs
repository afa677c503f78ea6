//! Per-build artifact repository.
//!
//! An append-mostly map of artifact name to artifact handle, shared by
//! every step of one build. Names bind at most once; a second
//! registration fails loudly instead of silently overwriting.

use std::collections::HashMap;
use std::sync::Mutex;

use gantry_worker::Artifact;

use crate::error::StepError;

#[derive(Debug, Default)]
pub struct ArtifactRepository {
    artifacts: Mutex<HashMap<String, Artifact>>,
}

impl ArtifactRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to an artifact. Names are case-sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::UserConfig`] when the name is already bound.
    pub fn register(&self, name: &str, artifact: Artifact) -> Result<(), StepError> {
        let mut artifacts = self
            .artifacts
            .lock()
            .map_err(|_| StepError::Transient(anyhow::anyhow!("artifact repository poisoned")))?;
        if artifacts.contains_key(name) {
            return Err(StepError::user_config(format!(
                "artifact '{name}' already registered"
            )));
        }
        artifacts.insert(name.to_string(), artifact);
        Ok(())
    }

    /// Look up an artifact by name. Re-discovery returns the same
    /// handle for the build's lifetime.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Artifact> {
        self.artifacts
            .lock()
            .ok()
            .and_then(|artifacts| artifacts.get(name).cloned())
    }

    /// All current bindings, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Artifact)> {
        let mut entries: Vec<(String, Artifact)> = self
            .artifacts
            .lock()
            .map(|artifacts| {
                artifacts
                    .iter()
                    .map(|(name, artifact)| (name.clone(), artifact.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_rediscover() {
        let repo = ArtifactRepository::new();
        repo.register("repo", Artifact::new("w1", "vol-1")).unwrap();

        let first = repo.get("repo").unwrap();
        let second = repo.get("repo").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.volume, "vol-1");
    }

    #[test]
    fn duplicate_name_fails_loudly() {
        let repo = ArtifactRepository::new();
        repo.register("repo", Artifact::new("w1", "vol-1")).unwrap();

        let err = repo
            .register("repo", Artifact::new("w2", "vol-2"))
            .unwrap_err();
        assert!(matches!(err, StepError::UserConfig(_)), "{err}");

        // The original binding survives.
        assert_eq!(repo.get("repo").unwrap().volume, "vol-1");
    }

    #[test]
    fn names_are_case_sensitive() {
        let repo = ArtifactRepository::new();
        repo.register("Repo", Artifact::new("w1", "vol-1")).unwrap();
        repo.register("repo", Artifact::new("w1", "vol-2")).unwrap();
        assert_eq!(repo.get("Repo").unwrap().volume, "vol-1");
        assert_eq!(repo.get("repo").unwrap().volume, "vol-2");
    }

    #[test]
    fn concurrent_registration_admits_exactly_one() {
        let repo = std::sync::Arc::new(ArtifactRepository::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            handles.push(std::thread::spawn(move || {
                repo.register("shared", Artifact::new("w", format!("vol-{i}")))
                    .is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
        assert!(repo.get("shared").is_some());
    }
}
