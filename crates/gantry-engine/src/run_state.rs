//! Ambient context carried through a step tree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gantry_types::PlanId;

use crate::artifact::ArtifactRepository;
use crate::vars::VarScope;

/// Shared run context: the artifact repository, the build-global
/// variable scope, and the per-node result map. Cheap to clone; all
/// clones observe the same state.
#[derive(Debug, Clone)]
pub struct RunState {
    inner: Arc<RunStateInner>,
}

#[derive(Debug)]
struct RunStateInner {
    artifacts: ArtifactRepository,
    vars: Arc<VarScope>,
    results: Mutex<HashMap<PlanId, bool>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RunStateInner {
                artifacts: ArtifactRepository::new(),
                vars: VarScope::root(),
                results: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn artifacts(&self) -> &ArtifactRepository {
        &self.inner.artifacts
    }

    /// The build-global variable scope (`load_var` writes here).
    #[must_use]
    pub fn vars(&self) -> &Arc<VarScope> {
        &self.inner.vars
    }

    /// Record whether the sub-tree rooted at `plan_id` succeeded.
    pub fn record_result(&self, plan_id: &PlanId, succeeded: bool) {
        if let Ok(mut results) = self.inner.results.lock() {
            results.insert(plan_id.clone(), succeeded);
        }
    }

    #[must_use]
    pub fn result(&self, plan_id: &PlanId) -> Option<bool> {
        self.inner
            .results
            .lock()
            .ok()
            .and_then(|results| results.get(plan_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let state = RunState::new();
        let clone = state.clone();

        state.record_result(&PlanId::new("1"), true);
        assert_eq!(clone.result(&PlanId::new("1")), Some(true));
        assert_eq!(clone.result(&PlanId::new("2")), None);

        clone.vars().add_local("v", serde_json::json!(1), false);
        assert!(state.vars().get("v").is_some());
    }
}
