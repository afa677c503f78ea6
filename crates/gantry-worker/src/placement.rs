//! Worker placement: filter candidates, then rank by a configurable
//! strategy chain.
//!
//! Filters are fixed (platform, tags, team, resource-type support,
//! running state). Ranking strategies compose left to right, each
//! narrowing the tied-best set; `volume-locality` additionally ranks by
//! how many of the step's input artifact volumes a worker already
//! hosts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::error::WorkerError;
use crate::runtime::{Artifact, WorkerAgent, WorkerInfo, WorkerState};

/// One ranking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Prefer workers already hosting the step's input volumes.
    VolumeLocality,
    /// Prefer workers with the fewest build containers.
    FewestBuildContainers,
    /// Reject workers already running the configured maximum of tasks.
    LimitActiveTasks,
    /// Shuffle the remaining candidates.
    Random,
}

impl PlacementStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VolumeLocality => "volume-locality",
            Self::FewestBuildContainers => "fewest-build-containers",
            Self::LimitActiveTasks => "limit-active-tasks",
            Self::Random => "random",
        }
    }
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategy {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume-locality" => Ok(Self::VolumeLocality),
            "fewest-build-containers" => Ok(Self::FewestBuildContainers),
            "limit-active-tasks" => Ok(Self::LimitActiveTasks),
            "random" => Ok(Self::Random),
            other => Err(WorkerError::InvalidPlacementStrategy(other.to_string())),
        }
    }
}

/// A comma-separated strategy chain plus its knobs, parsed once at
/// startup.
#[derive(Debug, Clone)]
pub struct PlacementChain {
    strategies: Vec<PlacementStrategy>,
    /// Used by `limit-active-tasks`; 0 disables the limit.
    pub max_active_tasks: usize,
}

impl Default for PlacementChain {
    fn default() -> Self {
        Self {
            strategies: vec![PlacementStrategy::VolumeLocality],
            max_active_tasks: 0,
        }
    }
}

impl PlacementChain {
    /// Parse `"volume-locality,random"` style configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidPlacementStrategy`] for unknown
    /// names; startup should fail on it.
    pub fn parse(raw: &str) -> Result<Self, WorkerError> {
        let strategies = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PlacementStrategy::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if strategies.is_empty() {
            return Err(WorkerError::InvalidPlacementStrategy(raw.to_string()));
        }
        Ok(Self {
            strategies,
            max_active_tasks: 0,
        })
    }

    #[must_use]
    pub fn strategies(&self) -> &[PlacementStrategy] {
        &self.strategies
    }
}

/// What a step requires of its worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    /// Empty means any platform.
    pub platform: String,
    pub tags: Vec<String>,
    pub team_id: Option<i64>,
    /// Base resource type the worker must support.
    pub resource_type: Option<String>,
}

fn filter_reason(spec: &WorkerSpec, info: &WorkerInfo) -> Option<&'static str> {
    if info.state != WorkerState::Running {
        return Some("not running");
    }
    if !spec.platform.is_empty() && info.platform != spec.platform {
        return Some("wrong platform");
    }
    // Tagged workers only receive steps that name one of their tags.
    if spec.tags.is_empty() {
        if !info.tags.is_empty() {
            return Some("worker is tagged");
        }
    } else if !spec.tags.iter().any(|t| info.tags.contains(t)) {
        return Some("tag mismatch");
    }
    if let Some(team) = info.team_id {
        if spec.team_id != Some(team) {
            return Some("owned by another team");
        }
    }
    if let Some(resource_type) = &spec.resource_type {
        if !info
            .resource_types
            .iter()
            .any(|rt| &rt.resource_type == resource_type)
        {
            return Some("resource type not supported");
        }
    }
    None
}

fn locality_score(info: &WorkerInfo, inputs: &[Artifact]) -> usize {
    inputs
        .iter()
        .filter(|artifact| artifact.worker == info.name)
        .count()
}

/// Pick a worker for a step.
///
/// # Errors
///
/// Returns [`WorkerError::NoCompatibleWorkers`] when the filters (or a
/// `limit-active-tasks` cap) reject every candidate.
pub fn select_worker(
    candidates: &[Arc<dyn WorkerAgent>],
    spec: &WorkerSpec,
    inputs: &[Artifact],
    chain: &PlacementChain,
) -> Result<Arc<dyn WorkerAgent>, WorkerError> {
    let mut rejections: HashMap<&'static str, usize> = HashMap::new();
    let mut pool: Vec<(Arc<dyn WorkerAgent>, WorkerInfo)> = Vec::new();

    for agent in candidates {
        let info = agent.info();
        match filter_reason(spec, &info) {
            Some(reason) => *rejections.entry(reason).or_default() += 1,
            None => pool.push((agent.clone(), info)),
        }
    }

    // Input locality ranks ahead of the configured chain: the worker
    // owning the most input volumes avoids the most streaming.
    if !inputs.is_empty() && !pool.is_empty() {
        let best = pool
            .iter()
            .map(|(_, info)| locality_score(info, inputs))
            .max()
            .unwrap_or(0);
        pool.retain(|(_, info)| locality_score(info, inputs) == best);
    }

    for strategy in chain.strategies() {
        if pool.is_empty() {
            break;
        }
        match strategy {
            PlacementStrategy::VolumeLocality => {
                // Already applied above whenever the step has inputs.
            }
            PlacementStrategy::FewestBuildContainers => {
                let best = pool
                    .iter()
                    .map(|(_, info)| info.build_containers)
                    .min()
                    .unwrap_or(0);
                pool.retain(|(_, info)| info.build_containers == best);
            }
            PlacementStrategy::LimitActiveTasks => {
                if chain.max_active_tasks > 0 {
                    pool.retain(|(_, info)| info.active_tasks < chain.max_active_tasks);
                    if pool.is_empty() {
                        *rejections.entry("at task limit").or_default() += 1;
                    }
                }
            }
            PlacementStrategy::Random => {
                pool.shuffle(&mut rand::thread_rng());
            }
        }
    }

    pool.into_iter().map(|(agent, _)| agent).next().ok_or_else(|| {
        let mut reasons: Vec<String> = rejections
            .into_iter()
            .map(|(reason, count)| format!("{count} {reason}"))
            .collect();
        reasons.sort();
        let reasons = if reasons.is_empty() {
            "no workers registered".to_string()
        } else {
            reasons.join(", ")
        };
        WorkerError::NoCompatibleWorkers { reasons }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemCluster, MemWorkerConfig};
    use crate::runtime::WorkerResourceType;

    fn git_type() -> WorkerResourceType {
        WorkerResourceType {
            resource_type: "git".into(),
            image_path: "/images/git".into(),
            version: "1".into(),
            privileged: false,
        }
    }

    #[test]
    fn chain_parses_and_rejects_unknown_names() {
        let chain = PlacementChain::parse("volume-locality, random").unwrap();
        assert_eq!(
            chain.strategies(),
            &[PlacementStrategy::VolumeLocality, PlacementStrategy::Random]
        );

        let err = PlacementChain::parse("volume-locality,newest").unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPlacementStrategy(name) if name == "newest"));

        assert!(PlacementChain::parse("").is_err());
    }

    #[test]
    fn filters_platform_tags_team_and_type() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig {
            platform: "darwin".into(),
            ..MemWorkerConfig::named("mac")
        });
        cluster.add_worker(MemWorkerConfig {
            tags: vec!["gpu".into()],
            ..MemWorkerConfig::named("tagged")
        });
        cluster.add_worker(MemWorkerConfig {
            team_id: Some(7),
            ..MemWorkerConfig::named("team-owned")
        });
        cluster.add_worker(MemWorkerConfig {
            resource_types: vec![git_type()],
            ..MemWorkerConfig::named("general")
        });

        let candidates = cluster.registry().list();
        let spec = WorkerSpec {
            platform: "linux".into(),
            resource_type: Some("git".into()),
            ..WorkerSpec::default()
        };
        let chosen =
            select_worker(&candidates, &spec, &[], &PlacementChain::default()).unwrap();
        assert_eq!(chosen.name(), "general");
    }

    #[test]
    fn no_compatible_workers_reports_reasons() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig {
            platform: "darwin".into(),
            ..MemWorkerConfig::named("mac")
        });

        let spec = WorkerSpec {
            platform: "linux".into(),
            ..WorkerSpec::default()
        };
        let err = select_worker(
            &cluster.registry().list(),
            &spec,
            &[],
            &PlacementChain::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("wrong platform"), "{err}");
    }

    #[test]
    fn input_locality_wins() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig::named("w1"));
        cluster.add_worker(MemWorkerConfig::named("w2"));

        let inputs = vec![
            Artifact::new("w2", "vol-a"),
            Artifact::new("w2", "vol-b"),
            Artifact::new("w1", "vol-c"),
        ];
        let chosen = select_worker(
            &cluster.registry().list(),
            &WorkerSpec::default(),
            &inputs,
            &PlacementChain::default(),
        )
        .unwrap();
        assert_eq!(chosen.name(), "w2");
    }

    #[test]
    fn fewest_build_containers_breaks_ties() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig {
            seed_build_containers: 5,
            ..MemWorkerConfig::named("busy")
        });
        cluster.add_worker(MemWorkerConfig {
            seed_build_containers: 1,
            ..MemWorkerConfig::named("idle")
        });

        let chain = PlacementChain::parse("fewest-build-containers").unwrap();
        let chosen = select_worker(
            &cluster.registry().list(),
            &WorkerSpec::default(),
            &[],
            &chain,
        )
        .unwrap();
        assert_eq!(chosen.name(), "idle");
    }

    #[test]
    fn limit_active_tasks_rejects_saturated_workers() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig {
            seed_active_tasks: 3,
            ..MemWorkerConfig::named("full")
        });

        let mut chain = PlacementChain::parse("limit-active-tasks").unwrap();
        chain.max_active_tasks = 3;
        let err = select_worker(
            &cluster.registry().list(),
            &WorkerSpec::default(),
            &[],
            &chain,
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::NoCompatibleWorkers { .. }));
    }

    #[test]
    fn random_still_returns_a_candidate() {
        let cluster = MemCluster::new();
        cluster.add_worker(MemWorkerConfig::named("w1"));
        cluster.add_worker(MemWorkerConfig::named("w2"));

        let chain = PlacementChain::parse("random").unwrap();
        let chosen = select_worker(
            &cluster.registry().list(),
            &WorkerSpec::default(),
            &[],
            &chain,
        )
        .unwrap();
        assert!(["w1", "w2"].contains(&chosen.name()));
    }
}
