pub mod explain;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use gantry_engine::testing::{services_for, ServicesConfig};
use gantry_engine::{Step, StepBuilder};
use gantry_types::build::SUPPORTED_SCHEMA;
use gantry_types::{Build, Plan};
use gantry_worker::mem::MemCluster;
use gantry_worker::PlacementChain;

/// Read and deserialize a plan file. Deserialization failures are the
/// "malformed plan" cases (no variant, more than one variant, bad
/// payloads).
pub fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed plan in {}", path.display()))
}

/// Compile a plan the way the engine would, against inert local
/// services.
pub fn compile(plan: &Plan, placement: PlacementChain) -> anyhow::Result<Step> {
    let services = services_for(
        &MemCluster::new(),
        ServicesConfig {
            placement,
            ..ServicesConfig::default()
        },
    );
    let build = Arc::new(Build {
        id: 0,
        name: "0".to_string(),
        team_id: 0,
        team_name: "local".to_string(),
        pipeline_id: 0,
        pipeline_name: "local".to_string(),
        job_id: 0,
        job_name: "local".to_string(),
        create_time: Utc::now(),
        start_time: Utc::now(),
        schema: SUPPORTED_SCHEMA.to_string(),
    });
    let state = gantry_engine::RunState::new();
    StepBuilder::new(services)
        .build(&build, plan, state.vars())
        .map_err(|err| anyhow::anyhow!("{err}"))
}

/// Count nodes in a compiled tree.
pub fn node_count(step: &Step) -> usize {
    1 + step.children().iter().map(|child| node_count(child)).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plan(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("gantry-{name}-{}.json", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn validate_compiles_a_simple_plan() {
        let path = write_plan(
            "ok",
            r#"{
                "id": "0",
                "do": [
                    {"id": "1", "task": {"name": "t", "config": {
                        "platform": "linux",
                        "rootfs_uri": "docker:///busybox",
                        "run": {"path": "true"}
                    }}}
                ]
            }"#,
        );
        let plan = load_plan(&path).unwrap();
        let step = compile(&plan, PlacementChain::default()).unwrap();
        // on_success(task, identity) after sequence desugaring.
        assert_eq!(node_count(&step), 3);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_plans_are_reported() {
        let path = write_plan("bad", r#"{"id": "0", "do": [], "try": {}}"#);
        let err = load_plan(&path).unwrap_err();
        assert!(err.to_string().contains("malformed plan"), "{err}");
        std::fs::remove_file(path).ok();
    }
}
