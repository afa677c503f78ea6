//! The build plan: a recursive tagged sum describing every step and
//! combinator a build executes.
//!
//! Plan construction (from pipeline YAML) happens outside the core; we
//! define only the shape. Exactly one variant key may be present per
//! node. Serde's externally tagged representation enforces that: a node
//! carrying two variant keys fails to deserialize, which the engine
//! surfaces as a malformed-plan user error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskConfig;
use crate::version::{Version, VersionedResourceType};

/// Stable string identifier of a plan node, unique within one build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child identifier, used when a template node is expanded
    /// into several concrete nodes (the `across` step).
    #[must_use]
    pub fn scoped(&self, suffix: &str) -> Self {
        Self(format!("{}/{}", self.0, suffix))
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PlanId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// The kind of work a leaf performs. Used for event payloads and
/// container metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Get,
    Put,
    Task,
    Check,
    SetPipeline,
    LoadVar,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Task => "task",
            Self::Check => "check",
            Self::SetPipeline => "set_pipeline",
            Self::LoadVar => "load_var",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    /// 1-based attempt indices up the enclosing retry chain. Empty for
    /// nodes not wrapped by a retry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<u32>,
    #[serde(flatten)]
    pub config: PlanConfig,
}

impl Plan {
    #[must_use]
    pub fn new(id: impl Into<PlanId>, config: PlanConfig) -> Self {
        Self {
            id: id.into(),
            attempts: Vec::new(),
            config,
        }
    }
}

/// The variant payload of a plan node: either a leaf or a combinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanConfig {
    // Leaves.
    Get(GetPlan),
    Put(PutPlan),
    Task(TaskPlan),
    Check(CheckPlan),
    SetPipeline(SetPipelinePlan),
    LoadVar(LoadVarPlan),
    ArtifactInput(ArtifactInputPlan),
    ArtifactOutput(ArtifactOutputPlan),

    // Combinators.
    Do(Vec<Plan>),
    InParallel(InParallelPlan),
    Aggregate(Vec<Plan>),
    Across(AcrossPlan),
    Retry(Vec<Plan>),
    Timeout(TimeoutPlan),
    Try(Box<Plan>),
    OnSuccess(HookedPlan),
    OnFailure(HookedPlan),
    OnAbort(HookedPlan),
    OnError(HookedPlan),
    Ensure(HookedPlan),
}

/// Fetch a version of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Artifact name to register the fetched bits under.
    pub name: String,
    /// Pipeline resource backing this get; empty for anonymous fetches
    /// (no latest-version pointer is updated).
    #[serde(default)]
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: serde_json::Value,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versioned_resource_types: Vec<VersionedResourceType>,
}

/// Which build artifacts a put step mounts as inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PutInputs {
    /// Everything registered so far.
    #[default]
    All,
    /// Artifacts whose names appear as path roots in the put params.
    Detect,
    /// An explicit list.
    Named(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PutInputsRepr {
    Keyword(String),
    Named(Vec<String>),
}

impl Serialize for PutInputs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::All => PutInputsRepr::Keyword("all".to_string()),
            Self::Detect => PutInputsRepr::Keyword("detect".to_string()),
            Self::Named(names) => PutInputsRepr::Named(names.clone()),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PutInputs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match PutInputsRepr::deserialize(deserializer)? {
            PutInputsRepr::Keyword(kw) => match kw.as_str() {
                "all" => Ok(Self::All),
                "detect" => Ok(Self::Detect),
                other => Err(serde::de::Error::custom(format!(
                    "invalid put inputs keyword '{other}' (expected \"all\", \"detect\", or a list)",
                ))),
            },
            PutInputsRepr::Named(names) => Ok(Self::Named(names)),
        }
    }
}

/// Push a new version of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: serde_json::Value,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub inputs: PutInputs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versioned_resource_types: Vec<VersionedResourceType>,
}

/// Run a user-configured process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    /// Inline task configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// `artifact/path` of a task configuration file, mutually exclusive
    /// with `config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_from: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versioned_resource_types: Vec<VersionedResourceType>,
}

/// Periodicity configuration of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInterval {
    /// Seconds between periodic checks; 0 for step-embedded checks.
    #[serde(default)]
    pub interval_secs: u64,
    /// The user asked for periodic checks to never run.
    #[serde(default)]
    pub never: bool,
}

impl CheckInterval {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Discover new versions of a resource, resource type, or prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub name: String,
    /// At most one of `resource` / `resource_type` / `prototype` names
    /// the object being checked.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub prototype: String,
    /// Resource type providing the check container image and protocol.
    #[serde(rename = "type")]
    pub image_type: String,
    pub source: serde_json::Value,
    #[serde(default)]
    pub interval: CheckInterval,
    /// Manually triggered: bypass the interval gate.
    #[serde(default)]
    pub skip_interval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versioned_resource_types: Vec<VersionedResourceType>,
}

impl CheckPlan {
    /// A periodic check runs as its own build (scheduler- or manually
    /// triggered) and carries an interval configuration. Step-embedded
    /// checks carry none.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.interval.interval_secs > 0 || self.interval.never
    }
}

/// Reconfigure a pipeline from a file produced by an earlier step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPipelinePlan {
    /// Pipeline name to create or update.
    pub name: String,
    /// Owning team; empty means the build's team.
    #[serde(default)]
    pub team: String,
    /// `artifact/path` of the pipeline configuration file.
    pub file: String,
}

/// Load a value from an artifact file into the build's variable scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadVarPlan {
    /// Variable name to bind.
    pub name: String,
    /// `artifact/path` of the file to read.
    pub file: String,
    /// `json`, `raw`, or `trim`; defaults by file extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// When false (the default), the loaded value is redacted from logs.
    #[serde(default)]
    pub reveal: bool,
}

/// Bridge a build-provided artifact slot into the run's repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInputPlan {
    pub artifact_id: i64,
    pub name: String,
}

/// Export a registered artifact back out as a build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutputPlan {
    pub name: String,
}

/// Bounded parallel execution of a list of sub-plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InParallelPlan {
    pub steps: Vec<Plan>,
    /// Maximum concurrent sub-steps; 0 means unlimited.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

/// One axis of an `across` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossVar {
    pub var: String,
    pub values: Vec<serde_json::Value>,
    /// Concurrency at this axis; 0 means unlimited.
    #[serde(default)]
    pub max_in_flight: usize,
}

/// Run a sub-plan once per point of a Cartesian product of variable
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossPlan {
    pub vars: Vec<AcrossVar>,
    pub step: Box<Plan>,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPlan {
    pub step: Box<Plan>,
    pub duration_secs: u64,
}

impl TimeoutPlan {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// A step with a hook that runs depending on the step's outcome
/// (`on_success`, `on_failure`, `on_abort`, `on_error`, `ensure`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookedPlan {
    pub step: Box<Plan>,
    pub next: Box<Plan>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_plan(name: &str) -> Plan {
        Plan::new(
            name,
            PlanConfig::Get(GetPlan {
                name: name.to_string(),
                resource: String::new(),
                resource_type: "git".to_string(),
                source: serde_json::json!({"uri": "https://example.com/repo"}),
                params: serde_json::Value::Null,
                version: None,
                tags: vec![],
                versioned_resource_types: vec![],
            }),
        )
    }

    #[test]
    fn plan_roundtrip_preserves_variant() {
        let plan = Plan::new(
            "1",
            PlanConfig::Do(vec![get_plan("repo"), get_plan("deps")]),
        );
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn plan_with_two_variants_is_malformed() {
        let raw = r#"{"id": "1", "try": {"id": "2", "task": {"name": "t"}}, "do": []}"#;
        assert!(serde_json::from_str::<Plan>(raw).is_err());
    }

    #[test]
    fn plan_with_no_variant_is_malformed() {
        let raw = r#"{"id": "1"}"#;
        assert!(serde_json::from_str::<Plan>(raw).is_err());
    }

    #[test]
    fn put_inputs_accepts_keywords_and_lists() {
        let all: PutInputs = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, PutInputs::All);
        let detect: PutInputs = serde_json::from_str("\"detect\"").unwrap();
        assert_eq!(detect, PutInputs::Detect);
        let named: PutInputs = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(named, PutInputs::Named(vec!["a".into(), "b".into()]));
        assert!(serde_json::from_str::<PutInputs>("\"some\"").is_err());
    }

    #[test]
    fn check_plan_periodicity() {
        let mut check = CheckPlan {
            name: "r".into(),
            resource: "r".into(),
            resource_type: String::new(),
            prototype: String::new(),
            image_type: "git".into(),
            source: serde_json::json!({}),
            interval: CheckInterval::default(),
            skip_interval: false,
            from_version: None,
            tags: vec![],
            versioned_resource_types: vec![],
        };
        assert!(!check.is_periodic(), "embedded checks carry no interval");

        check.interval.interval_secs = 60;
        assert!(check.is_periodic());

        check.interval.interval_secs = 0;
        check.interval.never = true;
        assert!(check.is_periodic(), "never is still a periodic config");
    }

    #[test]
    fn plan_id_scoping() {
        let id = PlanId::new("7");
        assert_eq!(id.scoped("0/2").as_str(), "7/0/2");
    }

    #[test]
    fn attempts_omitted_when_empty() {
        let plan = get_plan("repo");
        let json = serde_json::to_value(&plan).unwrap();
        assert!(json.get("attempts").is_none());
    }
}
