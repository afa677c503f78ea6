//! Build records: one running execution of a plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan schema version this core executes. Builds tagged with anything
/// else are rejected before compilation.
pub const SUPPORTED_SCHEMA: &str = "exec.v1";

/// Immutable attributes of a running build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub name: String,
    pub team_id: i64,
    pub team_name: String,
    pub pipeline_id: i64,
    pub pipeline_name: String,
    pub job_id: i64,
    pub job_name: String,
    pub create_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub schema: String,
}

impl Build {
    /// Environment exposed to every process this build launches.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("BUILD_ID".to_string(), self.id.to_string()),
            ("BUILD_NAME".to_string(), self.name.clone()),
            ("BUILD_TEAM_ID".to_string(), self.team_id.to_string()),
            ("BUILD_TEAM_NAME".to_string(), self.team_name.clone()),
            (
                "BUILD_PIPELINE_ID".to_string(),
                self.pipeline_id.to_string(),
            ),
            (
                "BUILD_PIPELINE_NAME".to_string(),
                self.pipeline_name.clone(),
            ),
            ("BUILD_JOB_ID".to_string(), self.job_id.to_string()),
            ("BUILD_JOB_NAME".to_string(), self.job_name.clone()),
        ]
    }
}
