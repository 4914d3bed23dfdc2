//! Inbound scan data: per-function measurements and the batch that carries them.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::ccn_defect::{check_line_range, ConditionLines, LocationKey};
use crate::services::masking::MaskRules;

/// One function reported over the complexity threshold by a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_line_range"))]
pub struct FunctionObservation {
    pub task_id: i64,
    #[validate(length(min = 1, message = "func_signature is required"))]
    pub func_signature: String,
    pub function_name: Option<String>,
    pub long_name: Option<String>,

    #[validate(range(min = 1, message = "ccn must be at least 1"))]
    pub ccn: i32,
    #[validate(range(min = 0))]
    pub start_lines: Option<i32>,
    #[validate(range(min = 0))]
    pub end_lines: Option<i32>,
    #[validate(range(min = 0))]
    pub total_lines: Option<i32>,
    pub condition_lines: ConditionLines,

    pub author: Option<String>,
    #[serde(rename = "latest_datetime")]
    pub latest_date_time: Option<i64>,

    pub rel_path: Option<String>,
    pub file_path: Option<String>,
    pub url: Option<String>,
    pub repo_id: Option<String>,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub sub_module: Option<String>,
    pub md5: Option<String>,
    pub pinpoint_hash: Option<String>,
}

fn validate_line_range(obs: &FunctionObservation) -> Result<(), ValidationError> {
    check_line_range(obs.start_lines, obs.end_lines, obs.total_lines).map_err(|msg| {
        let mut err = ValidationError::new("line_range");
        err.message = Some(msg.into());
        err
    })
}

impl FunctionObservation {
    pub fn location_key(&self) -> Option<LocationKey> {
        LocationKey::new(
            self.rel_path.as_deref(),
            self.function_name.as_deref(),
            self.long_name.as_deref(),
        )
    }

    pub fn match_path(&self) -> Option<&str> {
        self.rel_path.as_deref().or(self.file_path.as_deref())
    }
}

/// Everything one scan run reports for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanBatch {
    pub task_id: i64,
    pub tool_name: String,
    pub build_number: String,
    #[serde(default)]
    pub observations: Vec<FunctionObservation>,
    /// Task-specific risk cut points `[low, medium, high]`, overriding configuration.
    #[serde(default)]
    pub risk_thresholds: Option<[i32; 3]>,
    #[serde(default)]
    pub mask_rules: MaskRules,
}
