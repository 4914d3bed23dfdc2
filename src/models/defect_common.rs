//! Fields shared by every defect kind, composed into concrete records.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::AppError;
use crate::models::defect_status::DefectStatus;

/// Developer acknowledgement on a defect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Mark {
    #[default]
    None,
    Tagged,
    Prompted,
}

impl TryFrom<i32> for Mark {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Tagged),
            2 => Ok(Self::Prompted),
            other => Err(format!("unknown mark value {other}")),
        }
    }
}

impl From<Mark> for i32 {
    fn from(mark: Mark) -> Self {
        match mark {
            Mark::None => 0,
            Mark::Tagged => 1,
            Mark::Prompted => 2,
        }
    }
}

const ANALYSIS_VERSION_PREFIX: &str = "ANALYSIS_VERSION";

/// Tag of the scan run that last observed a defect.
///
/// Wire form: `ANALYSIS_VERSION:<taskId>:<toolName>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AnalysisVersion {
    pub task_id: i64,
    pub tool_name: String,
}

impl AnalysisVersion {
    pub fn new(task_id: i64, tool_name: impl Into<String>) -> Self {
        Self {
            task_id,
            tool_name: tool_name.into(),
        }
    }
}

impl fmt::Display for AnalysisVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ANALYSIS_VERSION_PREFIX}:{}:{}",
            self.task_id, self.tool_name
        )
    }
}

impl FromStr for AnalysisVersion {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::Validation(format!("Malformed analysis version: {s}"));

        // Tool names may themselves contain ':', so split at most twice.
        let mut parts = s.splitn(3, ':');
        if parts.next() != Some(ANALYSIS_VERSION_PREFIX) {
            return Err(invalid());
        }
        let task_id = parts
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let tool_name = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;

        Ok(Self::new(task_id, tool_name))
    }
}

impl TryFrom<String> for AnalysisVersion {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnalysisVersion> for String {
    fn from(version: AnalysisVersion) -> Self {
        version.to_string()
    }
}

/// Lifecycle, provenance and versioning fields common to all defect kinds.
///
/// Timestamps are epoch milliseconds, matching the stored documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefectCommon {
    pub tool_name: Option<String>,
    pub status: DefectStatus,

    pub create_time: Option<i64>,
    pub fixed_time: Option<i64>,
    pub ignore_time: Option<i64>,
    pub ignore_reason_type: Option<i32>,
    pub ignore_reason: Option<String>,
    pub ignore_author: Option<String>,
    pub exclude_time: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub mark: Option<Mark>,
    pub mark_time: Option<i64>,

    pub author: Option<String>,
    pub rel_path: Option<String>,
    pub file_path: Option<String>,
    pub url: Option<String>,
    pub repo_id: Option<String>,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub sub_module: Option<String>,
    pub md5: Option<String>,

    #[serde(deserialize_with = "lenient")]
    pub analysis_version: Option<AnalysisVersion>,
    pub create_build_number: Option<String>,
    pub fixed_build_number: Option<String>,
}

impl DefectCommon {
    /// Path used by exclusion rules: the repository-relative path when known.
    pub fn match_path(&self) -> Option<&str> {
        self.rel_path.as_deref().or(self.file_path.as_deref())
    }

    /// Check the timestamp pairings that must follow the status bits.
    pub fn timestamp_violations(&self) -> Vec<String> {
        let status = self.status;
        let mut violations = Vec::new();

        let pairs = [
            ("fixed_time", status.contains(DefectStatus::FIXED), self.fixed_time),
            ("ignore_time", status.contains(DefectStatus::IGNORE), self.ignore_time),
            ("exclude_time", status.is_masked(), self.exclude_time),
        ];
        for (field, flagged, time) in pairs {
            match (flagged, time) {
                (true, None) => violations.push(format!("{field} missing for status {status}")),
                (false, Some(_)) => {
                    violations.push(format!("{field} set without matching status bit"))
                }
                _ => {}
            }
        }

        if status.contains(DefectStatus::NEW | DefectStatus::FIXED) {
            violations.push("NEW and FIXED both set".to_string());
        }

        violations
    }
}

/// Read an optional field that must not fail the whole document.
///
/// A malformed value is logged and read as absent, so one bad stored record
/// does not block loading the rest of its task.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    match serde_json::from_value::<Option<T>>(raw.clone()) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(value = %raw, error = %e, "Dropping malformed stored field");
            Ok(None)
        }
    }
}
