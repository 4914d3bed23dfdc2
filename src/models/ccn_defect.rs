//! Cyclomatic complexity defect record and its associated value types.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::defect_common::DefectCommon;

/// One function whose cyclomatic complexity exceeds the task threshold.
///
/// Only persisted fields live here; risk and "new defect" are derived on read
/// by [`crate::services::presentation`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcnDefect {
    /// Storage-assigned surrogate key. Never used for cross-scan matching.
    #[serde(rename = "_id")]
    pub entity_id: Option<String>,
    pub task_id: i64,
    pub func_signature: String,
    pub function_name: Option<String>,
    pub long_name: Option<String>,

    pub ccn: i32,
    #[serde(rename = "latest_datetime")]
    pub latest_date_time: Option<i64>,
    pub start_lines: Option<i32>,
    pub end_lines: Option<i32>,
    pub total_lines: Option<i32>,
    pub condition_lines: ConditionLines,
    pub pinpoint_hash: Option<String>,

    #[serde(flatten)]
    pub common: DefectCommon,

    pub code_comment: Option<CodeComment>,
}

impl CcnDefect {
    /// Location key used as the last matching fallback.
    pub fn location_key(&self) -> Option<LocationKey> {
        LocationKey::new(
            self.common.rel_path.as_deref(),
            self.function_name.as_deref(),
            self.long_name.as_deref(),
        )
    }

    /// Every invariant violation on this record, empty when it is well formed.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.func_signature.trim().is_empty() {
            violations.push("func_signature is empty".to_string());
        }
        if self.ccn < 1 {
            violations.push(format!("ccn must be at least 1, got {}", self.ccn));
        }
        if let Err(e) = check_line_range(self.start_lines, self.end_lines, self.total_lines) {
            violations.push(e);
        }
        violations.extend(self.common.timestamp_violations());
        violations
    }
}

/// Check `end >= start` and `total >= end - start + 1` for whichever values are present.
pub fn check_line_range(
    start: Option<i32>,
    end: Option<i32>,
    total: Option<i32>,
) -> Result<(), String> {
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(());
    };
    if end < start {
        return Err(format!("end_lines {end} is before start_lines {start}"));
    }
    if let Some(total) = total {
        let span = i64::from(end) - i64::from(start) + 1;
        if i64::from(total) < span {
            return Err(format!(
                "total_lines {total} is smaller than the {span} lines between start and end"
            ));
        }
    }
    Ok(())
}

/// `(rel_path, function_name, long_name)`, all present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub rel_path: String,
    pub function_name: String,
    pub long_name: String,
}

impl LocationKey {
    pub fn new(
        rel_path: Option<&str>,
        function_name: Option<&str>,
        long_name: Option<&str>,
    ) -> Option<Self> {
        Some(Self {
            rel_path: rel_path.filter(|s| !s.is_empty())?.to_string(),
            function_name: function_name.filter(|s| !s.is_empty())?.to_string(),
            long_name: long_name.filter(|s| !s.is_empty())?.to_string(),
        })
    }
}

/// Line numbers of the decision points that contribute to the CCN.
///
/// Stored as a comma-delimited string, e.g. `"12,15,31"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionLines(pub Vec<u32>);

impl ConditionLines {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("invalid condition line '{part}'"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for ConditionLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl Serialize for ConditionLines {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConditionLines {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => Self::parse(&raw).map_err(serde::de::Error::custom),
            None => Ok(Self::default()),
        }
    }
}

/// Review comments attached to a defect. Owned by the comment service; the
/// defect only carries the reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeComment {
    #[serde(rename = "_id")]
    pub entity_id: Option<String>,
    pub comment_list: Vec<SingleComment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleComment {
    pub single_comment: String,
    pub user_name: String,
    pub comment_time: Option<i64>,
}
