//! Path exclusion and checker disable rules.
//!
//! Path patterns are regular expressions tried against the defect's
//! repository-relative path (falling back to the absolute file path). A
//! checker rule matches when the tool that produced the defect is disabled
//! for the task.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Mask rules as configured for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskRules {
    pub path_patterns: Vec<String>,
    pub disabled_checkers: Vec<String>,
}

impl MaskRules {
    /// Compile the path patterns. An invalid pattern rejects the whole rule set
    /// so that a typo never silently unmasks defects.
    pub fn compile(&self) -> Result<MaskMatcher, AppError> {
        let paths = self
            .path_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    AppError::Validation(format!("Invalid path mask pattern '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MaskMatcher {
            paths,
            disabled_checkers: self.disabled_checkers.clone(),
        })
    }
}

/// Which mask rules hit a defect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskHits {
    pub path: bool,
    pub checker: bool,
}

impl MaskHits {
    pub fn any(self) -> bool {
        self.path || self.checker
    }
}

/// Compiled form of [`MaskRules`].
#[derive(Debug, Clone, Default)]
pub struct MaskMatcher {
    paths: Vec<Regex>,
    disabled_checkers: Vec<String>,
}

impl MaskMatcher {
    pub fn path_matches(&self, path: Option<&str>) -> bool {
        let Some(path) = path else {
            return false;
        };
        self.paths.iter().any(|re| re.is_match(path))
    }

    pub fn checker_disabled(&self, checker: Option<&str>) -> bool {
        let Some(checker) = checker else {
            return false;
        };
        self.disabled_checkers
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(checker))
    }

    pub fn evaluate(&self, path: Option<&str>, checker: Option<&str>) -> MaskHits {
        MaskHits {
            path: self.path_matches(path),
            checker: self.checker_disabled(checker),
        }
    }
}
