//! Risk banding of a defect's cyclomatic complexity.
//!
//! Bands are a task policy supplied at read time. The result is never stored
//! next to `ccn`, so changing the thresholds re-bands every existing defect on
//! the next read.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Risk band. Values are bit flags so read paths can filter on a union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RiskFactor {
    VeryHigh,
    High,
    Medium,
    Low,
}

impl RiskFactor {
    pub const fn bits(self) -> i32 {
        match self {
            Self::VeryHigh => 1,
            Self::High => 2,
            Self::Medium => 4,
            Self::Low => 8,
        }
    }

    /// True when this band is part of a combined filter mask.
    pub fn matches_mask(self, mask: i32) -> bool {
        mask & self.bits() != 0
    }
}

impl TryFrom<i32> for RiskFactor {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::VeryHigh),
            2 => Ok(Self::High),
            4 => Ok(Self::Medium),
            8 => Ok(Self::Low),
            other => Err(format!("unknown risk factor {other}")),
        }
    }
}

impl From<RiskFactor> for i32 {
    fn from(risk: RiskFactor) -> Self {
        risk.bits()
    }
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VeryHigh => write!(f, "VERY_HIGH"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// Upper CCN bound of the LOW, MEDIUM and HIGH bands. Anything above `high`
/// is VERY_HIGH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[i32; 3]", into = "[i32; 3]")]
pub struct RiskThresholds {
    low: i32,
    medium: i32,
    high: i32,
}

impl RiskThresholds {
    /// Build a threshold table; cut points must be positive and strictly ascending.
    pub fn new(low: i32, medium: i32, high: i32) -> Result<Self, AppError> {
        if low < 1 {
            return Err(AppError::Validation(format!(
                "Risk threshold LOW must be at least 1, got {low}"
            )));
        }
        if !(low < medium && medium < high) {
            return Err(AppError::Validation(format!(
                "Risk thresholds must ascend strictly, got {low},{medium},{high}"
            )));
        }
        Ok(Self { low, medium, high })
    }

    /// Parse `"low,medium,high"`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let parts = raw
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Validation(format!("Invalid risk thresholds '{raw}': {e}")))?;
        match parts.as_slice() {
            [low, medium, high] => Self::new(*low, *medium, *high),
            _ => Err(AppError::Validation(format!(
                "Expected three risk thresholds, got '{raw}'"
            ))),
        }
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn medium(&self) -> i32 {
        self.medium
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    /// Smallest band whose upper bound is at least `ccn`.
    pub fn classify(&self, ccn: i32) -> RiskFactor {
        if ccn <= self.low {
            RiskFactor::Low
        } else if ccn <= self.medium {
            RiskFactor::Medium
        } else if ccn <= self.high {
            RiskFactor::High
        } else {
            RiskFactor::VeryHigh
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 10,
            medium: 20,
            high: 30,
        }
    }
}

impl TryFrom<[i32; 3]> for RiskThresholds {
    type Error = AppError;

    fn try_from([low, medium, high]: [i32; 3]) -> Result<Self, Self::Error> {
        Self::new(low, medium, high)
    }
}

impl From<RiskThresholds> for [i32; 3] {
    fn from(t: RiskThresholds) -> Self {
        [t.low, t.medium, t.high]
    }
}

/// Classify a CCN against a threshold table.
pub fn risk_factor(ccn: i32, thresholds: &RiskThresholds) -> RiskFactor {
    thresholds.classify(ccn)
}
