use std::env;
use std::str::FromStr;

use crate::services::matching::MatchPolicy;
use crate::services::reconciliation::{EvaluationOrder, ReconcileOptions};
use crate::services::risk_factor::RiskThresholds;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub tool_name: String,
    pub risk_thresholds: RiskThresholds,
    pub evaluation_order: EvaluationOrder,
    pub match_policy: MatchPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            tool_name: env::var("CCN_TOOL_NAME").unwrap_or_else(|_| "CCN".to_string()),
            risk_thresholds: parse_or_default("CCN_RISK_THRESHOLDS", RiskThresholds::parse),
            evaluation_order: parse_or_default("CCN_EVALUATION_ORDER", EvaluationOrder::from_str),
            match_policy: parse_or_default("CCN_MATCH_PRECEDENCE", MatchPolicy::parse),
        })
    }

    /// Thresholds for a task: the batch override when it is valid, else the configured ones.
    pub fn risk_thresholds(&self, task_override: Option<[i32; 3]>) -> RiskThresholds {
        let Some(raw) = task_override else {
            return self.risk_thresholds;
        };
        RiskThresholds::try_from(raw).unwrap_or_else(|e| {
            tracing::warn!(thresholds = ?raw, error = %e, "Ignoring invalid task risk thresholds");
            self.risk_thresholds
        })
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            order: self.evaluation_order,
            matching: self.match_policy.clone(),
        }
    }
}

/// Parse an optional variable, falling back to the default when unset or invalid.
fn parse_or_default<T, E, F>(key: &str, parse: F) -> T
where
    T: Default,
    E: std::fmt::Display,
    F: Fn(&str) -> Result<T, E>,
{
    match env::var(key) {
        Ok(raw) => parse(&raw).unwrap_or_else(|e| {
            tracing::warn!(key, value = %raw, error = %e, "Invalid configuration value, using default");
            T::default()
        }),
        Err(_) => T::default(),
    }
}
