//! Business logic services.

pub mod defect_store;
pub mod fingerprint;
pub mod lifecycle;
pub mod masking;
pub mod matching;
pub mod presentation;
pub mod reconciliation;
pub mod risk_factor;
