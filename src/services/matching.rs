//! Identity matching of scan observations against stored defects.
//!
//! The primary key is `func_signature`. When a key is missing on the
//! observation, or resolves to more than one unclaimed record, the next key in
//! the policy is tried. Each stored record can be matched at most once per scan.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde::Serialize;

use crate::errors::AppError;
use crate::models::ccn_defect::{CcnDefect, LocationKey};
use crate::models::observation::FunctionObservation;

/// An identity key usable for cross-scan matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    Signature,
    Pinpoint,
    Location,
}

impl FromStr for MatchKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signature" | "func_signature" => Ok(Self::Signature),
            "pinpoint" | "pinpoint_hash" => Ok(Self::Pinpoint),
            "location" => Ok(Self::Location),
            other => Err(AppError::Validation(format!("Unknown match key '{other}'"))),
        }
    }
}

/// Ordered list of keys to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPolicy {
    precedence: Vec<MatchKey>,
}

impl MatchPolicy {
    /// Build a policy; `Signature` must be present and keys may not repeat.
    pub fn new(precedence: Vec<MatchKey>) -> Result<Self, AppError> {
        if !precedence.contains(&MatchKey::Signature) {
            return Err(AppError::Validation(
                "Match precedence must include signature".to_string(),
            ));
        }
        let unique: HashSet<_> = precedence.iter().collect();
        if unique.len() != precedence.len() {
            return Err(AppError::Validation(
                "Match precedence lists a key twice".to_string(),
            ));
        }
        Ok(Self { precedence })
    }

    /// Parse a comma-separated list such as `"signature,pinpoint,location"`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let keys = raw
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(MatchKey::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(keys)
    }

    pub fn precedence(&self) -> &[MatchKey] {
        &self.precedence
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            precedence: vec![MatchKey::Signature, MatchKey::Pinpoint, MatchKey::Location],
        }
    }
}

/// Outcome of matching one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// No stored record matches; the function is new.
    New,
    /// Matched the record at this index in the indexed slice.
    Matched { index: usize, key: MatchKey },
    /// More than one unclaimed record carries the key.
    Ambiguous { key: MatchKey, candidates: Vec<usize> },
}

/// Lookup tables over the current records of one task.
#[derive(Debug, Default)]
pub struct DefectIndex {
    by_signature: HashMap<String, Vec<usize>>,
    by_pinpoint: HashMap<String, Vec<usize>>,
    by_location: HashMap<LocationKey, Vec<usize>>,
    claimed: HashSet<usize>,
}

impl DefectIndex {
    /// Index `defects` by every key they carry. Indices refer to this slice.
    pub fn build(defects: &[CcnDefect]) -> Self {
        let mut index = Self::default();
        for (i, defect) in defects.iter().enumerate() {
            index.insert(i, defect);
        }
        index
    }

    fn insert(&mut self, i: usize, defect: &CcnDefect) {
        if !defect.func_signature.is_empty() {
            self.by_signature
                .entry(defect.func_signature.clone())
                .or_default()
                .push(i);
        }
        if let Some(pp) = defect.pinpoint_hash.as_ref().filter(|p| !p.is_empty()) {
            self.by_pinpoint.entry(pp.clone()).or_default().push(i);
        }
        if let Some(location) = defect.location_key() {
            self.by_location.entry(location).or_default().push(i);
        }
    }

    /// Resolve an observation using a single key. A key the observation does
    /// not carry resolves to `New`.
    pub fn resolve_key(&self, obs: &FunctionObservation, key: MatchKey) -> MatchResult {
        let candidates = self.candidates(obs, key).unwrap_or_default();
        match candidates.len() {
            0 => MatchResult::New,
            1 => MatchResult::Matched {
                index: candidates[0],
                key,
            },
            _ => MatchResult::Ambiguous { key, candidates },
        }
    }

    /// Mark a record as taken by an observation of this scan.
    pub fn claim(&mut self, index: usize) {
        self.claimed.insert(index);
    }

    /// Records currently holding `signature`, other than `except`.
    pub fn signature_holders(&self, signature: &str, except: Option<usize>) -> Vec<usize> {
        self.by_signature
            .get(signature)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|&i| Some(i) != except)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn candidates(&self, obs: &FunctionObservation, key: MatchKey) -> Option<Vec<usize>> {
        let ids = match key {
            MatchKey::Signature => {
                let sig = Some(obs.func_signature.as_str()).filter(|s| !s.is_empty())?;
                self.by_signature.get(sig)
            }
            MatchKey::Pinpoint => {
                let pp = obs.pinpoint_hash.as_deref().filter(|p| !p.is_empty())?;
                self.by_pinpoint.get(pp)
            }
            MatchKey::Location => self.by_location.get(&obs.location_key()?),
        };
        Some(
            ids.map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|i| !self.claimed.contains(i))
                    .collect()
            })
            .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defect(sig: &str, pinpoint: Option<&str>, name: &str) -> CcnDefect {
        let mut d = CcnDefect {
            task_id: 1,
            func_signature: sig.to_string(),
            function_name: Some(name.to_string()),
            long_name: Some(format!("ns::{name}()")),
            pinpoint_hash: pinpoint.map(str::to_string),
            ccn: 20,
            ..Default::default()
        };
        d.common.rel_path = Some("src/lib.c".to_string());
        d
    }

    fn obs(sig: &str, pinpoint: Option<&str>, name: &str) -> FunctionObservation {
        FunctionObservation {
            task_id: 1,
            func_signature: sig.to_string(),
            function_name: Some(name.to_string()),
            long_name: Some(format!("ns::{name}()")),
            pinpoint_hash: pinpoint.map(str::to_string),
            rel_path: Some("src/lib.c".to_string()),
            ccn: 20,
            ..Default::default()
        }
    }

    #[test]
    fn signature_key_matches_signature_only() {
        let defects = vec![defect("a", Some("p1"), "alpha"), defect("b", Some("p2"), "beta")];
        let index = DefectIndex::build(&defects);
        assert_eq!(
            index.resolve_key(&obs("b", Some("p1"), "alpha"), MatchKey::Signature),
            MatchResult::Matched {
                index: 1,
                key: MatchKey::Signature
            }
        );
        assert_eq!(
            index.resolve_key(&obs("c", Some("p1"), "alpha"), MatchKey::Signature),
            MatchResult::New
        );
    }

    #[test]
    fn pinpoint_survives_signature_change() {
        let defects = vec![defect("old-sig", Some("p1"), "alpha")];
        let index = DefectIndex::build(&defects);
        assert_eq!(
            index.resolve_key(&obs("new-sig", Some("p1"), "renamed"), MatchKey::Pinpoint),
            MatchResult::Matched {
                index: 0,
                key: MatchKey::Pinpoint
            }
        );
    }

    #[test]
    fn location_key_matches_same_function() {
        let defects = vec![defect("old-sig", None, "alpha")];
        let index = DefectIndex::build(&defects);
        assert_eq!(
            index.resolve_key(&obs("new-sig", None, "alpha"), MatchKey::Location),
            MatchResult::Matched {
                index: 0,
                key: MatchKey::Location
            }
        );
    }

    #[test]
    fn missing_key_on_observation_resolves_new() {
        let defects = vec![defect("a", Some("p1"), "alpha")];
        let index = DefectIndex::build(&defects);
        assert_eq!(
            index.resolve_key(&obs("z", None, "alpha"), MatchKey::Pinpoint),
            MatchResult::New
        );
    }

    #[test]
    fn shared_pinpoint_is_ambiguous() {
        let defects = vec![defect("x", Some("dup"), "alpha"), defect("y", Some("dup"), "beta")];
        let index = DefectIndex::build(&defects);
        assert_eq!(
            index.resolve_key(&obs("z", Some("dup"), "gamma"), MatchKey::Pinpoint),
            MatchResult::Ambiguous {
                key: MatchKey::Pinpoint,
                candidates: vec![0, 1]
            }
        );
    }

    #[test]
    fn claimed_records_are_skipped() {
        let defects = vec![defect("x", Some("dup"), "alpha"), defect("y", Some("dup"), "beta")];
        let mut index = DefectIndex::build(&defects);
        index.claim(0);
        assert_eq!(
            index.resolve_key(&obs("x", Some("dup"), "alpha"), MatchKey::Signature),
            MatchResult::New
        );
        assert_eq!(
            index.resolve_key(&obs("z", Some("dup"), "gamma"), MatchKey::Pinpoint),
            MatchResult::Matched {
                index: 1,
                key: MatchKey::Pinpoint
            }
        );
    }

    #[test]
    fn policy_parse() {
        let policy = MatchPolicy::parse("signature, location").unwrap();
        assert_eq!(policy.precedence(), &[MatchKey::Signature, MatchKey::Location]);
        assert!(MatchPolicy::parse("pinpoint").is_err());
        assert!(MatchPolicy::parse("signature,signature").is_err());
        assert!(MatchPolicy::parse("signature,checksum").is_err());
    }

    #[test]
    fn signature_holders_excludes_self() {
        let defects = vec![defect("a", None, "alpha"), defect("b", None, "beta")];
        let index = DefectIndex::build(&defects);
        assert_eq!(index.signature_holders("a", Some(1)), vec![0]);
        assert!(index.signature_holders("a", Some(0)).is_empty());
        assert_eq!(index.signature_holders("b", None), vec![1]);
    }
}
