//! Fingerprints for scan pipelines that do not supply their own identity keys.
//!
//! Both hashes exclude line numbers: edits above a function shift its lines
//! without changing which function it is.

use sha2::{Digest, Sha256};

/// Compute a function signature from its file and fully-qualified name.
pub fn compute_func_signature(rel_path: &str, long_name: &str) -> String {
    hash(&format!("CCN:{rel_path}:{long_name}"))
}

/// Compute a position-independent fingerprint of a function body.
///
/// Whitespace runs collapse to a single space and blank lines are dropped,
/// so reindenting or moving the function does not change the hash.
pub fn compute_pinpoint_hash(function_text: &str) -> String {
    let normalized = function_text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    hash(&format!("PINPOINT:{normalized}"))
}

/// SHA-256 hash a string and return hex-encoded digest.
fn hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
