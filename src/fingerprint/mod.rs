//! Dependency fingerprints
//!
//! A fingerprint is the SHA-256 hex digest of the RFC 8785 canonical JSON
//! form of `{dependencies, build_properties, runtime_version}`. Dependencies
//! are sorted and deduplicated before hashing, so two requests naming the
//! same set in a different order share a fingerprint.

mod matcher;

pub use matcher::{MatchCandidate, MatchError, MatchOutcome, Matcher};

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Fingerprint errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("JCS canonicalization failed: {0}")]
    Jcs(String),
}

#[derive(Serialize)]
struct FingerprintInputs<'a> {
    dependencies: &'a BTreeSet<String>,
    build_properties: &'a BTreeMap<String, String>,
    runtime_version: &'a str,
}

/// Compute the dependency fingerprint.
pub fn fingerprint(
    dependencies: &BTreeSet<String>,
    build_properties: &BTreeMap<String, String>,
    runtime_version: &str,
) -> Result<String, FingerprintError> {
    let inputs = FingerprintInputs {
        dependencies,
        build_properties,
        runtime_version,
    };
    let jcs_bytes =
        serde_json_canonicalizer::to_vec(&inputs).map_err(|e| FingerprintError::Jcs(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&jcs_bytes);
    Ok(hex::encode(hasher.finalize()))
}
