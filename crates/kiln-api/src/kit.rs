//! Kit records: the externally visible projection of the artifact graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kit lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum KitPhase {
    Building,
    Ready,
    Error,
}

impl std::fmt::Display for KitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitPhase::Building => write!(f, "Building"),
            KitPhase::Ready => write!(f, "Ready"),
            KitPhase::Error => write!(f, "Error"),
        }
    }
}

/// Who produced the kit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KitType {
    /// Built by the platform; subject to garbage collection.
    #[default]
    Platform,
    /// Declared by a user with a prebuilt image; never collected.
    External,
}

/// A built, reusable image plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kit {
    pub namespace: String,
    pub name: String,
    /// SHA-256 over the canonical dependency set, properties and runtime version.
    pub dependency_fingerprint: String,
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub build_properties: BTreeMap<String, String>,
    pub runtime_version: String,
    /// Parent kit this one is layered on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_kit: Option<String>,
    /// Image this kit's image was built on top of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Derived from integration bindings; ignored on input.
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub priority: i32,
    /// Operator version that produced the kit.
    pub version: String,
    pub phase: KitPhase,
    #[serde(default)]
    pub kit_type: KitType,
    pub created_at: DateTime<Utc>,
}

impl Kit {
    /// `namespace/name` display key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kit_type_default_and_wire_names() {
        assert_eq!(KitType::default(), KitType::Platform);
        assert_eq!(serde_json::to_string(&KitType::External).unwrap(), "\"external\"");
        assert_eq!(serde_json::to_string(&KitPhase::Building).unwrap(), "\"Building\"");
    }

    #[test]
    fn test_kit_optional_fields() {
        let json = r#"{
            "namespace": "default",
            "name": "kit-a",
            "dependency_fingerprint": "abc",
            "dependencies": ["camel:log"],
            "runtime_version": "1.15.0",
            "version": "0.1.0",
            "phase": "Ready",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let kit: Kit = serde_json::from_str(json).unwrap();
        assert_eq!(kit.key(), "default/kit-a");
        assert!(!kit.used);
        assert_eq!(kit.kit_type, KitType::Platform);
        assert!(kit.base_kit.is_none());

        let out = serde_json::to_value(&kit).unwrap();
        assert!(out.get("image").is_none());
        assert!(out.get("base_kit").is_none());
    }
}
