//! Namespace-scoped resource identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use kiln_api::{validate_name, NameError};

/// `namespace/name` key shared by kits, builds and integrations.
///
/// Ordering is lexicographic on (namespace, name) so every traversal and
/// report built on top of it is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// Identifier of an artifact (kit) in the graph.
pub type ArtifactId = ResourceId;

/// Identifier of a build tracked by the scheduler.
pub type BuildId = ResourceId;

/// Identifier of a consumer (integration) bound to an artifact.
pub type ConsumerId = ResourceId;

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Same namespace, different name.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }

    /// Validate both parts as DNS-1123 labels.
    pub fn validate(&self) -> Result<(), NameError> {
        validate_name("namespace", &self.namespace)?;
        validate_name("name", &self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s.split_once('/').ok_or_else(|| NameError::Invalid {
            field: "id",
            value: s.to_string(),
        })?;
        let id = Self::new(namespace, name);
        id.validate()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = ResourceId::new("default", "kit-a");
        assert_eq!(id.to_string(), "default/kit-a");
        assert_eq!("default/kit-a".parse::<ResourceId>().unwrap(), id);
        assert!("kit-a".parse::<ResourceId>().is_err());
        assert!("default/Kit".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_ordering_is_namespace_first() {
        let mut ids = vec![
            ResourceId::new("b", "a"),
            ResourceId::new("a", "z"),
            ResourceId::new("a", "b"),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["a/b", "a/z", "b/a"]
        );
    }
}
