//! Integrations: the live consumers that keep kits in use.

use serde::{Deserialize, Serialize};

/// A running consumer bound to one kit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub namespace: String,
    pub name: String,
    /// Name of the kit (same namespace) this integration runs on.
    pub kit: String,
    /// Image the integration was last deployed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Incremented on every controlled restart.
    #[serde(default)]
    pub generation: u64,
}

impl Integration {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kit: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kit: kit.into(),
            image: None,
            generation: 0,
        }
    }

    /// Switch to a new kit and image, bumping the generation.
    pub fn redeploy(&mut self, kit: impl Into<String>, image: Option<String>) {
        self.kit = kit.into();
        self.image = image;
        self.generation += 1;
    }
}
