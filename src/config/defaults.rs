//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

use kiln_api::platform::{DEFAULT_BUILD_TIMEOUT_SECS, DEFAULT_MAX_RETRIES};
use kiln_api::OrderStrategy;

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Pending build ordering (default: "fifo")
    pub order_strategy: OrderStrategy,

    /// Concurrent build cap, 0 = unbounded (default: 0)
    pub max_running_builds: u32,

    /// Per-attempt timeout in seconds (default: 300)
    pub timeout_seconds: u64,

    /// Transient failure budget (default: 5)
    pub max_retries: u32,

    /// Layer new kits on existing ones (default: true)
    pub incremental: bool,

    /// Repository new images are pushed to
    pub repository: String,

    /// Image root builds start from
    pub base_image: String,

    /// Version stamped on new kits
    pub operator_version: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            order_strategy: OrderStrategy::Fifo,
            max_running_builds: 0,
            timeout_seconds: DEFAULT_BUILD_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            incremental: true,
            repository: "registry.kiln.local/kiln".to_string(),
            base_image: "registry.kiln.local/kiln/base:latest".to_string(),
            operator_version: crate::OPERATOR_VERSION.to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "build": {
                "order_strategy": self.order_strategy.to_string(),
                "max_running_builds": self.max_running_builds,
                "timeout_seconds": self.timeout_seconds,
                "max_retries": self.max_retries,
                "incremental": self.incremental
            },
            "registry": {
                "repository": self.repository,
                "base_image": self.base_image
            },
            "operator": {
                "version": self.operator_version
            }
        })
    }
}
