//! Per-platform scheduling configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default build timeout in seconds.
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 300;

/// Default retry budget for transient build failures.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Ordering policy for pending builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStrategy {
    /// One build at a time, arrival order.
    Sequential,
    /// Arrival order under the concurrency cap.
    #[default]
    Fifo,
    /// Children wait for their incremental base build.
    Dependencies,
}

impl std::fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStrategy::Sequential => write!(f, "sequential"),
            OrderStrategy::Fifo => write!(f, "fifo"),
            OrderStrategy::Dependencies => write!(f, "dependencies"),
        }
    }
}

impl std::str::FromStr for OrderStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(OrderStrategy::Sequential),
            "fifo" => Ok(OrderStrategy::Fifo),
            "dependencies" => Ok(OrderStrategy::Dependencies),
            other => Err(format!(
                "unknown order strategy '{}' (expected sequential, fifo or dependencies)",
                other
            )),
        }
    }
}

/// Scheduler configuration for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub order_strategy: OrderStrategy,
    /// Cap on concurrently running builds; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_running_builds: Option<u32>,
    #[serde(default = "default_timeout")]
    pub build_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    DEFAULT_BUILD_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            order_strategy: OrderStrategy::default(),
            max_running_builds: None,
            build_timeout_seconds: DEFAULT_BUILD_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PlatformConfig {
    /// Number of builds allowed to run at once.
    pub fn effective_slots(&self) -> usize {
        match self.order_strategy {
            OrderStrategy::Sequential => 1,
            _ => self
                .max_running_builds
                .map(|n| n.max(1) as usize)
                .unwrap_or(usize::MAX),
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_seconds)
    }
}
