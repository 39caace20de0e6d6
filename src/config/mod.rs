//! Configuration merge system
//!
//! Three layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. Platform file (`kiln.toml`)
//! 3. CLI overrides

mod defaults;
mod effective;
mod merge;

pub use defaults::BuiltinDefaults;
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, PlatformSettings};
pub use merge::{deep_merge, merge_layers};
