//! Effective configuration with provenance
//!
//! The merged configuration plus where each layer came from, and the typed
//! platform settings read out of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use kiln_api::{OrderStrategy, PlatformConfig};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use crate::scheduler::timeout::{validate_build_timeout, MAX_BUILD_TIMEOUT_SECS};

/// Schema identifier
pub const SCHEMA_ID: &str = "kiln/effective_config@1";

/// Accepted range for `build.max_retries`.
pub const MAX_RETRIES_RANGE: std::ops::RangeInclusive<u64> = 1..=100;

/// Origin of a configuration layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Platform,
    Cli,
}

/// A contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (platform layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (platform layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged configuration with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub config: Value,
    /// Contributing layers, lowest precedence first
    pub sources: Vec<ConfigSource>,
    /// Credential keys masked in `config`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redactions: Vec<String>,
}

/// Registry credential keys never echoed back by `config show`.
const CREDENTIAL_KEYS: &[&str] = &["password", "token", "auth"];

const MASK: &str = "***";

impl EffectiveConfig {
    /// Merge built-in defaults, the platform file and CLI overrides.
    ///
    /// A missing platform file is skipped; an unreadable one is an error.
    pub fn build(
        platform_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource::builtin()];

        if let Some(path) = platform_path.filter(|p| p.exists()) {
            let (value, source) = read_platform_file(path)?;
            layers.push(value);
            sources.push(source);
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let mut config = merge_layers(layers);
        let redactions = mask_registry_credentials(&mut config);
        let effective = Self {
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config,
            sources,
            redactions,
        };
        PlatformSettings::from_effective(&effective)?;
        Ok(effective)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Value at a dotted key such as `build.max_retries`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.config, |value, part| value.get(part))
    }
}

impl ConfigSource {
    fn builtin() -> Self {
        Self {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }
    }
}

fn read_platform_file(path: &Path) -> Result<(Value, ConfigSource), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let text = std::str::from_utf8(&bytes)
        .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
    let table: toml::Table =
        toml::from_str(text).map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
    let value = serde_json::to_value(table)
        .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

    let source = ConfigSource {
        origin: ConfigOrigin::Platform,
        path: Some(path.display().to_string()),
        digest: Some(digest),
    };
    Ok((value, source))
}

/// Mask scalar credentials under `registry` and return their dotted keys.
fn mask_registry_credentials(config: &mut Value) -> Vec<String> {
    let Some(registry) = config.get_mut("registry").and_then(Value::as_object_mut) else {
        return Vec::new();
    };
    let mut masked = Vec::new();
    for (key, value) in registry.iter_mut() {
        let lower = key.to_ascii_lowercase();
        let is_credential = CREDENTIAL_KEYS.iter().any(|c| lower.ends_with(c));
        if is_credential && !value.is_null() && !value.is_object() {
            *value = Value::String(MASK.to_string());
            masked.push(format!("registry.{}", key));
        }
    }
    masked
}

/// Typed settings for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformSettings {
    pub scheduler: PlatformConfig,
    pub incremental: bool,
    pub repository: String,
    pub base_image: String,
    pub operator_version: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            scheduler: PlatformConfig::default(),
            incremental: defaults.incremental,
            repository: defaults.repository,
            base_image: defaults.base_image,
            operator_version: defaults.operator_version,
        }
    }
}

impl PlatformSettings {
    /// Read and validate settings from a merged configuration.
    pub fn from_effective(config: &EffectiveConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let order_strategy = match config.get("build.order_strategy") {
            None => defaults.scheduler.order_strategy,
            Some(v) => v
                .as_str()
                .ok_or_else(|| invalid("build.order_strategy", "must be a string"))?
                .parse::<OrderStrategy>()
                .map_err(ConfigError::Invalid)?,
        };

        let max_running_builds = match optional_u64(config, "build.max_running_builds")? {
            None | Some(0) => None,
            Some(n) => Some(
                u32::try_from(n)
                    .map_err(|_| invalid("build.max_running_builds", "is too large"))?,
            ),
        };

        let build_timeout_seconds = optional_u64(config, "build.timeout_seconds")?
            .unwrap_or(defaults.scheduler.build_timeout_seconds);
        validate_build_timeout(build_timeout_seconds).map_err(|_| {
            invalid(
                "build.timeout_seconds",
                &format!("must be in (0, {}]", MAX_BUILD_TIMEOUT_SECS),
            )
        })?;

        let max_retries = match optional_u64(config, "build.max_retries")? {
            None => defaults.scheduler.max_retries,
            Some(n) if MAX_RETRIES_RANGE.contains(&n) => n as u32,
            Some(_) => {
                return Err(invalid(
                    "build.max_retries",
                    &format!(
                        "must be in [{}, {}]",
                        MAX_RETRIES_RANGE.start(),
                        MAX_RETRIES_RANGE.end()
                    ),
                ))
            }
        };

        let incremental = match config.get("build.incremental") {
            None => defaults.incremental,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| invalid("build.incremental", "must be a boolean"))?,
        };

        Ok(Self {
            scheduler: PlatformConfig {
                order_strategy,
                max_running_builds,
                build_timeout_seconds,
                max_retries,
            },
            incremental,
            repository: required_str(config, "registry.repository", defaults.repository)?,
            base_image: required_str(config, "registry.base_image", defaults.base_image)?,
            operator_version: required_str(config, "operator.version", defaults.operator_version)?,
        })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid(format!("{} {}", key, message))
}

fn optional_u64(config: &EffectiveConfig, key: &str) -> Result<Option<u64>, ConfigError> {
    match config.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(key, "must be a non-negative integer")),
    }
}

fn required_str(config: &EffectiveConfig, key: &str, default: String) -> Result<String, ConfigError> {
    match config.get(key) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
            _ => Err(invalid(key, "must be a non-empty string")),
        },
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {0}")]
    Parse(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_only() {
        let config = EffectiveConfig::build(None, None).unwrap();
        assert_eq!(config.get("build.order_strategy"), Some(&json!("fifo")));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);

        let settings = PlatformSettings::from_effective(&config).unwrap();
        assert_eq!(settings, PlatformSettings::default());
        assert_eq!(settings.scheduler.max_running_builds, None);
    }

    #[test]
    fn test_platform_file_then_cli() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[build]").unwrap();
        writeln!(temp, "order_strategy = \"dependencies\"").unwrap();
        writeln!(temp, "max_running_builds = 2").unwrap();
        writeln!(temp, "timeout_seconds = 900").unwrap();

        let cli = json!({"build": {"max_running_builds": 3}});
        let config = EffectiveConfig::build(Some(temp.path()), Some(cli)).unwrap();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[1].origin, ConfigOrigin::Platform);
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);

        let settings = PlatformSettings::from_effective(&config).unwrap();
        assert_eq!(settings.scheduler.order_strategy, OrderStrategy::Dependencies);
        assert_eq!(settings.scheduler.max_running_builds, Some(3));
        assert_eq!(settings.scheduler.build_timeout_seconds, 900);
        assert_eq!(settings.scheduler.max_retries, 5);
    }

    #[test]
    fn test_missing_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = EffectiveConfig::build(Some(&dir.path().join("kiln.toml")), None).unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_bad_toml() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[build").unwrap();
        let err = EffectiveConfig::build(Some(temp.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_bounds() {
        for (cli, key) in [
            (json!({"build": {"timeout_seconds": 0}}), "build.timeout_seconds"),
            (json!({"build": {"timeout_seconds": 86401}}), "build.timeout_seconds"),
            (json!({"build": {"max_retries": 0}}), "build.max_retries"),
            (json!({"build": {"max_retries": 101}}), "build.max_retries"),
            (json!({"build": {"order_strategy": "lifo"}}), "lifo"),
            (json!({"build": {"incremental": "yes"}}), "build.incremental"),
            (json!({"registry": {"repository": ""}}), "registry.repository"),
        ] {
            let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
            assert!(err.to_string().contains(key), "{} not in {}", key, err);
        }
    }

    #[test]
    fn test_registry_credentials_masked() {
        let cli = json!({"registry": {"password": "hunter2", "username": "kiln", "push_token": 42}});
        let config = EffectiveConfig::build(None, Some(cli)).unwrap();

        assert_eq!(config.get("registry.password"), Some(&json!("***")));
        assert_eq!(config.get("registry.push_token"), Some(&json!("***")));
        assert_eq!(config.get("registry.username"), Some(&json!("kiln")));
        assert_eq!(config.redactions, vec!["registry.password", "registry.push_token"]);
        assert!(!config.to_json().unwrap().contains("hunter2"));
    }
}
