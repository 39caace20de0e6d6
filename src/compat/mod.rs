//! Compatibility gate
//!
//! Consulted before a build is admitted: a runtime catalog that cannot
//! produce a container image tool makes every build for that runtime version
//! fail permanently. Records are computed lazily per runtime version and kept
//! until invalidated (e.g. after a catalog rebuild).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Catalog lookup errors. These are never cached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
}

/// What the gate needs to know about one runtime catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSpec {
    pub runtime_version: String,
    /// Builder image able to package kits for this runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image_tool: Option<String>,
}

/// Source of runtime catalogs.
pub trait CatalogSource: Send {
    fn catalog(&self, runtime_version: &str) -> Result<Option<CatalogSpec>, CatalogError>;
}

/// Catalogs held in memory, keyed by runtime version.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogs {
    catalogs: BTreeMap<String, CatalogSpec>,
    unavailable: bool,
}

impl StaticCatalogs {
    pub fn new<I>(catalogs: I) -> Self
    where
        I: IntoIterator<Item = CatalogSpec>,
    {
        Self {
            catalogs: catalogs
                .into_iter()
                .map(|c| (c.runtime_version.clone(), c))
                .collect(),
            unavailable: false,
        }
    }

    /// Make every lookup fail.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    pub fn insert(&mut self, spec: CatalogSpec) {
        self.catalogs.insert(spec.runtime_version.clone(), spec);
    }

    pub fn specs(&self) -> impl Iterator<Item = &CatalogSpec> {
        self.catalogs.values()
    }
}

impl CatalogSource for StaticCatalogs {
    fn catalog(&self, runtime_version: &str) -> Result<Option<CatalogSpec>, CatalogError> {
        if self.unavailable {
            return Err(CatalogError::Unavailable(format!(
                "lookup of catalog {} failed",
                runtime_version
            )));
        }
        Ok(self.catalogs.get(runtime_version).cloned())
    }
}

/// Cached compatibility verdict for one runtime version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRecord {
    pub runtime_version: String,
    pub compatible: bool,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl CompatibilityRecord {
    /// Failure reason recorded on a rejected build.
    pub fn rejection_reason(&self) -> String {
        format!("Catalog {} error: {}", self.runtime_version, self.message)
    }
}

/// Memoizing compatibility check.
pub struct CompatibilityGate {
    source: Box<dyn CatalogSource>,
    records: BTreeMap<String, CompatibilityRecord>,
}

impl std::fmt::Debug for CompatibilityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatibilityGate")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl CompatibilityGate {
    pub fn new(source: Box<dyn CatalogSource>) -> Self {
        Self {
            source,
            records: BTreeMap::new(),
        }
    }

    /// Check (or recall) whether `runtime_version` can be built.
    pub fn check_compatible(
        &mut self,
        runtime_version: &str,
        now: DateTime<Utc>,
    ) -> Result<CompatibilityRecord, CatalogError> {
        if let Some(record) = self.records.get(runtime_version) {
            return Ok(record.clone());
        }

        let (compatible, message) = match self.source.catalog(runtime_version)? {
            None => (false, format!("Catalog {} not found", runtime_version)),
            Some(spec) if spec.container_image_tool.is_none() => (
                false,
                format!("Container image tool missing in catalog {}", runtime_version),
            ),
            Some(_) => (true, "Container image tool found in catalog".to_string()),
        };

        let record = CompatibilityRecord {
            runtime_version: runtime_version.to_string(),
            compatible,
            message,
            checked_at: now,
        };
        if compatible {
            tracing::debug!(runtime_version, "catalog compatible");
        } else {
            tracing::warn!(runtime_version, message = %record.message, "catalog incompatible");
        }
        self.records
            .insert(runtime_version.to_string(), record.clone());
        Ok(record)
    }

    /// Forget the record for one runtime version.
    pub fn invalidate(&mut self, runtime_version: &str) -> bool {
        self.records.remove(runtime_version).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.records.clear();
    }

    pub fn cached(&self, runtime_version: &str) -> Option<&CompatibilityRecord> {
        self.records.get(runtime_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn spec(version: &str, tool: Option<&str>) -> CatalogSpec {
        CatalogSpec {
            runtime_version: version.to_string(),
            container_image_tool: tool.map(str::to_string),
        }
    }

    struct CountingSource {
        inner: StaticCatalogs,
        calls: Arc<AtomicUsize>,
    }

    impl CatalogSource for CountingSource {
        fn catalog(&self, v: &str) -> Result<Option<CatalogSpec>, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.catalog(v)
        }
    }

    #[test]
    fn test_verdicts() {
        let mut gate = CompatibilityGate::new(Box::new(StaticCatalogs::new([
            spec("1.0.0", Some("registry/builder:1.0.0")),
            spec("2.0.0", None),
        ])));

        let ok = gate.check_compatible("1.0.0", now()).unwrap();
        assert!(ok.compatible);
        assert_eq!(ok.message, "Container image tool found in catalog");

        let missing_tool = gate.check_compatible("2.0.0", now()).unwrap();
        assert!(!missing_tool.compatible);
        assert_eq!(missing_tool.message, "Container image tool missing in catalog 2.0.0");
        assert_eq!(
            missing_tool.rejection_reason(),
            "Catalog 2.0.0 error: Container image tool missing in catalog 2.0.0"
        );

        let missing = gate.check_compatible("3.0.0", now()).unwrap();
        assert!(!missing.compatible);
        assert_eq!(missing.message, "Catalog 3.0.0 not found");
    }

    #[test]
    fn test_records_cached_until_invalidated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut gate = CompatibilityGate::new(Box::new(CountingSource {
            inner: StaticCatalogs::new([spec("1.0.0", None)]),
            calls: Arc::clone(&calls),
        }));

        gate.check_compatible("1.0.0", now()).unwrap();
        gate.check_compatible("1.0.0", now()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(gate.invalidate("1.0.0"));
        assert!(!gate.invalidate("1.0.0"));
        gate.check_compatible("1.0.0", now()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lookup_errors_not_cached() {
        let mut source = StaticCatalogs::new([spec("1.0.0", Some("builder"))]);
        source.set_unavailable(true);
        let mut gate = CompatibilityGate::new(Box::new(source));

        assert!(matches!(
            gate.check_compatible("1.0.0", now()),
            Err(CatalogError::Unavailable(_))
        ));
        assert!(gate.cached("1.0.0").is_none());
    }
}
