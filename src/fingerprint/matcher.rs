//! Reuse lookup for build requests.
//!
//! An exact fingerprint match reuses a kit outright. Otherwise the kit whose
//! dependencies are the largest strict subset of the request's becomes the
//! incremental base, and only the missing dependencies are built on top.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;

use kiln_api::{BuildRequest, KitPhase, KitType, NameError, OrderStrategy};

use super::{fingerprint, FingerprintError};
use crate::graph::{Artifact, ArtifactGraph, ArtifactId};

/// Matcher errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("invalid build request: {0}")]
    InvalidRequest(#[from] NameError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

/// Result of a reuse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A kit with the same fingerprint exists; no build is needed.
    Exact(ArtifactId),
    /// Build only `delta` on top of `base`.
    Incremental {
        base: ArtifactId,
        delta: BTreeSet<String>,
    },
    /// Build everything from the platform base image.
    Root,
}

/// A kit eligible for reuse, with its graph insertion sequence.
#[derive(Debug, Clone, Copy)]
pub struct MatchCandidate<'a> {
    pub artifact: &'a Artifact,
    pub seq: u64,
}

impl MatchCandidate<'_> {
    /// Higher priority, then later creation, then later insertion, then the
    /// smaller id ranks first.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .artifact
            .priority
            .cmp(&self.artifact.priority)
            .then_with(|| other.artifact.created_at.cmp(&self.artifact.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.artifact.id.cmp(&other.artifact.id))
    }
}

/// Reuse policy for one platform.
#[derive(Debug, Clone)]
pub struct Matcher {
    operator_version: String,
    strategy: OrderStrategy,
}

impl Matcher {
    pub fn new(operator_version: impl Into<String>, strategy: OrderStrategy) -> Self {
        Self {
            operator_version: operator_version.into(),
            strategy,
        }
    }

    /// Kits in the request's namespace that could ever be reused for it.
    ///
    /// Error kits, kits from another operator or runtime version, and kits
    /// carrying a build property the request does not set identically are
    /// excluded.
    pub fn candidates<'g>(
        &self,
        request: &BuildRequest,
        graph: &'g ArtifactGraph,
    ) -> Vec<MatchCandidate<'g>> {
        graph
            .iter()
            .filter(|a| a.id.namespace == request.namespace)
            .filter(|a| a.kit_type == KitType::Platform)
            .filter(|a| a.phase != KitPhase::Error)
            .filter(|a| a.version == self.operator_version)
            .filter(|a| a.runtime_version == request.runtime_version)
            .filter(|a| {
                a.build_properties
                    .iter()
                    .all(|(k, v)| request.build_properties.get(k) == Some(v))
            })
            .filter_map(|artifact| {
                graph
                    .seq(&artifact.id)
                    .map(|seq| MatchCandidate { artifact, seq })
            })
            .collect()
    }

    /// Pick the kit to reuse among `candidates`.
    ///
    /// Deterministic: the same request against the same candidates always
    /// yields the same outcome.
    pub fn find_reusable(
        &self,
        request: &BuildRequest,
        request_fingerprint: &str,
        candidates: &[MatchCandidate<'_>],
    ) -> MatchOutcome {
        let exact = candidates
            .iter()
            .filter(|c| c.artifact.fingerprint == request_fingerprint)
            .filter(|c| matches!(c.artifact.phase, KitPhase::Ready | KitPhase::Building))
            .min_by(|a, b| {
                ready_first(a.artifact.phase)
                    .cmp(&ready_first(b.artifact.phase))
                    .then_with(|| a.rank(b))
            });
        if let Some(c) = exact {
            return MatchOutcome::Exact(c.artifact.id.clone());
        }

        if request.strategy.base_image.is_some() || !request.strategy.incremental {
            return MatchOutcome::Root;
        }

        let best = candidates
            .iter()
            .filter(|c| self.usable_as_base(c.artifact))
            .filter(|c| {
                let deps = &c.artifact.dependencies;
                !deps.is_empty()
                    && deps.len() < request.dependencies.len()
                    && deps.is_subset(&request.dependencies)
            })
            .min_by(|a, b| {
                b.artifact
                    .dependencies
                    .len()
                    .cmp(&a.artifact.dependencies.len())
                    .then_with(|| a.rank(b))
            });

        match best {
            Some(c) => MatchOutcome::Incremental {
                base: c.artifact.id.clone(),
                delta: request
                    .dependencies
                    .difference(&c.artifact.dependencies)
                    .cloned()
                    .collect(),
            },
            None => MatchOutcome::Root,
        }
    }

    /// Validate, fingerprint and match a request against the graph.
    pub fn resolve(
        &self,
        request: &BuildRequest,
        graph: &ArtifactGraph,
    ) -> Result<(String, MatchOutcome), MatchError> {
        request.validate()?;
        let fp = fingerprint(
            &request.dependencies,
            &request.build_properties,
            &request.runtime_version,
        )?;
        let candidates = self.candidates(request, graph);
        let outcome = self.find_reusable(request, &fp, &candidates);
        tracing::debug!(
            request = %format!("{}/{}", request.namespace, request.name),
            candidates = candidates.len(),
            outcome = ?outcome,
            "matched build request"
        );
        Ok((fp, outcome))
    }

    fn usable_as_base(&self, artifact: &Artifact) -> bool {
        match artifact.phase {
            KitPhase::Ready => artifact.image.is_some(),
            KitPhase::Building => self.strategy == OrderStrategy::Dependencies,
            KitPhase::Error => false,
        }
    }
}

fn ready_first(phase: KitPhase) -> u8 {
    match phase {
        KitPhase::Ready => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    const VERSION: &str = "0.1.0";

    fn kit(name: &str, deps: &[&str]) -> Artifact {
        let dependencies: BTreeSet<String> = deps.iter().map(|s| s.to_string()).collect();
        Artifact {
            id: ArtifactId::new("default", name),
            fingerprint: fingerprint(&dependencies, &BTreeMap::new(), "1.0").unwrap(),
            dependencies,
            build_properties: BTreeMap::new(),
            runtime_version: "1.0".to_string(),
            base: None,
            base_image: None,
            image: Some(format!("registry/kiln/{}", name)),
            digest: None,
            priority: 0,
            version: VERSION.to_string(),
            phase: KitPhase::Ready,
            kit_type: KitType::Platform,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn request(deps: &[&str]) -> BuildRequest {
        BuildRequest::new("default", "req", "1.0").dependencies(deps.iter().copied())
    }

    fn graph(kits: Vec<Artifact>) -> ArtifactGraph {
        ArtifactGraph::from_artifacts(kits).unwrap()
    }

    fn matcher() -> Matcher {
        Matcher::new(VERSION, OrderStrategy::Fifo)
    }

    #[test]
    fn test_exact_match() {
        let g = graph(vec![kit("a", &["x", "y"]), kit("b", &["x"])]);
        let (_, outcome) = matcher().resolve(&request(&["y", "x"]), &g).unwrap();
        assert_eq!(outcome, MatchOutcome::Exact(ArtifactId::new("default", "a")));
    }

    #[test]
    fn test_largest_subset_wins() {
        let g = graph(vec![
            kit("one", &["x"]),
            kit("two", &["x", "y"]),
            kit("other", &["z"]),
        ]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y", "w"]), &g).unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::Incremental {
                base: ArtifactId::new("default", "two"),
                delta: BTreeSet::from(["w".to_string()]),
            }
        );
    }

    #[test]
    fn test_tie_break_priority_then_recency() {
        let mut low = kit("low", &["x"]);
        low.created_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut high = kit("high", &["x"]);
        high.priority = 10;
        let g = graph(vec![low.clone(), high]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y"]), &g).unwrap();
        assert!(matches!(outcome, MatchOutcome::Incremental { base, .. } if base.name == "high"));

        let old = kit("old", &["x"]);
        let g = graph(vec![old, low]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y"]), &g).unwrap();
        assert!(matches!(outcome, MatchOutcome::Incremental { base, .. } if base.name == "low"));
    }

    #[test]
    fn test_tie_break_insertion_then_id() {
        let g = graph(vec![kit("b", &["x"]), kit("a", &["x"])]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y"]), &g).unwrap();
        // same priority and time: later insertion wins
        assert!(matches!(outcome, MatchOutcome::Incremental { base, .. } if base.name == "a"));
    }

    #[test]
    fn test_idempotent() {
        let g = graph(vec![kit("a", &["x"]), kit("b", &["x"]), kit("c", &["y"])]);
        let req = request(&["x", "y", "z"]);
        let first = matcher().resolve(&req, &g).unwrap();
        let second = matcher().resolve(&req, &g).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_subset_is_root() {
        let g = graph(vec![kit("a", &["x", "q"])]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y"]), &g).unwrap();
        assert_eq!(outcome, MatchOutcome::Root);
    }

    #[test]
    fn test_eligibility_filters() {
        let mut error = kit("error", &["x"]);
        error.phase = KitPhase::Error;
        let mut old_operator = kit("old-operator", &["x"]);
        old_operator.version = "0.0.1".to_string();
        let mut other_runtime = kit("other-runtime", &["x"]);
        other_runtime.runtime_version = "2.0".to_string();
        let mut with_prop = kit("with-prop", &["x"]);
        with_prop
            .build_properties
            .insert("native".to_string(), "true".to_string());
        let mut external = kit("external", &["x"]);
        external.kit_type = KitType::External;

        let g = graph(vec![error, old_operator, other_runtime, with_prop, external]);
        let (_, outcome) = matcher().resolve(&request(&["x", "y"]), &g).unwrap();
        assert_eq!(outcome, MatchOutcome::Root);

        let req = request(&["x", "y"]).property("native", "true");
        let (_, outcome) = matcher().resolve(&req, &g).unwrap();
        assert!(matches!(outcome, MatchOutcome::Incremental { base, .. } if base.name == "with-prop"));
    }

    #[test]
    fn test_pinned_base_or_disabled_incremental() {
        let g = graph(vec![kit("a", &["x"])]);
        let pinned = request(&["x", "y"]).base_image("registry/custom:1");
        assert_eq!(matcher().resolve(&pinned, &g).unwrap().1, MatchOutcome::Root);

        let disabled = request(&["x", "y"]).incremental(false);
        assert_eq!(matcher().resolve(&disabled, &g).unwrap().1, MatchOutcome::Root);

        let exact = request(&["x"]).incremental(false);
        assert!(matches!(matcher().resolve(&exact, &g).unwrap().1, MatchOutcome::Exact(_)));
    }

    #[test]
    fn test_building_base_only_under_dependencies() {
        let mut building = kit("building", &["x"]);
        building.phase = KitPhase::Building;
        building.image = None;
        let g = graph(vec![building]);
        let req = request(&["x", "y"]);

        assert_eq!(matcher().resolve(&req, &g).unwrap().1, MatchOutcome::Root);

        let deps = Matcher::new(VERSION, OrderStrategy::Dependencies);
        assert!(matches!(
            deps.resolve(&req, &g).unwrap().1,
            MatchOutcome::Incremental { base, .. } if base.name == "building"
        ));
    }

    #[test]
    fn test_exact_prefers_ready_over_building() {
        let mut building = kit("building", &["x"]);
        building.phase = KitPhase::Building;
        building.priority = 100;
        let g = graph(vec![building, kit("ready", &["x"])]);
        let (_, outcome) = matcher().resolve(&request(&["x"]), &g).unwrap();
        assert_eq!(outcome, MatchOutcome::Exact(ArtifactId::new("default", "ready")));
    }

    #[test]
    fn test_other_namespace_ignored() {
        let mut foreign = kit("a", &["x"]);
        foreign.id = ArtifactId::new("other", "a");
        let g = graph(vec![foreign]);
        assert_eq!(matcher().resolve(&request(&["x"]), &g).unwrap().1, MatchOutcome::Root);
    }

    #[test]
    fn test_invalid_request() {
        let g = ArtifactGraph::new();
        let req = BuildRequest::new("default", "Bad_Name", "1.0");
        assert!(matches!(matcher().resolve(&req, &g), Err(MatchError::InvalidRequest(_))));
    }
}
