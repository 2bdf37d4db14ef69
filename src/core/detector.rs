//! Change detection: which services does a revision range touch?

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::adapters::RevisionSource;
use crate::domain::{ChangeSet, RevisionRange, ServiceRegistry};

/// Detection failures.
///
/// These are never folded into an empty change set: a range that cannot be
/// diffed is not the same thing as a range with nothing in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("revision '{revision}' cannot be resolved: {reason}")]
    UnresolvableRevision { revision: String, reason: String },

    #[error("failed to list changed paths: {reason}")]
    Diff { reason: String },
}

/// Result of a successful detection
#[derive(Debug, Clone)]
pub struct Detection {
    /// Range with both ends resolved to commit ids
    pub range: RevisionRange,

    /// Services touched within the range
    pub change_set: ChangeSet,

    /// Number of changed paths inspected
    pub changed_paths: usize,
}

/// Computes the change set for a revision range
pub struct ChangeDetector {
    source: Arc<dyn RevisionSource>,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn RevisionSource>) -> Self {
        Self { source }
    }

    /// Resolve both ends of the range and map changed paths to services
    #[instrument(skip(self, registry), fields(previous = %range.previous, current = %range.current))]
    pub async fn detect(
        &self,
        registry: &ServiceRegistry,
        range: &RevisionRange,
    ) -> Result<Detection, DetectError> {
        let previous = self.resolve(&range.previous).await?;
        let current = self.resolve(&range.current).await?;

        let paths = self
            .source
            .changed_paths(&previous, &current)
            .await
            .map_err(|e| DetectError::Diff {
                reason: format!("{:#}", e),
            })?;

        debug!(paths = paths.len(), "Listed changed paths");

        let change_set = ChangeSet::from_paths(registry, &paths);

        info!(
            services = ?change_set.ids(),
            paths = paths.len(),
            "Change detection finished"
        );

        Ok(Detection {
            range: RevisionRange::new(previous, current),
            change_set,
            changed_paths: paths.len(),
        })
    }

    async fn resolve(&self, revision: &str) -> Result<String, DetectError> {
        self.source
            .resolve(revision)
            .await
            .map_err(|e| DetectError::UnresolvableRevision {
                revision: revision.to_string(),
                reason: format!("{:#}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::domain::ServiceDescriptor;

    struct StaticSource {
        known: HashMap<String, String>,
        paths: Vec<String>,
    }

    #[async_trait]
    impl RevisionSource for StaticSource {
        async fn resolve(&self, revision: &str) -> Result<String> {
            self.known
                .get(revision)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown revision"))
        }

        async fn changed_paths(&self, _previous: &str, _current: &str) -> Result<Vec<String>> {
            Ok(self.paths.clone())
        }
    }

    fn registry() -> ServiceRegistry {
        let service = |id: &str| ServiceDescriptor {
            id: id.to_string(),
            path_prefix: id.to_string(),
            chart: PathBuf::from(format!("charts/{}", id)),
            release_name: format!("devops-{}", id),
            image_repository: format!("ghcr.io/acme/{}", id),
        };
        ServiceRegistry::new(vec![service("svc-a"), service("svc-b"), service("svc-c")])
    }

    fn detector(paths: &[&str]) -> ChangeDetector {
        let known = [("main~1", "aaa"), ("main", "bbb")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ChangeDetector::new(Arc::new(StaticSource {
            known,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }))
    }

    #[tokio::test]
    async fn test_detect_maps_paths_to_services() {
        let detection = detector(&["svc-b/app.py", "README.md", "svc-b/tests/test_app.py"])
            .detect(&registry(), &RevisionRange::new("main~1", "main"))
            .await
            .unwrap();

        assert_eq!(detection.change_set.ids(), vec!["svc-b".to_string()]);
        assert_eq!(detection.range, RevisionRange::new("aaa", "bbb"));
        assert_eq!(detection.changed_paths, 3);
    }

    #[tokio::test]
    async fn test_unresolvable_previous_is_an_error() {
        let err = detector(&["svc-a/app.py"])
            .detect(&registry(), &RevisionRange::new("gone", "main"))
            .await
            .unwrap_err();

        assert!(matches!(err, DetectError::UnresolvableRevision { ref revision, .. } if revision == "gone"));
    }

    #[tokio::test]
    async fn test_nothing_changed_is_empty_not_error() {
        let detection = detector(&["docs/index.md"])
            .detect(&registry(), &RevisionRange::new("main~1", "main"))
            .await
            .unwrap();

        assert!(detection.change_set.is_empty());
    }
}
