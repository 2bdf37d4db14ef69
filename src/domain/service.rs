//! Service descriptors and the per-run change model.
//!
//! A service is a deployable unit owned by a top-level path prefix in the
//! repository. Everything the pipeline needs to know about a service is
//! carried by its [`ServiceDescriptor`], so stages iterate descriptors
//! uniformly instead of branching on service names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Everything the pipeline derives for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service identifier (unique within the registry)
    pub id: String,

    /// Top-level path prefix in the source tree (no trailing slash)
    pub path_prefix: String,

    /// Helm chart used to deploy the service
    pub chart: PathBuf,

    /// Release name on the platform ("{release_prefix}-{id}")
    pub release_name: String,

    /// Image repository ("{registry}/{id}")
    pub image_repository: String,
}

impl ServiceDescriptor {
    /// Check whether a changed file path belongs to this service
    pub fn owns_path(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let prefix = self.path_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return false;
        }

        path.strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// Deployment target for this service in a namespace
    pub fn target(&self, namespace: &str) -> DeploymentTarget {
        DeploymentTarget {
            release_name: self.release_name.clone(),
            chart: self.chart.clone(),
            namespace: namespace.to_string(),
        }
    }
}

fn normalize_path(path: &str) -> &str {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path
}

/// Ordered, fixed set of services known to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Create a registry (order is preserved)
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self { services }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Services touched within a revision range.
///
/// Computed once per run and never mutated afterwards. Members keep the
/// registry's order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    services: Vec<ServiceDescriptor>,
}

impl ChangeSet {
    /// Compute the change set from a list of changed paths
    pub fn from_paths<S: AsRef<str>>(registry: &ServiceRegistry, paths: &[S]) -> Self {
        let services = registry
            .iter()
            .filter(|service| paths.iter().any(|p| service.owns_path(p.as_ref())))
            .cloned()
            .collect();

        Self { services }
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn ids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.iter().any(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Commit boundary used for change detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRange {
    /// Last successfully processed revision
    pub previous: String,

    /// Revision being processed
    pub current: String,
}

impl RevisionRange {
    pub fn new(previous: impl Into<String>, current: impl Into<String>) -> Self {
        Self {
            previous: previous.into(),
            current: current.into(),
        }
    }

    /// Resolve the range from the available markers.
    ///
    /// `previous` falls back through the explicit value, the platform marker,
    /// the last successful run, and finally the parent of `current`.
    pub fn resolve(
        explicit_previous: Option<String>,
        explicit_current: Option<String>,
        platform_marker: Option<String>,
        last_successful: Option<String>,
    ) -> Self {
        let current = explicit_current
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "HEAD".to_string());

        let non_empty = |r: &String| !r.trim().is_empty();
        let previous = explicit_previous
            .filter(non_empty)
            .or(platform_marker.filter(non_empty))
            .or(last_successful.filter(non_empty))
            .unwrap_or_else(|| format!("{}~1", current));

        Self { previous, current }
    }
}

/// Where a service gets deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub release_name: String,
    pub chart: PathBuf,
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            path_prefix: id.to_string(),
            chart: PathBuf::from(format!("charts/{}", id)),
            release_name: format!("devops-{}", id),
            image_repository: format!("ghcr.io/acme/{}", id),
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(vec![service("svc-a"), service("svc-b"), service("svc-c")])
    }

    #[test]
    fn test_owns_path_requires_directory_boundary() {
        let svc = service("user-service");

        assert!(svc.owns_path("user-service/app.py"));
        assert!(svc.owns_path("./user-service/tests/test_app.py"));
        assert!(!svc.owns_path("user-service"));
        assert!(!svc.owns_path("user-service-v2/app.py"));
        assert!(!svc.owns_path("docs/user-service/README.md"));
    }

    #[test]
    fn test_change_set_only_contains_touched_services() {
        let change_set = ChangeSet::from_paths(&registry(), &["svc-b/handler", "README.md"]);

        assert_eq!(change_set.ids(), vec!["svc-b".to_string()]);
        assert!(change_set.contains("svc-b"));
        assert!(!change_set.contains("svc-a"));
    }

    #[test]
    fn test_change_set_keeps_registry_order() {
        let change_set = ChangeSet::from_paths(&registry(), &["svc-c/x", "svc-a/y"]);
        assert_eq!(change_set.ids(), vec!["svc-a".to_string(), "svc-c".to_string()]);
    }

    #[test]
    fn test_change_set_ignores_unknown_prefixes() {
        let change_set = ChangeSet::from_paths(&registry(), &["svc-z/main.py", ".github/ci.yml"]);
        assert!(change_set.is_empty());
    }

    #[test]
    fn test_revision_range_fallbacks() {
        let range = RevisionRange::resolve(None, None, None, None);
        assert_eq!(range, RevisionRange::new("HEAD~1", "HEAD"));

        let range = RevisionRange::resolve(None, Some("abc".into()), None, Some("old".into()));
        assert_eq!(range, RevisionRange::new("old", "abc"));

        let range = RevisionRange::resolve(
            None,
            None,
            Some("marker".into()),
            Some("old".into()),
        );
        assert_eq!(range.previous, "marker");

        let range = RevisionRange::resolve(
            Some("explicit".into()),
            None,
            Some("marker".into()),
            None,
        );
        assert_eq!(range.previous, "explicit");
    }

    #[test]
    fn test_target_derivation() {
        let target = service("svc-a").target("staging");
        assert_eq!(target.release_name, "devops-svc-a");
        assert_eq!(target.namespace, "staging");
        assert_eq!(target.chart, PathBuf::from("charts/svc-a"));
    }
}
