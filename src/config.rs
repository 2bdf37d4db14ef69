//! Environment configuration for deltaship.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DELTASHIP_HOME, DELTASHIP_REGISTRY, ...)
//! 2. Config file (.deltaship/config.yaml)
//! 3. Defaults (~/.deltaship, namespace `default`, release prefix `deltaship`)
//!
//! Config file discovery:
//! - Searches the current directory and parents for .deltaship/config.yaml
//! - `home` is relative to the .deltaship/ directory, `kubeconfig` to the
//!   project root (the directory containing .deltaship/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const ENV_HOME: &str = "DELTASHIP_HOME";
pub const ENV_REGISTRY: &str = "DELTASHIP_REGISTRY";
pub const ENV_CREDENTIALS_REF: &str = "DELTASHIP_CREDENTIALS_REF";
pub const ENV_NAMESPACE: &str = "DELTASHIP_NAMESPACE";
pub const ENV_RELEASE_PREFIX: &str = "DELTASHIP_RELEASE_PREFIX";
pub const ENV_BUILD_ID: &str = "DELTASHIP_BUILD_ID";
pub const ENV_KUBECONFIG: &str = "DELTASHIP_KUBECONFIG";
/// Revision marker supplied by the CI platform
pub const ENV_PREVIOUS_REVISION: &str = "DELTASHIP_PREVIOUS_REVISION";

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_RELEASE_PREFIX: &str = "deltaship";
const DEFAULT_CREDENTIALS_REF: &str = "REGISTRY";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    /// Engine state directory (relative to .deltaship/)
    #[serde(default)]
    pub home: Option<String>,
    /// Image registry, e.g. `ghcr.io/acme`
    #[serde(default)]
    pub registry: Option<String>,
    /// Name of the credentials to acquire for the registry
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub release_prefix: Option<String>,
    /// Fixed build id (defaults to the current revision)
    #[serde(default)]
    pub build_id: Option<String>,
    /// Kubeconfig for helm/kubectl (relative to the project root)
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to deltaship home (run logs)
    pub home: PathBuf,
    pub registry: Option<String>,
    pub credentials_ref: String,
    pub namespace: String,
    pub release_prefix: String,
    pub build_id: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    /// Previous revision handed over by the CI platform
    pub previous_revision: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// The image registry; required for any run that builds something
    pub fn registry(&self) -> Result<&str> {
        self.registry.as_deref().with_context(|| {
            format!(
                "No image registry configured (set 'registry' in .deltaship/config.yaml or {})",
                ENV_REGISTRY
            )
        })
    }

    /// Directory holding one subdirectory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".deltaship").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration starting discovery at `start_dir`, reading overrides via `lookup`
pub fn load_config_from<F>(start_dir: &Path, lookup: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    // Empty variables count as unset
    let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let config_file = find_config_file(start_dir);
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .deltaship/ and the project root around it
    let state_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(start_dir);
    let project_root = state_dir.parent().unwrap_or(state_dir);

    let home = if let Some(env_home) = env(ENV_HOME) {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.home {
        resolve_path(state_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".deltaship")
    };

    let kubeconfig = env(ENV_KUBECONFIG)
        .map(PathBuf::from)
        .or_else(|| file.kubeconfig.as_deref().map(|p| resolve_path(project_root, p)));

    Ok(ResolvedConfig {
        home,
        registry: env(ENV_REGISTRY).or(file.registry),
        credentials_ref: env(ENV_CREDENTIALS_REF)
            .or(file.credentials_ref)
            .unwrap_or_else(|| DEFAULT_CREDENTIALS_REF.to_string()),
        namespace: env(ENV_NAMESPACE)
            .or(file.namespace)
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        release_prefix: env(ENV_RELEASE_PREFIX)
            .or(file.release_prefix)
            .unwrap_or_else(|| DEFAULT_RELEASE_PREFIX.to_string()),
        build_id: env(ENV_BUILD_ID).or(file.build_id),
        kubeconfig,
        previous_revision: env(ENV_PREVIOUS_REVISION),
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, yaml: &str) -> PathBuf {
        let state_dir = root.join(".deltaship");
        std::fs::create_dir_all(&state_dir).unwrap();
        let config_path = state_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_default_config_without_file() {
        let temp = TempDir::new().unwrap();
        let config = load_config_from(temp.path(), no_env).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".deltaship");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.runs_dir(), expected_home.join("runs"));
        assert_eq!(config.namespace, "default");
        assert_eq!(config.release_prefix, "deltaship");
        assert_eq!(config.credentials_ref, "REGISTRY");
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
home: ./state
registry: ghcr.io/acme
namespace: staging
release_prefix: devops
kubeconfig: kube/config
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.registry.as_deref(), Some("ghcr.io/acme"));
        assert!(file.build_id.is_none());
    }

    #[test]
    fn test_discovery_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            "version: \"1.0\"\nregistry: ghcr.io/acme\nkubeconfig: kube/config\n",
        );
        let nested = temp.path().join("user-service").join("src");
        std::fs::create_dir_all(&nested).unwrap();

        let config = load_config_from(&nested, no_env).unwrap();
        assert_eq!(config.registry().unwrap(), "ghcr.io/acme");
        assert_eq!(config.kubeconfig, Some(temp.path().join("kube/config")));
        assert!(config.config_file.is_some());
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            "version: \"1.0\"\nregistry: ghcr.io/acme\nnamespace: staging\n",
        );

        let env: HashMap<&str, &str> = [
            (ENV_REGISTRY, "registry.example.com/team"),
            (ENV_HOME, "/var/lib/deltaship"),
            (ENV_NAMESPACE, ""),
            (ENV_PREVIOUS_REVISION, "abc123"),
        ]
        .into_iter()
        .collect();

        let config =
            load_config_from(temp.path(), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.registry().unwrap(), "registry.example.com/team");
        assert_eq!(config.home, PathBuf::from("/var/lib/deltaship"));
        // Empty override falls through to the file value
        assert_eq!(config.namespace, "staging");
        assert_eq!(config.previous_revision.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
