//! `berth.toml` configuration.
//!
//! Every field has a default, so an empty or missing file is valid. The
//! binary layers command-line flags on top of the loaded values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::ExecutorConfig;
use crate::descriptor::duration_serde;
use crate::error::{BerthError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::tag::ResolverConfig;

/// File looked up in the working directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "berth.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BerthConfig {
    pub resolver: ResolverConfig,
    pub build: BuildSection,
    pub deploy: DeploySection,
    pub registry: RegistrySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    pub max_concurrent: usize,
    #[serde(
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stage_timeout: Option<Duration>,
    pub cache_dir: PathBuf,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            stage_timeout: None,
            cache_dir: PathBuf::from(".berth/cache"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploySection {
    #[serde(
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_timeout: Option<Duration>,
    /// Argv used for services that declare no command. `${IMAGE}` and
    /// `${SERVICE}` are substituted. Empty disables the fallback.
    pub image_command: Vec<String>,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            start_timeout: None,
            image_command: ["docker", "run", "--rm", "${IMAGE}"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    /// Directory of the local registry.
    pub root: PathBuf,
    /// Repository prefix for pushed references.
    pub repository: String,
    /// Name of the credential the registry asks the provider for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub push_timeout: Option<Duration>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".berth/registry"),
            repository: "berth".to_string(),
            credential: None,
            push_timeout: None,
        }
    }
}

impl BerthConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BerthError::Config(e.to_string()))
    }

    /// Load `path`, which must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BerthError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Load `path` when given, else `dir/berth.toml` when present, else
    /// defaults.
    pub fn discover(path: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn executor_config(&self, use_cache: bool) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.build.max_concurrent.max(1),
            stage_timeout: self.build.stage_timeout,
            use_cache,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            start_timeout: self.deploy.start_timeout,
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BerthError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = BerthConfig::from_toml_str("").unwrap();
        assert_eq!(config, BerthConfig::default());
        assert_eq!(
            config.deploy.image_command,
            vec!["docker", "run", "--rm", "${IMAGE}"]
        );
    }

    #[test]
    fn test_sections_parse() {
        let config = BerthConfig::from_toml_str(
            r#"
[resolver]
primary_branch = "trunk"

[build]
max_concurrent = 8
stage_timeout = "10m"

[deploy]
start_timeout = "30s"
image_command = ["podman", "run", "--rm", "${IMAGE}"]

[registry]
repository = "ghcr.io/acme"
credential = "ghcr"
"#,
        )
        .unwrap();
        assert_eq!(config.resolver.primary_branch, "trunk");
        assert_eq!(config.resolver.feature_prefix, "feature/");
        assert_eq!(config.build.max_concurrent, 8);
        assert_eq!(config.build.stage_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.deploy.start_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.deploy.image_command[0], "podman");
        assert_eq!(config.registry.credential.as_deref(), Some("ghcr"));
        assert_eq!(config.registry.root, PathBuf::from(".berth/registry"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = BerthConfig::from_toml_str("[build]\nthreads = 2\n").unwrap_err();
        assert!(matches!(err, BerthError::Config(_)));
        assert!(!err.is_structural());
    }

    #[test]
    fn test_discover_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            BerthConfig::discover(None, dir.path()).unwrap(),
            BerthConfig::default()
        );
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[build]\nmax_concurrent = 2\n").unwrap();
        assert_eq!(
            BerthConfig::discover(None, dir.path()).unwrap().build.max_concurrent,
            2
        );
    }

    #[test]
    fn test_toml_roundtrip_keeps_durations() {
        let mut config = BerthConfig::default();
        config.build.stage_timeout = Some(Duration::from_secs(90));
        let text = config.to_toml_string().unwrap();
        assert_eq!(BerthConfig::from_toml_str(&text).unwrap(), config);
    }
}
