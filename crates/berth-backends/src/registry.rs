//! Directory-backed artifact registry.
//!
//! Layout: `<root>/<repository>/<tag>.json`, one manifest per reference.
//! Manifests are written to a temp file and renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use berth_core::{Artifact, CredentialProvider, RegistryBackend};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{BackendError, Result};

/// Parsed `<repository>:<tag>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub repository: String,
    pub tag: String,
}

static REPOSITORY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("valid pattern")
});

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid pattern"));

impl Reference {
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| BackendError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        let (repository, tag) = reference
            .rsplit_once(':')
            .filter(|(_, tag)| !tag.contains('/'))
            .ok_or_else(|| invalid("missing tag"))?;
        if !REPOSITORY_PATTERN.is_match(repository) {
            return Err(invalid("repository must be lowercase path components"));
        }
        if !TAG_PATTERN.is_match(tag) {
            return Err(invalid("tag may only contain [A-Za-z0-9_.-], at most 128 chars"));
        }
        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    reference: String,
    artifact: Artifact,
    pushed_at: DateTime<Utc>,
    /// SHA-256 of the credential used for the push, never the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pushed_with: Option<String>,
}

pub struct FsRegistry {
    root: PathBuf,
    credentials: Option<(Arc<dyn CredentialProvider>, String)>,
}

impl FsRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            credentials: None,
        }
    }

    /// Require credential `name` from `provider` for every push and pull.
    pub fn with_credentials(
        mut self,
        provider: Arc<dyn CredentialProvider>,
        name: impl Into<String>,
    ) -> Self {
        self.credentials = Some((provider, name.into()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, reference: &Reference) -> PathBuf {
        self.root
            .join(&reference.repository)
            .join(format!("{}.json", reference.tag))
    }

    fn authenticate(&self) -> berth_core::Result<Option<String>> {
        let Some((provider, name)) = &self.credentials else {
            return Ok(None);
        };
        let token = provider.credential(name)?;
        Ok(Some(hex::encode(Sha256::digest(token.as_bytes()))))
    }

    async fn write_manifest(&self, path: PathBuf, manifest: Manifest) -> Result<()> {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path
                .parent()
                .ok_or_else(|| BackendError::NotFound(path.display().to_string()))?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = NamedTempFile::new_in(dir)?;
            tmp.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
            tmp.persist(&path).map_err(|e| BackendError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| BackendError::Io(std::io::Error::other(e.to_string())))?
    }
}

#[async_trait]
impl RegistryBackend for FsRegistry {
    async fn push(&self, artifact: &Artifact, reference: &str) -> berth_core::Result<()> {
        let pushed_with = self.authenticate()?;
        let parsed = Reference::parse(reference).map_err(BackendError::into_registry)?;
        let path = self.manifest_path(&parsed);
        let manifest = Manifest {
            reference: reference.to_string(),
            artifact: artifact.clone(),
            pushed_at: Utc::now(),
            pushed_with,
        };
        self.write_manifest(path, manifest)
            .await
            .map_err(BackendError::into_registry)?;
        debug!(reference = %reference, digest = %artifact.digest, "manifest written");
        Ok(())
    }

    async fn pull(&self, reference: &str) -> berth_core::Result<Artifact> {
        self.authenticate()?;
        let parsed = Reference::parse(reference).map_err(BackendError::into_registry)?;
        let path = self.manifest_path(&parsed);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(reference.to_string()).into_registry())
            }
            Err(e) => return Err(BackendError::Io(e).into_registry()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Json(e).into_registry())?;
        Ok(manifest.artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = Reference::parse("ghcr.io/acme/app:feature-login").unwrap();
        assert_eq!(r.repository, "ghcr.io/acme/app");
        assert_eq!(r.tag, "feature-login");
    }

    #[test]
    fn test_reference_patterns_compile() {
        assert!(REPOSITORY_PATTERN.is_match("ghcr.io/acme/app"));
        assert!(!REPOSITORY_PATTERN.is_match("Acme/App"));
        assert!(TAG_PATTERN.is_match("v1.2.3-rc.1"));
        assert!(!TAG_PATTERN.is_match(".hidden"));
        assert!(!TAG_PATTERN.is_match(&"a".repeat(129)));
    }

    #[test]
    fn test_reject_bad_references() {
        assert!(Reference::parse("acme/app").is_err());
        assert!(Reference::parse("Acme/App:latest").is_err());
        assert!(Reference::parse("acme/app:feature-a/b").is_err());
        assert!(Reference::parse("acme/app:").is_err());
    }
}
