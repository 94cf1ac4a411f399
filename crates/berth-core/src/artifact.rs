//! Immutable references to build output.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Reference to the output of one build stage, e.g. an image digest.
///
/// Two artifacts are equal only when both the producing stage and the digest
/// match; the cache relies on this to detect conflicting writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    /// Stage that produced the artifact.
    pub stage: String,
    /// Content digest in `<algorithm>:<hex>` form.
    pub digest: String,
}

impl Artifact {
    pub fn new(stage: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            digest: digest.into(),
        }
    }

    /// Artifact whose digest is the SHA-256 of `content`.
    pub fn from_content(stage: impl Into<String>, content: &[u8]) -> Self {
        Self::new(stage, format!("sha256:{}", Fingerprint::from_bytes(content)))
    }

    /// Digest without the algorithm prefix, truncated for display.
    pub fn short_digest(&self) -> &str {
        let hex = self
            .digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(&self.digest);
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.stage, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_content_is_deterministic() {
        let a = Artifact::from_content("app", b"layer bytes");
        let b = Artifact::from_content("app", b"layer bytes");
        assert_eq!(a, b);
        assert!(a.digest.starts_with("sha256:"));
        assert_eq!(a.short_digest().len(), 12);
    }

    #[test]
    fn test_stage_is_part_of_identity() {
        let a = Artifact::new("deps", "sha256:abc");
        let b = Artifact::new("app", "sha256:abc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_digest_without_prefix() {
        assert_eq!(Artifact::new("x", "deadbeef").short_digest(), "deadbeef");
    }
}
