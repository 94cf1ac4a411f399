//! Release tag resolution from source-control refs.
//!
//! Rules, first match wins:
//! 1. the primary branch resolves to `latest`
//! 2. `<feature prefix><suffix>` resolves to `feature-<suffix>`
//! 3. anything else resolves to `unknown`
//!
//! Resolution is total. Unrecognised refs degrade to `unknown` and never error.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix stripped from fully-qualified branch refs before resolution.
pub const HEADS_PREFIX: &str = "refs/heads/";

/// A release tag derived from a ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTag {
    Latest,
    Feature(String),
    Unknown,
}

impl ReleaseTag {
    /// The tag string used to label artifacts.
    pub fn as_label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ReleaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseTag::Latest => f.write_str("latest"),
            ReleaseTag::Feature(suffix) => write!(f, "feature-{suffix}"),
            ReleaseTag::Unknown => f.write_str("unknown"),
        }
    }
}

/// Branch naming conventions used by [`RefTagResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Branch that produces `latest`.
    pub primary_branch: String,
    /// Namespace prefix of feature branches, including its separator.
    pub feature_prefix: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            primary_branch: "main".to_string(),
            feature_prefix: "feature/".to_string(),
        }
    }
}

/// Pure mapping from a ref name to a [`ReleaseTag`].
#[derive(Debug, Clone, Default)]
pub struct RefTagResolver {
    config: ResolverConfig,
}

impl RefTagResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `git_ref` to a release tag.
    ///
    /// For nested feature refs the suffix is everything after the first
    /// prefix match, so `feature/a/b` resolves to `feature-a/b`.
    pub fn resolve(&self, git_ref: &str) -> ReleaseTag {
        let branch = git_ref.strip_prefix(HEADS_PREFIX).unwrap_or(git_ref);

        if branch == self.config.primary_branch {
            return ReleaseTag::Latest;
        }

        if !self.config.feature_prefix.is_empty() {
            if let Some(suffix) = branch.strip_prefix(self.config.feature_prefix.as_str()) {
                if !suffix.is_empty() {
                    return ReleaseTag::Feature(suffix.to_string());
                }
            }
        }

        ReleaseTag::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> RefTagResolver {
        RefTagResolver::default()
    }

    #[test]
    fn test_primary_branch_is_latest() {
        assert_eq!(resolver().resolve("main"), ReleaseTag::Latest);
        assert_eq!(resolver().resolve("main").to_string(), "latest");
    }

    #[test]
    fn test_feature_branch_strips_namespace() {
        let tag = resolver().resolve("feature/login-page");
        assert_eq!(tag, ReleaseTag::Feature("login-page".to_string()));
        assert_eq!(tag.to_string(), "feature-login-page");
    }

    #[test]
    fn test_other_refs_are_unknown() {
        for r in ["bugfix/x", "develop", "features/x", "v1.2.3", "mainline"] {
            assert_eq!(resolver().resolve(r), ReleaseTag::Unknown, "ref {r}");
        }
    }

    #[test]
    fn test_empty_feature_suffix_is_unknown() {
        assert_eq!(resolver().resolve("feature/"), ReleaseTag::Unknown);
    }

    #[test]
    fn test_nested_feature_keeps_remainder() {
        assert_eq!(
            resolver().resolve("feature/team/search").to_string(),
            "feature-team/search"
        );
    }

    #[test]
    fn test_fully_qualified_refs_are_normalised() {
        assert_eq!(resolver().resolve("refs/heads/main"), ReleaseTag::Latest);
        assert_eq!(
            resolver().resolve("refs/heads/feature/api").to_string(),
            "feature-api"
        );
        assert_eq!(resolver().resolve("refs/tags/v1"), ReleaseTag::Unknown);
    }

    #[test]
    fn test_custom_primary_branch() {
        let r = RefTagResolver::new(ResolverConfig {
            primary_branch: "trunk".to_string(),
            feature_prefix: "feat-".to_string(),
        });
        assert_eq!(r.resolve("trunk"), ReleaseTag::Latest);
        assert_eq!(r.resolve("main"), ReleaseTag::Unknown);
        assert_eq!(r.resolve("feat-x").to_string(), "feature-x");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let r = resolver();
        for input in ["main", "feature/a", "", "???"] {
            assert_eq!(r.resolve(input), r.resolve(input));
        }
    }
}
