//! Ref-to-registry release flow.
//!
//! Resolve the ref to a tag, build the stage graph, then push each terminal
//! artifact as `<repository>/<stage>:<tag>`. Pushes run concurrently and are
//! reported one by one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::artifact::Artifact;
use crate::backend::RegistryBackend;
use crate::build::{BuildGraphExecutor, BuildReport, BuildStage};
use crate::cancel::CancelSignal;
use crate::error::{BerthError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::tag::{RefTagResolver, ReleaseTag};

/// Registry reference for one stage's artifact.
pub fn image_reference(repository: &str, stage: &str, tag: &ReleaseTag) -> String {
    let repository = repository.trim_end_matches('/');
    if repository.is_empty() {
        format!("{stage}:{tag}")
    } else {
        format!("{repository}/{stage}:{tag}")
    }
}

/// Result of pushing one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub stage: String,
    pub reference: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub git_ref: String,
    pub tag: ReleaseTag,
    pub build: BuildReport,
    pub pushes: Vec<PushOutcome>,
}

impl ReleaseReport {
    /// Build succeeded and every push landed.
    pub fn success(&self) -> bool {
        self.build.success() && self.pushes.iter().all(PushOutcome::is_ok)
    }

    /// Build errors followed by one [`BerthError::Registry`] per failed push.
    pub fn errors(&self) -> Vec<BerthError> {
        let mut errors = self.build.errors();
        errors.extend(self.pushes.iter().filter_map(|p| {
            p.error
                .as_ref()
                .map(|e| BerthError::Registry(format!("{}: {e}", p.reference)))
        }));
        errors
    }
}

pub struct ReleasePipeline {
    resolver: RefTagResolver,
    executor: BuildGraphExecutor,
    registry: Arc<dyn RegistryBackend>,
    push_timeout: Option<Duration>,
}

impl ReleasePipeline {
    pub fn new(
        resolver: RefTagResolver,
        executor: BuildGraphExecutor,
        registry: Arc<dyn RegistryBackend>,
    ) -> Self {
        Self {
            resolver,
            executor,
            registry,
            push_timeout: None,
        }
    }

    pub fn with_push_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub async fn release(
        &self,
        git_ref: &str,
        stages: &[BuildStage],
        repository: &str,
    ) -> Result<ReleaseReport> {
        self.release_with_cancel(git_ref, stages, repository, CancelSignal::never())
            .await
    }

    /// Release `stages` built from `git_ref` into `repository`.
    ///
    /// Nothing is pushed unless the whole build succeeded.
    #[instrument(skip(self, stages, cancel), fields(stages = stages.len()))]
    pub async fn release_with_cancel(
        &self,
        git_ref: &str,
        stages: &[BuildStage],
        repository: &str,
        cancel: CancelSignal,
    ) -> Result<ReleaseReport> {
        let tag = self.resolver.resolve(git_ref);
        obs::emit_tag_resolved(git_ref, &tag.as_label());

        let build = self
            .executor
            .run_with_cancel(stages, Some(&tag), cancel.clone())
            .await?;

        let pushes = if build.success() {
            let pushes = build.artifacts().into_iter().map(|(stage, artifact)| {
                let reference = image_reference(repository, &stage, &tag);
                self.push_one(stage, artifact, reference, cancel.clone())
            });
            join_all(pushes).await
        } else {
            info!("build failed, skipping pushes");
            Vec::new()
        };

        Ok(ReleaseReport {
            git_ref: git_ref.to_string(),
            tag,
            build,
            pushes,
        })
    }

    async fn push_one(
        &self,
        stage: String,
        artifact: Artifact,
        reference: String,
        mut cancel: CancelSignal,
    ) -> PushOutcome {
        let push = self.registry.push(&artifact, &reference);
        let result = tokio::select! {
            result = async {
                match self.push_timeout {
                    Some(limit) => tokio::time::timeout(limit, push).await.unwrap_or_else(|_| {
                        Err(BerthError::Registry(format!(
                            "push timed out after {}",
                            humantime::format_duration(limit)
                        )))
                    }),
                    None => push.await,
                }
            } => result,
            _ = cancel.cancelled() => Err(BerthError::Cancelled),
        };

        let error = match result {
            Ok(()) => {
                METRICS.inc_artifacts_pushed();
                obs::emit_artifact_pushed(&reference, &artifact.digest);
                None
            }
            Err(e) => {
                obs::emit_push_failed(&reference, &e);
                Some(e.to_string())
            }
        };
        PushOutcome {
            stage,
            reference,
            digest: artifact.digest,
            error,
        }
    }
}
