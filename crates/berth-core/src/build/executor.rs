//! Cached, concurrent execution of a build stage graph.
//!
//! The executor is the single coordinator: stage tasks run on a `JoinSet`
//! and report back, and only the coordinator loop mutates the state table.
//! A stage is spawned once every dependency produced an artifact. A failed
//! stage blocks its transitive dependents while unrelated branches continue.
//! Nothing is retried.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::artifact::Artifact;
use crate::backend::{BuildBackend, BuildRequest};
use crate::build::stage::BuildStage;
use crate::cache::BuildCache;
use crate::cancel::CancelSignal;
use crate::error::{BerthError, Result};
use crate::fingerprint::Fingerprint;
use crate::graph::DependencyGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::tag::ReleaseTag;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum stages building at once.
    pub max_concurrent: usize,
    /// Upper bound for a single backend call.
    pub stage_timeout: Option<Duration>,
    /// When false, lookups are skipped and every stage is rebuilt.
    pub use_cache: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            stage_timeout: None,
            use_cache: true,
        }
    }
}

/// Final status of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// Reused from the cache without calling the backend.
    Cached { artifact: Artifact },
    /// Produced by the backend and recorded in the cache.
    Built { artifact: Artifact },
    Failed { cause: String },
    /// Not attempted because these upstream stages failed.
    Blocked { by: Vec<String> },
    Cancelled,
}

impl StageStatus {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            StageStatus::Cached { artifact } | StageStatus::Built { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.artifact().is_some()
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageStatus::Cached { .. } => "cached",
            StageStatus::Built { .. } => "built",
            StageStatus::Failed { .. } => "failed",
            StageStatus::Blocked { .. } => "blocked",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one stage within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Per-stage results of a build, in topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub tag: Option<String>,
    pub stages: Vec<StageOutcome>,
    /// Stages nothing else depends on.
    pub terminals: Vec<String>,
    pub duration_ms: u64,
}

impl BuildReport {
    /// True when every stage produced an artifact.
    pub fn success(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_success())
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Artifacts of the terminal stages that succeeded.
    pub fn artifacts(&self) -> BTreeMap<String, Artifact> {
        self.terminals
            .iter()
            .filter_map(|t| {
                self.outcome(t)
                    .and_then(|o| o.status.artifact())
                    .map(|a| (t.clone(), a.clone()))
            })
            .collect()
    }

    fn names_where(&self, pred: impl Fn(&StageStatus) -> bool) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| pred(&s.status))
            .map(|s| s.stage.as_str())
            .collect()
    }

    pub fn built(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, StageStatus::Built { .. }))
    }

    pub fn cached(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, StageStatus::Cached { .. }))
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, StageStatus::Blocked { .. }))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, StageStatus::Failed { .. } | StageStatus::Cancelled))
    }

    /// One [`BerthError::BuildFailed`] per failed stage.
    pub fn errors(&self) -> Vec<BerthError> {
        self.stages
            .iter()
            .filter_map(|s| match &s.status {
                StageStatus::Failed { cause } => Some(BerthError::BuildFailed {
                    stage: s.stage.clone(),
                    cause: cause.clone(),
                }),
                StageStatus::Cancelled => Some(BerthError::BuildFailed {
                    stage: s.stage.clone(),
                    cause: BerthError::Cancelled.to_string(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// A validated stage graph with precomputed fingerprints.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    graph: DependencyGraph,
    order: Vec<String>,
    stages: BTreeMap<String, BuildStage>,
    fingerprints: BTreeMap<String, Fingerprint>,
}

impl BuildPlan {
    /// Validate `stages` and fingerprint them in topological order.
    ///
    /// Fails before any work on duplicate or empty names, unknown
    /// dependencies and cycles.
    pub fn new(stages: &[BuildStage]) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for stage in stages {
            if stage.name.trim().is_empty() {
                return Err(BerthError::InvalidDescriptor(
                    "build stage with empty name".to_string(),
                ));
            }
            if by_name.insert(stage.name.clone(), stage.clone()).is_some() {
                return Err(BerthError::InvalidDescriptor(format!(
                    "duplicate build stage: {}",
                    stage.name
                )));
            }
        }

        let graph = DependencyGraph::from_declarations(
            stages
                .iter()
                .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str))),
        )?;
        let order = graph.topological_order()?;

        let mut fingerprints = BTreeMap::new();
        for name in &order {
            let fp = by_name[name].fingerprint(&fingerprints)?;
            fingerprints.insert(name.clone(), fp);
        }

        Ok(Self {
            graph,
            order,
            stages: by_name,
            fingerprints,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn fingerprint(&self, stage: &str) -> Option<&Fingerprint> {
        self.fingerprints.get(stage)
    }

    pub fn terminals(&self) -> Vec<String> {
        self.graph.terminals()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn request(
        &self,
        stage: &str,
        artifacts: &BTreeMap<String, Artifact>,
        tag: Option<String>,
    ) -> BuildRequest {
        let def = &self.stages[stage];
        let dependencies = self
            .graph
            .dependencies_of(stage)
            .into_iter()
            .filter_map(|dep| artifacts.get(dep).map(|a| (dep.to_string(), a.clone())))
            .collect();
        BuildRequest {
            stage: stage.to_string(),
            fingerprint: self.fingerprints[stage].clone(),
            inputs: def.inputs.clone(),
            command: def.command.clone(),
            dependencies,
            tag,
        }
    }
}

/// Memoizing topological executor over a [`BuildBackend`].
pub struct BuildGraphExecutor {
    cache: Arc<BuildCache>,
    backend: Arc<dyn BuildBackend>,
    config: ExecutorConfig,
}

impl BuildGraphExecutor {
    pub fn new(
        cache: Arc<BuildCache>,
        backend: Arc<dyn BuildBackend>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            cache,
            backend,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    /// Build `stages`, labelling backend requests with `tag`.
    pub async fn run(
        &self,
        stages: &[BuildStage],
        tag: Option<&ReleaseTag>,
    ) -> Result<BuildReport> {
        self.run_with_cancel(stages, tag, CancelSignal::never()).await
    }

    /// Like [`BuildGraphExecutor::run`], aborting in-flight stages when
    /// `cancel` fires.
    ///
    /// Structural problems are returned as `Err` before any build starts.
    /// Stage failures are reported in the [`BuildReport`].
    #[instrument(skip_all, fields(stages = stages.len()))]
    pub async fn run_with_cancel(
        &self,
        stages: &[BuildStage],
        tag: Option<&ReleaseTag>,
        cancel: CancelSignal,
    ) -> Result<BuildReport> {
        let plan = BuildPlan::new(stages)?;
        Ok(self.execute(&plan, tag.map(ReleaseTag::as_label), cancel).await)
    }

    /// Execute a validated plan.
    pub async fn execute(
        &self,
        plan: &BuildPlan,
        tag: Option<String>,
        cancel: CancelSignal,
    ) -> BuildReport {
        let start = Instant::now();
        obs::emit_build_started(plan.len(), tag.as_deref());

        let mut outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
        let mut artifacts: BTreeMap<String, Artifact> = BTreeMap::new();
        let mut waiting: BTreeMap<&str, usize> = plan
            .order
            .iter()
            .map(|s| (s.as_str(), plan.graph.dependencies_of(s).len()))
            .collect();
        let mut ready: VecDeque<String> = plan
            .order
            .iter()
            .filter(|s| waiting.get(s.as_str()) == Some(&0))
            .cloned()
            .collect();

        let mut tasks: JoinSet<(String, StageStatus, u64)> = JoinSet::new();
        let max_concurrent = self.config.max_concurrent.max(1);

        loop {
            while tasks.len() < max_concurrent {
                let Some(name) = ready.pop_front() else {
                    break;
                };
                if cancel.is_cancelled() {
                    outcomes.insert(
                        name.clone(),
                        StageOutcome {
                            fingerprint: plan.fingerprints[&name].clone(),
                            stage: name,
                            status: StageStatus::Cancelled,
                            duration_ms: 0,
                        },
                    );
                    continue;
                }

                let request = plan.request(&name, &artifacts, tag.clone());
                let cache = Arc::clone(&self.cache);
                let backend = Arc::clone(&self.backend);
                let config = self.config.clone();
                let signal = cancel.clone();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let stage = execute_stage(cache, backend, request, config, signal);
                    let status = AssertUnwindSafe(stage)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| StageStatus::Failed {
                            cause: "build task panicked".to_string(),
                        });
                    (name, status, started.elapsed().as_millis() as u64)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, status, duration_ms) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "build task did not complete");
                    continue;
                }
            };

            if let Some(artifact) = status.artifact() {
                artifacts.insert(name.clone(), artifact.clone());
                for dependent in plan.graph.dependents_of(&name) {
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(dependent.to_string());
                        }
                    }
                }
            }

            record_stage_metrics(&status);
            let fingerprint = plan.fingerprints[&name].clone();
            obs::emit_stage_finished(&name, status.label(), fingerprint.short(), duration_ms);
            outcomes.insert(
                name.clone(),
                StageOutcome {
                    stage: name,
                    fingerprint,
                    status,
                    duration_ms,
                },
            );
        }

        // Whatever never ran was either cancelled or sits below a failure.
        let mut blocked_by: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, outcome) in &outcomes {
            if matches!(outcome.status, StageStatus::Failed { .. } | StageStatus::Cancelled) {
                for dependent in plan.graph.transitive_dependents_of(name) {
                    blocked_by.entry(dependent).or_default().insert(name.clone());
                }
            }
        }

        let stages: Vec<StageOutcome> = plan
            .order
            .iter()
            .map(|name| {
                outcomes.remove(name).unwrap_or_else(|| {
                    let status = if cancel.is_cancelled() {
                        StageStatus::Cancelled
                    } else {
                        StageStatus::Blocked {
                            by: blocked_by
                                .remove(name)
                                .map(|s| s.into_iter().collect())
                                .unwrap_or_default(),
                        }
                    };
                    StageOutcome {
                        stage: name.clone(),
                        fingerprint: plan.fingerprints[name].clone(),
                        status,
                        duration_ms: 0,
                    }
                })
            })
            .collect();

        let report = BuildReport {
            tag,
            stages,
            terminals: plan.terminals(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            success = report.success(),
            built = report.built().len(),
            cached = report.cached().len(),
            failed = report.failed().len(),
            blocked = report.blocked().len(),
            "build finished"
        );
        obs::emit_build_finished(report.duration_ms, report.success());
        report
    }
}

fn record_stage_metrics(status: &StageStatus) {
    match status {
        StageStatus::Built { .. } => METRICS.inc_stages_built(),
        StageStatus::Cached { .. } => METRICS.inc_stages_cached(),
        StageStatus::Failed { .. } | StageStatus::Cancelled => METRICS.inc_stages_failed(),
        StageStatus::Blocked { .. } => {}
    }
}

async fn with_timeout<F>(limit: Option<Duration>, fut: F) -> std::result::Result<Artifact, String>
where
    F: Future<Output = Result<Artifact>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}",
                humantime::format_duration(limit)
            )),
        },
        None => fut.await.map_err(|e| e.to_string()),
    }
}

async fn execute_stage(
    cache: Arc<BuildCache>,
    backend: Arc<dyn BuildBackend>,
    request: BuildRequest,
    config: ExecutorConfig,
    mut cancel: CancelSignal,
) -> StageStatus {
    if config.use_cache {
        match cache.lookup(&request.fingerprint).await {
            Ok(Some(artifact)) => return StageStatus::Cached { artifact },
            Ok(None) => {}
            Err(e) => warn!(stage = %request.stage, error = %e, "cache lookup failed, building"),
        }
    }

    let result = tokio::select! {
        result = with_timeout(config.stage_timeout, backend.build(&request)) => result,
        _ = cancel.cancelled() => return StageStatus::Cancelled,
    };
    let artifact = match result {
        Ok(artifact) => artifact,
        Err(cause) => return StageStatus::Failed { cause },
    };

    match cache.store(&request.fingerprint, artifact.clone()).await {
        Ok(_) => StageStatus::Built { artifact },
        Err(BerthError::CacheConflict { existing, .. }) if !config.use_cache => {
            warn!(
                stage = %request.stage,
                existing = %existing,
                "rebuild produced a different artifact; cache keeps the original"
            );
            StageStatus::Built { artifact }
        }
        Err(e) => StageStatus::Failed {
            cause: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeBuildBackend;

    fn executor(backend: Arc<FakeBuildBackend>) -> BuildGraphExecutor {
        BuildGraphExecutor::new(
            Arc::new(BuildCache::in_memory()),
            backend,
            ExecutorConfig::default(),
        )
    }

    #[test]
    fn test_plan_rejects_duplicate_names() {
        let err = BuildPlan::new(&[BuildStage::new("a"), BuildStage::new("a")]).unwrap_err();
        assert!(matches!(err, BerthError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_plan_fingerprints_every_stage() {
        let plan = BuildPlan::new(&[
            BuildStage::new("base"),
            BuildStage::new("app").depends_on("base"),
        ])
        .unwrap();
        assert_eq!(plan.order(), ["base".to_string(), "app".to_string()]);
        assert!(plan.fingerprint("base").is_some());
        assert!(plan.fingerprint("app").is_some());
        assert_eq!(plan.terminals(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_single_stage_builds_then_caches() {
        let backend = Arc::new(FakeBuildBackend::new());
        let exec = executor(Arc::clone(&backend));
        let stages = [BuildStage::new("app").with_input("src", "v1")];

        let first = exec.run(&stages, None).await.unwrap();
        assert_eq!(first.built(), vec!["app"]);

        let second = exec.run(&stages, None).await.unwrap();
        assert_eq!(second.cached(), vec!["app"]);
        assert_eq!(backend.build_count(), 1);
        assert_eq!(first.artifacts(), second.artifacts());
    }

    #[tokio::test]
    async fn test_failed_stage_is_reported_with_cause() {
        let backend = Arc::new(FakeBuildBackend::new().fail_stage("app", "compiler exploded"));
        let report = executor(backend)
            .run(&[BuildStage::new("app")], None)
            .await
            .unwrap();
        assert!(!report.success());
        let errors = report.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("compiler exploded"));
    }

    #[tokio::test]
    async fn test_tag_is_passed_to_backend() {
        let backend = Arc::new(FakeBuildBackend::new());
        let tag = ReleaseTag::Feature("login".to_string());
        executor(Arc::clone(&backend))
            .run(&[BuildStage::new("app")], Some(&tag))
            .await
            .unwrap();
        let requests = backend.requests();
        assert_eq!(requests[0].tag.as_deref(), Some("feature-login"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_fails_stage() {
        let backend =
            Arc::new(FakeBuildBackend::new().delay_stage("slow", Duration::from_secs(60)));
        let exec = BuildGraphExecutor::new(
            Arc::new(BuildCache::in_memory()),
            backend,
            ExecutorConfig {
                stage_timeout: Some(Duration::from_secs(5)),
                ..ExecutorConfig::default()
            },
        );
        let report = exec.run(&[BuildStage::new("slow")], None).await.unwrap();
        match &report.stages[0].status {
            StageStatus::Failed { cause } => assert!(cause.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }
}
