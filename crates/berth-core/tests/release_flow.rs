//! End-to-end release: ref to tag, cached build, registry push.

use std::sync::Arc;
use std::time::Duration;

use berth_core::fakes::{FakeBuildBackend, MemoryRegistry};
use berth_core::{
    cancel_pair, BerthError, BuildCache, BuildGraphExecutor, BuildStage, ExecutorConfig,
    RefTagResolver, ReleasePipeline, ReleaseTag, ResolverConfig,
};

fn stages() -> Vec<BuildStage> {
    vec![
        BuildStage::new("deps").with_input("requirements", "flask==3.0"),
        BuildStage::new("app").depends_on("deps").with_input("src", "v1"),
        BuildStage::new("worker").depends_on("deps").with_input("src", "v1"),
    ]
}

fn pipeline(backend: Arc<FakeBuildBackend>, registry: Arc<MemoryRegistry>) -> ReleasePipeline {
    let executor = BuildGraphExecutor::new(
        Arc::new(BuildCache::in_memory()),
        backend,
        ExecutorConfig::default(),
    );
    ReleasePipeline::new(RefTagResolver::default(), executor, registry)
}

#[test]
fn resolver_properties() {
    let resolver = RefTagResolver::default();
    assert_eq!(resolver.resolve("main"), ReleaseTag::Latest);
    assert_eq!(resolver.resolve("refs/heads/main"), ReleaseTag::Latest);
    assert_eq!(
        resolver.resolve("feature/login-page").to_string(),
        "feature-login-page"
    );
    assert_eq!(resolver.resolve("bugfix/x"), ReleaseTag::Unknown);
    assert_eq!(resolver.resolve("feature/"), ReleaseTag::Unknown);

    let trunk = RefTagResolver::new(ResolverConfig {
        primary_branch: "trunk".to_string(),
        feature_prefix: "feat/".to_string(),
    });
    assert_eq!(trunk.resolve("main"), ReleaseTag::Unknown);
    assert_eq!(trunk.resolve("feat/x").to_string(), "feature-x");
}

#[tokio::test]
async fn release_pushes_terminal_artifacts_under_tag() {
    let backend = Arc::new(FakeBuildBackend::new());
    let registry = Arc::new(MemoryRegistry::new());
    let report = pipeline(backend.clone(), registry.clone())
        .release("refs/heads/feature/login-page", &stages(), "ghcr.io/acme")
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.tag, ReleaseTag::Feature("login-page".to_string()));
    assert_eq!(
        registry.references(),
        vec![
            "ghcr.io/acme/app:feature-login-page",
            "ghcr.io/acme/worker:feature-login-page"
        ]
    );
    // Intermediate stages are built but not pushed.
    assert_eq!(backend.builds_of("deps"), 1);
    assert!(backend
        .requests()
        .iter()
        .all(|r| r.tag.as_deref() == Some("feature-login-page")));
}

#[tokio::test]
async fn push_failures_are_reported_per_artifact() {
    let registry = Arc::new(
        MemoryRegistry::new().fail_reference("ghcr.io/acme/worker:latest", "quota exceeded"),
    );
    let report = pipeline(Arc::new(FakeBuildBackend::new()), registry.clone())
        .release("main", &stages(), "ghcr.io/acme")
        .await
        .unwrap();

    assert!(report.build.success());
    assert!(!report.success());
    let failed: Vec<_> = report.pushes.iter().filter(|p| !p.is_ok()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage, "worker");
    assert!(failed[0].error.as_deref().unwrap().contains("quota exceeded"));
    assert_eq!(registry.references(), vec!["ghcr.io/acme/app:latest"]);
    assert_eq!(report.errors().len(), 1);
}

#[tokio::test]
async fn failed_build_pushes_nothing() {
    let backend = Arc::new(FakeBuildBackend::new().fail_stage("worker", "tests failed"));
    let registry = Arc::new(MemoryRegistry::new());
    let report = pipeline(backend, registry.clone())
        .release("main", &stages(), "ghcr.io/acme")
        .await
        .unwrap();

    assert!(!report.success());
    assert!(report.pushes.is_empty());
    assert!(registry.references().is_empty());
}

#[tokio::test]
async fn second_release_of_new_tag_reuses_cache() {
    let backend = Arc::new(FakeBuildBackend::new());
    let registry = Arc::new(MemoryRegistry::new());
    let pipeline = pipeline(backend.clone(), registry.clone());

    pipeline.release("feature/x", &stages(), "acme").await.unwrap();
    let report = pipeline.release("main", &stages(), "acme").await.unwrap();

    assert_eq!(report.build.cached().len(), 3);
    assert_eq!(backend.build_count(), 3);
    assert!(registry.references().contains(&"acme/app:latest".to_string()));
}

#[tokio::test(start_paused = true)]
async fn slow_push_times_out_per_artifact() {
    let registry = Arc::new(
        MemoryRegistry::new()
            .delay_reference("ghcr.io/acme/worker:latest", Duration::from_secs(60)),
    );
    let report = pipeline(Arc::new(FakeBuildBackend::new()), registry.clone())
        .with_push_timeout(Some(Duration::from_secs(5)))
        .release("main", &stages(), "ghcr.io/acme")
        .await
        .unwrap();

    assert!(report.build.success());
    assert!(!report.success());
    let failed: Vec<_> = report.pushes.iter().filter(|p| !p.is_ok()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage, "worker");
    assert!(failed[0].error.as_deref().unwrap().contains("push timed out"));
    assert_eq!(registry.references(), vec!["ghcr.io/acme/app:latest"]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_push_marks_it_cancelled() {
    let registry = Arc::new(
        MemoryRegistry::new()
            .delay_reference("ghcr.io/acme/app:latest", Duration::from_secs(60)),
    );
    let (handle, signal) = cancel_pair();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
    });

    let report = pipeline(Arc::new(FakeBuildBackend::new()), registry.clone())
        .release_with_cancel("main", &stages(), "ghcr.io/acme", signal)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert!(report.build.success());
    assert!(!report.success());
    let app = report.pushes.iter().find(|p| p.stage == "app").unwrap();
    assert_eq!(
        app.error.as_deref(),
        Some(BerthError::Cancelled.to_string().as_str())
    );
    let worker = report.pushes.iter().find(|p| p.stage == "worker").unwrap();
    assert!(worker.is_ok());
    assert_eq!(registry.references(), vec!["ghcr.io/acme/worker:latest"]);
}
