//! berth core library
//!
//! Release tag resolution, fingerprint-cached build graphs, health-gated
//! service orchestration and the release pipeline tying them together.
//! External systems are reached only through the traits in [`backend`].

pub mod artifact;
pub mod backend;
pub mod build;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fakes;
pub mod fingerprint;
pub mod graph;
pub mod health;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod release;
pub mod service;
pub mod tag;
pub mod telemetry;

pub use artifact::Artifact;
pub use backend::{
    BuildBackend, BuildRequest, CredentialProvider, HealthProber, RegistryBackend, RuntimeBackend,
};
pub use build::{
    BuildGraphExecutor, BuildPlan, BuildReport, BuildStage, ExecutorConfig, StageOutcome,
    StageStatus,
};
pub use cache::fs::FsCacheStorage;
pub use cache::{BuildCache, CacheStats, CacheStorage, MemoryCacheStorage, StoreOutcome};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{BerthConfig, CONFIG_FILE_NAME};
pub use descriptor::{BuildGraphDescriptor, DeploymentDescriptor, Descriptor};
pub use error::{BerthError, Result};
pub use fingerprint::Fingerprint;
pub use graph::DependencyGraph;
pub use health::{GateOutcome, GateState, HealthGate};
pub use orchestrator::{
    DeploymentReport, OrchestratorConfig, ServiceOrchestrator, ServiceReport, ServiceTransition,
    StartOptions, StopReport,
};
pub use release::{image_reference, PushOutcome, ReleasePipeline, ReleaseReport};
pub use service::{HealthCheck, HealthProbe, InstanceHandle, ServiceSpec, ServiceState};
pub use tag::{RefTagResolver, ReleaseTag, ResolverConfig};
pub use telemetry::init_tracing;

/// Crate version, reported by `berth --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
