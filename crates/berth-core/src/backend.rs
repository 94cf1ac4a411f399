//! Narrow interfaces to the external collaborators the controller drives.
//!
//! The controller never builds images, transfers layers or launches
//! containers itself. It calls these traits; production adapters live in
//! `berth-backends`, in-memory doubles in [`crate::fakes`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::service::{HealthCheck, InstanceHandle, ServiceSpec};

/// Everything a build backend needs to produce one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub stage: String,
    pub fingerprint: Fingerprint,
    pub inputs: BTreeMap<String, String>,
    pub command: Vec<String>,
    /// Artifacts of the stage's direct dependencies, keyed by stage name.
    pub dependencies: BTreeMap<String, Artifact>,
    /// Release tag label for this build, when one was resolved.
    pub tag: Option<String>,
}

/// Produces artifacts for build stages.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<Artifact>;
}

/// Stores and retrieves artifacts by `<repository>:<tag>` reference.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn push(&self, artifact: &Artifact, reference: &str) -> Result<()>;

    async fn pull(&self, reference: &str) -> Result<Artifact>;
}

/// Starts and stops service instances.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    async fn start_instance(&self, spec: &ServiceSpec) -> Result<InstanceHandle>;

    async fn stop_instance(&self, handle: &InstanceHandle) -> Result<()>;
}

/// Opaque secret lookup, consulted only by registry backends.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, name: &str) -> Result<String>;
}

/// Executes one health probe attempt. `Ok(())` means healthy.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, service: &str, check: &HealthCheck) -> Result<()>;
}
