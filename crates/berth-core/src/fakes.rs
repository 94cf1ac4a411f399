//! In-memory backends for tests and dry runs.
//!
//! Each fake records what it was asked to do and can be told to fail or
//! stall for specific stages, services or references.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::artifact::Artifact;
use crate::backend::{BuildBackend, BuildRequest, HealthProber, RegistryBackend, RuntimeBackend};
use crate::error::{BerthError, Result};
use crate::service::{HealthCheck, InstanceHandle, ServiceSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build backend whose artifact digest is derived from the fingerprint, so
/// identical requests always yield identical artifacts.
#[derive(Default)]
pub struct FakeBuildBackend {
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<BuildRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeBuildBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_stage(mut self, stage: impl Into<String>, cause: impl Into<String>) -> Self {
        self.failures.insert(stage.into(), cause.into());
        self
    }

    pub fn delay_stage(mut self, stage: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(stage.into(), delay);
        self
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<BuildRequest> {
        lock(&self.requests).clone()
    }

    pub fn build_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn builds_of(&self, stage: &str) -> usize {
        lock(&self.requests).iter().filter(|r| r.stage == stage).count()
    }

    /// Stage names in the order their builds started.
    pub fn build_order(&self) -> Vec<String> {
        lock(&self.requests).iter().map(|r| r.stage.clone()).collect()
    }

    /// Highest number of builds observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildBackend for FakeBuildBackend {
    async fn build(&self, request: &BuildRequest) -> Result<Artifact> {
        lock(&self.requests).push(request.clone());
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        if let Some(delay) = self.delays.get(&request.stage) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(cause) = self.failures.get(&request.stage) {
            return Err(BerthError::BuildFailed {
                stage: request.stage.clone(),
                cause: cause.clone(),
            });
        }
        Ok(Artifact::from_content(
            request.stage.as_str(),
            request.fingerprint.as_str().as_bytes(),
        ))
    }
}

/// Registry holding pushed artifacts in a map.
#[derive(Default)]
pub struct MemoryRegistry {
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    images: Mutex<BTreeMap<String, Artifact>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject pushes to `reference`.
    pub fn fail_reference(
        mut self,
        reference: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        self.failures.insert(reference.into(), cause.into());
        self
    }

    /// Stall pushes to `reference` for `delay` before storing.
    pub fn delay_reference(mut self, reference: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(reference.into(), delay);
        self
    }

    /// Pushed references, sorted.
    pub fn references(&self) -> Vec<String> {
        lock(&self.images).keys().cloned().collect()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistry {
    async fn push(&self, artifact: &Artifact, reference: &str) -> Result<()> {
        if let Some(delay) = self.delays.get(reference) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(cause) = self.failures.get(reference) {
            return Err(BerthError::Registry(cause.clone()));
        }
        lock(&self.images).insert(reference.to_string(), artifact.clone());
        Ok(())
    }

    async fn pull(&self, reference: &str) -> Result<Artifact> {
        lock(&self.images)
            .get(reference)
            .cloned()
            .ok_or_else(|| BerthError::Registry(format!("{reference} not found")))
    }
}

/// Runtime that records `start:<name>` and `stop:<name>` events.
#[derive(Default)]
pub struct FakeRuntime {
    start_failures: HashMap<String, String>,
    start_delays: HashMap<String, Duration>,
    events: Mutex<Vec<String>>,
    running: Mutex<BTreeMap<String, String>>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(mut self, service: impl Into<String>, cause: impl Into<String>) -> Self {
        self.start_failures.insert(service.into(), cause.into());
        self
    }

    pub fn delay_start(mut self, service: impl Into<String>, delay: Duration) -> Self {
        self.start_delays.insert(service.into(), delay);
        self
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn start_count(&self, service: &str) -> usize {
        let needle = format!("start:{service}");
        lock(&self.events).iter().filter(|e| **e == needle).count()
    }

    /// Names of services with a live instance, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.running).values().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RuntimeBackend for FakeRuntime {
    async fn start_instance(&self, spec: &ServiceSpec) -> Result<InstanceHandle> {
        if let Some(delay) = self.start_delays.get(&spec.name) {
            tokio::time::sleep(*delay).await;
        }
        lock(&self.events).push(format!("start:{}", spec.name));
        if let Some(cause) = self.start_failures.get(&spec.name) {
            return Err(BerthError::Runtime(cause.clone()));
        }
        let id = format!("{}-{}", spec.name, self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.running).insert(id.clone(), spec.name.clone());
        Ok(InstanceHandle::new(spec.name.as_str(), id))
    }

    async fn stop_instance(&self, handle: &InstanceHandle) -> Result<()> {
        lock(&self.events).push(format!("stop:{}", handle.service));
        lock(&self.running).remove(&handle.id);
        Ok(())
    }
}

/// Prober that replays a per-service script of results.
///
/// Once a script runs out the service's fallback applies: healthy, unless
/// [`ScriptedProber::always_fail`] was set.
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, VecDeque<std::result::Result<(), String>>>>,
    fallback_failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        service: impl Into<String>,
        results: Vec<std::result::Result<(), String>>,
    ) -> Self {
        lock(&self.scripts).insert(service.into(), results.into());
        self
    }

    pub fn always_fail(mut self, service: impl Into<String>, cause: impl Into<String>) -> Self {
        self.fallback_failures.insert(service.into(), cause.into());
        self
    }

    /// Make every probe of `service` take `delay`.
    pub fn delay(mut self, service: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(service.into(), delay);
        self
    }

    pub fn attempts(&self, service: &str) -> usize {
        lock(&self.attempts).get(service).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthProber for ScriptedProber {
    async fn probe(&self, service: &str, check: &HealthCheck) -> Result<()> {
        *lock(&self.attempts).entry(service.to_string()).or_insert(0) += 1;
        if let Some(delay) = self.delays.get(service) {
            tokio::time::sleep(*delay).await;
        }

        let scripted = lock(&self.scripts)
            .get_mut(service)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(result) => result,
            None => match self.fallback_failures.get(service) {
                Some(cause) => Err(cause.clone()),
                None => Ok(()),
            },
        };
        result.map_err(|cause| BerthError::HealthCheckFailed {
            service: service.to_string(),
            cause: format!("{check}: {cause}"),
        })
    }
}
