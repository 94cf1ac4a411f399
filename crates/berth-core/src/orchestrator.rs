//! Dependency-ordered, health-gated service orchestration.
//!
//! [`ServiceOrchestrator::start`] validates the service graph, then starts each
//! service as soon as every declared dependency is `Ready`. Services without a
//! health check are `Ready` once the runtime accepts them; the rest pass
//! through a [`HealthGate`]. A failed service leaves its transitive dependents
//! `Pending` and reports them as blocked. Unrelated services keep going.
//!
//! All instance state lives in one table behind a `tokio::sync::Mutex`. Every
//! state change goes through it and is published on a broadcast channel.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::backend::RuntimeBackend;
use crate::cancel::CancelSignal;
use crate::error::{BerthError, Result};
use crate::graph::DependencyGraph;
use crate::health::{GateState, HealthGate};
use crate::metrics::METRICS;
use crate::obs;
use crate::service::{InstanceHandle, ServiceSpec, ServiceState};

const EVENT_CAPACITY: usize = 256;

/// Orchestrator tuning.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Upper bound for one `start_instance` call.
    pub start_timeout: Option<Duration>,
}

/// Per-call options for [`ServiceOrchestrator::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Replace instances even when their spec is unchanged.
    pub force_recreate: bool,
}

/// One state change of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTransition {
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    pub at: DateTime<Utc>,
}

/// Final view of one service after a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Failed upstream services keeping this one `Pending`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// True when an unchanged running instance was kept.
    pub reused: bool,
    pub probe_attempts: u32,
}

/// Per-service results of a deployment, in start order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub services: Vec<ServiceReport>,
    pub duration_ms: u64,
}

impl DeploymentReport {
    /// True when every service ended `Ready`.
    pub fn ready(&self) -> bool {
        self.services.iter().all(|s| s.state == ServiceState::Ready)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.service(name).map(|s| s.state)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.state == ServiceState::Failed)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| !s.blocked_by.is_empty())
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Result of [`ServiceOrchestrator::stop_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Services stopped, in stop order.
    pub stopped: Vec<String>,
    /// Services left running, with the reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl StopReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Instance {
    spec: ServiceSpec,
    state: ServiceState,
    handle: Option<InstanceHandle>,
    cause: Option<String>,
    blocked_by: Vec<String>,
    reused: bool,
    probe_attempts: u32,
}

impl Instance {
    fn pending(spec: ServiceSpec) -> Self {
        Self {
            spec,
            state: ServiceState::Pending,
            handle: None,
            cause: None,
            blocked_by: Vec::new(),
            reused: false,
            probe_attempts: 0,
        }
    }

    fn report(&self) -> ServiceReport {
        ServiceReport {
            name: self.spec.name.clone(),
            state: self.state,
            cause: self.cause.clone(),
            blocked_by: self.blocked_by.clone(),
            instance: self.handle.as_ref().map(|h| h.id.clone()),
            reused: self.reused,
            probe_attempts: self.probe_attempts,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    instances: BTreeMap<String, Instance>,
}

impl Table {
    /// Names of services holding a runtime handle that depend on `name`.
    fn running_dependents(&self, name: &str) -> Vec<String> {
        self.instances
            .values()
            .filter(|i| i.handle.is_some() && i.spec.depends_on.iter().any(|d| d == name))
            .map(|i| i.spec.name.clone())
            .collect()
    }
}

struct Shared {
    table: Mutex<Table>,
    events: broadcast::Sender<ServiceTransition>,
}

impl Shared {
    /// Move `name` to `to` and publish the change. Must be called with the
    /// table lock held.
    fn apply(&self, table: &mut Table, name: &str, to: ServiceState, cause: Option<String>) {
        let Some(instance) = table.instances.get_mut(name) else {
            return;
        };
        let from = instance.state;
        instance.state = to;
        if cause.is_some() {
            instance.cause = cause;
        }
        if from == to {
            return;
        }

        match to {
            ServiceState::Ready => METRICS.inc_services_ready(),
            ServiceState::Failed => METRICS.inc_services_failed(),
            _ => {}
        }
        obs::emit_service_transition(name, from, to);
        // No subscribers is fine.
        let _ = self.events.send(ServiceTransition {
            service: name.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }

    async fn transition(&self, name: &str, to: ServiceState, cause: Option<String>) {
        let mut table = self.table.lock().await;
        self.apply(&mut table, name, to, cause);
    }

    async fn stop_locked(
        &self,
        table: &mut Table,
        runtime: &dyn RuntimeBackend,
        name: &str,
    ) -> Result<()> {
        let instance = table
            .instances
            .get(name)
            .ok_or_else(|| BerthError::ServiceNotFound(name.to_string()))?;
        if instance.state == ServiceState::Stopped && instance.handle.is_none() {
            return Ok(());
        }

        let dependents = table.running_dependents(name);
        if !dependents.is_empty() {
            return Err(BerthError::StopRejected {
                service: name.to_string(),
                dependents,
            });
        }

        if let Some(handle) = instance.handle.clone() {
            runtime.stop_instance(&handle).await?;
        }
        if let Some(instance) = table.instances.get_mut(name) {
            instance.handle = None;
        }
        self.apply(table, name, ServiceState::Stopped, None);
        Ok(())
    }
}

/// Starts and stops services in dependency order through a [`RuntimeBackend`].
pub struct ServiceOrchestrator {
    runtime: Arc<dyn RuntimeBackend>,
    gate: HealthGate,
    config: OrchestratorConfig,
    shared: Arc<Shared>,
}

impl ServiceOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeBackend>,
        gate: HealthGate,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runtime,
            gate,
            config,
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                events,
            }),
        }
    }

    /// Stream of every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceTransition> {
        self.shared.events.subscribe()
    }

    /// Current state of `name`, if the orchestrator knows it.
    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.shared
            .table
            .lock()
            .await
            .instances
            .get(name)
            .map(|i| i.state)
    }

    /// Reports for every known service, ordered by name.
    pub async fn snapshot(&self) -> Vec<ServiceReport> {
        self.shared
            .table
            .lock()
            .await
            .instances
            .values()
            .map(Instance::report)
            .collect()
    }

    /// Deploy `specs` without cancellation.
    pub async fn start(
        &self,
        specs: &[ServiceSpec],
        options: StartOptions,
    ) -> Result<DeploymentReport> {
        self.start_with_cancel(specs, options, CancelSignal::never()).await
    }

    /// Deploy `specs`.
    ///
    /// Structural problems (duplicate names, unknown dependencies, cycles)
    /// are returned as `Err` before any instance is touched. Service failures
    /// are reported per service in the [`DeploymentReport`].
    ///
    /// A service already `Ready` with an identical spec is kept unless
    /// `force_recreate` is set or one of its dependencies is replaced.
    /// Replaced services are stopped, dependents first, before anything
    /// starts.
    #[instrument(skip_all, fields(services = specs.len(), force_recreate = options.force_recreate))]
    pub async fn start_with_cancel(
        &self,
        specs: &[ServiceSpec],
        options: StartOptions,
        cancel: CancelSignal,
    ) -> Result<DeploymentReport> {
        let started = Instant::now();
        let (graph, order) = validate(specs)?;

        let done = self.prepare(specs, &order, &graph, options).await?;
        info!(reused = done.len(), "deployment started");

        let mut waiting: BTreeMap<&str, usize> = order
            .iter()
            .map(|name| {
                let open = graph
                    .dependencies_of(name)
                    .into_iter()
                    .filter(|d| !done.contains(*d))
                    .count();
                (name.as_str(), open)
            })
            .collect();
        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|n| !done.contains(*n) && waiting.get(n.as_str()) == Some(&0))
            .cloned()
            .collect();

        let mut tasks: JoinSet<(String, ServiceState)> = JoinSet::new();
        loop {
            while let Some(name) = ready.pop_front() {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(spec) = specs.iter().find(|s| s.name == name).cloned() else {
                    continue;
                };
                let ctx = ServiceTask {
                    runtime: Arc::clone(&self.runtime),
                    gate: self.gate.clone(),
                    shared: Arc::clone(&self.shared),
                    start_timeout: self.config.start_timeout,
                    cancel: cancel.clone(),
                };
                tasks.spawn(async move {
                    let state = AssertUnwindSafe(ctx.run(&spec))
                        .catch_unwind()
                        .await
                        .unwrap_or(ServiceState::Failed);
                    (spec.name, state)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, state) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "service task did not complete");
                    continue;
                }
            };

            if state == ServiceState::Ready {
                for dependent in graph.dependents_of(&name) {
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && !done.contains(dependent) {
                            ready.push_back(dependent.to_string());
                        }
                    }
                }
            } else {
                let mut table = self.shared.table.lock().await;
                let current = table.instances.get(&name).map(|i| i.state);
                if current != Some(state) && current != Some(ServiceState::Stopped) {
                    let cause = Some("service task panicked".to_string());
                    self.shared.apply(&mut table, &name, state, cause);
                }
            }
        }

        let mut table = self.shared.table.lock().await;
        let mut blocked_by: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in &order {
            let failed = table
                .instances
                .get(name)
                .is_some_and(|i| i.state == ServiceState::Failed);
            if failed {
                for dependent in graph.transitive_dependents_of(name) {
                    blocked_by.entry(dependent).or_default().insert(name.clone());
                }
            }
        }
        for name in &order {
            let pending = table
                .instances
                .get(name)
                .is_some_and(|i| i.state == ServiceState::Pending);
            if !pending {
                continue;
            }
            if cancel.is_cancelled() {
                self.shared.apply(
                    &mut table,
                    name,
                    ServiceState::Failed,
                    Some(BerthError::Cancelled.to_string()),
                );
            } else if let Some(instance) = table.instances.get_mut(name) {
                instance.blocked_by = blocked_by
                    .remove(name)
                    .map(|s| s.into_iter().collect())
                    .unwrap_or_default();
                if !instance.blocked_by.is_empty() {
                    instance.cause = Some(format!("blocked by {}", instance.blocked_by.join(", ")));
                }
            }
        }

        let report = DeploymentReport {
            services: order
                .iter()
                .filter_map(|n| table.instances.get(n).map(Instance::report))
                .collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            ready = report.ready(),
            failed = report.failed().len(),
            blocked = report.blocked().len(),
            "deployment finished"
        );
        Ok(report)
    }

    /// Decide which services are kept and reset the rest to `Pending`.
    ///
    /// A service is kept when it is `Ready` with an identical spec and none
    /// of its dependencies is being replaced. Old instances of replaced
    /// services are stopped up front, dependents first. Returns the names
    /// of kept services.
    async fn prepare(
        &self,
        specs: &[ServiceSpec],
        order: &[String],
        graph: &DependencyGraph,
        options: StartOptions,
    ) -> Result<BTreeSet<String>> {
        let by_name: BTreeMap<&str, &ServiceSpec> =
            specs.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut table = self.shared.table.lock().await;

        let mut kept = BTreeSet::new();
        let mut replaced = BTreeSet::new();
        for name in order {
            let Some(spec) = by_name.get(name.as_str()) else {
                continue;
            };
            let unchanged = table.instances.get(name).is_some_and(|i| {
                i.state == ServiceState::Ready && i.spec == **spec && i.handle.is_some()
            });
            let upstream_replaced = graph
                .dependencies_of(name)
                .iter()
                .any(|d| replaced.contains(*d));
            if unchanged && !options.force_recreate && !upstream_replaced {
                kept.insert(name.clone());
            } else {
                replaced.insert(name.clone());
            }
        }

        // Running services outside this deployment keep their dependencies.
        for name in &replaced {
            let outside: Vec<String> = table
                .running_dependents(name)
                .into_iter()
                .filter(|d| !by_name.contains_key(d.as_str()))
                .collect();
            let running = table.instances.get(name).is_some_and(|i| i.handle.is_some());
            if running && !outside.is_empty() {
                return Err(BerthError::StopRejected {
                    service: name.clone(),
                    dependents: outside,
                });
            }
        }

        for name in order.iter().rev().filter(|n| replaced.contains(*n)) {
            let handle = table.instances.get_mut(name).and_then(|i| i.handle.take());
            if let Some(handle) = handle {
                if let Err(e) = self.runtime.stop_instance(&handle).await {
                    warn!(service = %name, error = %e, "failed to stop replaced instance");
                }
                self.shared.apply(&mut table, name, ServiceState::Stopped, None);
            }
        }

        for name in order {
            let Some(spec) = by_name.get(name.as_str()) else {
                continue;
            };
            if kept.contains(name) {
                if let Some(instance) = table.instances.get_mut(name) {
                    instance.reused = true;
                    instance.blocked_by.clear();
                }
                continue;
            }
            let mut fresh = Instance::pending((*spec).clone());
            if let Some(old) = table.instances.get(name) {
                fresh.state = old.state;
            }
            table.instances.insert(name.clone(), fresh);
            self.shared.apply(&mut table, name, ServiceState::Pending, None);
        }
        Ok(kept)
    }

    /// Stop one service.
    ///
    /// Rejected with [`BerthError::StopRejected`] while any service that
    /// depends on it still holds a running instance.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut table = self.shared.table.lock().await;
        self.shared
            .stop_locked(&mut table, self.runtime.as_ref(), name)
            .await
    }

    /// Stop every running service, dependents before their dependencies.
    ///
    /// A failed stop does not abort the rest. Services it leaves running
    /// keep their dependencies running too, and both are listed in
    /// [`StopReport::errors`].
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> StopReport {
        let mut table = self.shared.table.lock().await;
        let mut report = StopReport::default();
        let mut remaining: BTreeSet<String> = table
            .instances
            .values()
            .filter(|i| i.handle.is_some())
            .map(|i| i.spec.name.clone())
            .collect();

        while !remaining.is_empty() {
            let mut batch: Vec<String> = remaining
                .iter()
                .filter(|n| {
                    table
                        .running_dependents(n)
                        .iter()
                        .all(|d| !remaining.contains(d))
                })
                .cloned()
                .collect();
            if batch.is_empty() {
                batch = remaining.iter().cloned().collect();
            }
            for name in batch {
                remaining.remove(&name);
                match self
                    .shared
                    .stop_locked(&mut table, self.runtime.as_ref(), &name)
                    .await
                {
                    Ok(()) => report.stopped.push(name),
                    Err(e) => {
                        warn!(service = %name, error = %e, "failed to stop service");
                        report.errors.insert(name, e.to_string());
                    }
                }
            }
        }

        let idle: Vec<String> = table
            .instances
            .iter()
            .filter(|(_, i)| i.state != ServiceState::Stopped && i.handle.is_none())
            .map(|(n, _)| n.clone())
            .collect();
        for name in idle {
            self.shared.apply(&mut table, &name, ServiceState::Stopped, None);
        }
        report
    }
}

fn validate(specs: &[ServiceSpec]) -> Result<(DependencyGraph, Vec<String>)> {
    let mut seen = BTreeSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(BerthError::InvalidDescriptor(
                "service with empty name".to_string(),
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(BerthError::InvalidDescriptor(format!(
                "duplicate service: {}",
                spec.name
            )));
        }
    }
    let graph = DependencyGraph::from_declarations(
        specs
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str))),
    )?;
    let order = graph.topological_order()?;
    Ok((graph, order))
}

/// Everything one service task needs, detached from the orchestrator.
struct ServiceTask {
    runtime: Arc<dyn RuntimeBackend>,
    gate: HealthGate,
    shared: Arc<Shared>,
    start_timeout: Option<Duration>,
    cancel: CancelSignal,
}

impl ServiceTask {
    async fn run(mut self, spec: &ServiceSpec) -> ServiceState {
        let name = spec.name.as_str();

        self.shared.transition(name, ServiceState::Starting, None).await;
        let started = tokio::select! {
            result = bounded(self.start_timeout, self.runtime.start_instance(spec)) => result,
            _ = self.cancel.cancelled() => Err(BerthError::Cancelled),
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .transition(name, ServiceState::Failed, Some(e.to_string()))
                    .await;
                return ServiceState::Failed;
            }
        };
        {
            let mut table = self.shared.table.lock().await;
            if let Some(instance) = table.instances.get_mut(name) {
                instance.handle = Some(handle.clone());
            }
        }

        let Some(probe) = spec.healthcheck.as_ref() else {
            self.shared.transition(name, ServiceState::Ready, None).await;
            return ServiceState::Ready;
        };

        self.shared
            .transition(name, ServiceState::HealthChecking, None)
            .await;
        let outcome = self.gate.wait(name, probe, self.cancel.clone()).await;
        {
            let mut table = self.shared.table.lock().await;
            if let Some(instance) = table.instances.get_mut(name) {
                instance.probe_attempts = outcome.attempts;
            }
        }

        match outcome.state {
            GateState::Ready => {
                self.shared.transition(name, ServiceState::Ready, None).await;
                ServiceState::Ready
            }
            GateState::Cancelled => {
                if let Err(e) = self.runtime.stop_instance(&handle).await {
                    warn!(service = %name, error = %e, "failed to stop cancelled instance");
                }
                let mut table = self.shared.table.lock().await;
                if let Some(instance) = table.instances.get_mut(name) {
                    instance.handle = None;
                }
                self.shared.apply(
                    &mut table,
                    name,
                    ServiceState::Stopped,
                    Some(BerthError::Cancelled.to_string()),
                );
                ServiceState::Stopped
            }
            _ => {
                let cause = outcome.into_result(name).err().map(|e| e.to_string());
                self.shared
                    .transition(name, ServiceState::Failed, cause)
                    .await;
                ServiceState::Failed
            }
        }
    }
}

async fn bounded<F>(limit: Option<Duration>, fut: F) -> Result<InstanceHandle>
where
    F: Future<Output = Result<InstanceHandle>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            BerthError::Runtime(format!(
                "start timed out after {}",
                humantime::format_duration(limit)
            ))
        })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeRuntime, ScriptedProber};
    use crate::service::{HealthCheck, HealthProbe};

    fn orchestrator(runtime: Arc<FakeRuntime>, prober: Arc<ScriptedProber>) -> ServiceOrchestrator {
        ServiceOrchestrator::new(runtime, HealthGate::new(prober), OrchestratorConfig::default())
    }

    fn http_probe() -> HealthProbe {
        HealthProbe::new(HealthCheck::Http {
            url: "http://127.0.0.1:8000/health".to_string(),
        })
        .with_interval(Duration::from_secs(1))
        .with_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let orch = orchestrator(Arc::new(FakeRuntime::new()), Arc::new(ScriptedProber::new()));
        let specs = [ServiceSpec::new("redis", "redis:7"), ServiceSpec::new("redis", "redis:6")];
        let err = orch.start(&specs, StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, BerthError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_unknown_dependency_starts_nothing() {
        let runtime = Arc::new(FakeRuntime::new());
        let orch = orchestrator(runtime.clone(), Arc::new(ScriptedProber::new()));
        let specs = [ServiceSpec::new("backend", "app").depends_on("postgres")];
        let err = orch.start(&specs, StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, BerthError::UnknownDependency { .. }));
        assert!(runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_failure_is_local() {
        let runtime = Arc::new(FakeRuntime::new().fail_start("worker", "image not found"));
        let orch = orchestrator(runtime, Arc::new(ScriptedProber::new()));
        let specs = [
            ServiceSpec::new("redis", "redis:7"),
            ServiceSpec::new("worker", "app").depends_on("redis"),
        ];
        let report = orch.start(&specs, StartOptions::default()).await.unwrap();
        assert_eq!(report.state_of("redis"), Some(ServiceState::Ready));
        assert_eq!(report.state_of("worker"), Some(ServiceState::Failed));
        assert!(report
            .service("worker")
            .and_then(|s| s.cause.clone())
            .unwrap()
            .contains("image not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_fails_service() {
        let runtime = Arc::new(FakeRuntime::new().delay_start("slow", Duration::from_secs(120)));
        let orch = ServiceOrchestrator::new(
            runtime,
            HealthGate::new(Arc::new(ScriptedProber::new())),
            OrchestratorConfig {
                start_timeout: Some(Duration::from_secs(10)),
            },
        );
        let report = orch
            .start(&[ServiceSpec::new("slow", "app")], StartOptions::default())
            .await
            .unwrap();
        assert_eq!(report.state_of("slow"), Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn test_unchanged_ready_service_is_reused() {
        let runtime = Arc::new(FakeRuntime::new());
        let orch = orchestrator(runtime.clone(), Arc::new(ScriptedProber::new()));
        let specs = [ServiceSpec::new("redis", "redis:7")];

        orch.start(&specs, StartOptions::default()).await.unwrap();
        let again = orch.start(&specs, StartOptions::default()).await.unwrap();
        assert!(again.service("redis").unwrap().reused);
        assert_eq!(runtime.start_count("redis"), 1);
    }

    #[tokio::test]
    async fn test_force_recreate_replaces_instance() {
        let runtime = Arc::new(FakeRuntime::new());
        let orch = orchestrator(runtime.clone(), Arc::new(ScriptedProber::new()));
        let specs = [ServiceSpec::new("redis", "redis:7")];

        orch.start(&specs, StartOptions::default()).await.unwrap();
        let again = orch
            .start(&specs, StartOptions { force_recreate: true })
            .await
            .unwrap();
        assert!(!again.service("redis").unwrap().reused);
        assert_eq!(runtime.start_count("redis"), 2);
        assert_eq!(
            runtime.events(),
            vec!["start:redis", "stop:redis", "start:redis"]
        );
    }

    #[tokio::test]
    async fn test_changed_spec_replaces_instance() {
        let runtime = Arc::new(FakeRuntime::new());
        let orch = orchestrator(runtime.clone(), Arc::new(ScriptedProber::new()));
        orch.start(&[ServiceSpec::new("redis", "redis:7")], StartOptions::default())
            .await
            .unwrap();
        orch.start(&[ServiceSpec::new("redis", "redis:7.2")], StartOptions::default())
            .await
            .unwrap();
        assert_eq!(runtime.start_count("redis"), 2);
        assert_eq!(runtime.running(), vec!["redis".to_string()]);
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let orch = orchestrator(Arc::new(FakeRuntime::new()), Arc::new(ScriptedProber::new()));
        let mut rx = orch.subscribe();
        orch.start(
            &[ServiceSpec::new("backend", "app").with_healthcheck(http_probe())],
            StartOptions::default(),
        )
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Ok(t) = rx.try_recv() {
            seen.push(t.to);
        }
        assert_eq!(
            seen,
            vec![
                ServiceState::Starting,
                ServiceState::HealthChecking,
                ServiceState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let orch = orchestrator(Arc::new(FakeRuntime::new()), Arc::new(ScriptedProber::new()));
        assert!(matches!(
            orch.stop("ghost").await,
            Err(BerthError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_stops_dependents_first() {
        let runtime = Arc::new(FakeRuntime::new());
        let orch = orchestrator(runtime.clone(), Arc::new(ScriptedProber::new()));
        let specs = [
            ServiceSpec::new("redis", "redis:7"),
            ServiceSpec::new("backend", "app").depends_on("redis"),
            ServiceSpec::new("celery", "app").depends_on("backend"),
        ];
        orch.start(&specs, StartOptions::default()).await.unwrap();
        let report = orch.stop_all().await;
        assert!(report.is_complete());
        assert_eq!(report.stopped, vec!["celery", "backend", "redis"]);
        assert!(runtime.running().is_empty());
        assert_eq!(orch.state("redis").await, Some(ServiceState::Stopped));
    }
}
