//! Service definitions and runtime instance state.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a health probe decides whether a service is ready.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheck {
    /// Run a command; exit status 0 means healthy.
    Command { argv: Vec<String> },
    /// GET a URL; any 2xx response means healthy.
    Http { url: String },
    /// Open a TCP connection; a successful connect means healthy.
    Tcp { address: String },
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheck::Command { argv } => write!(f, "command `{}`", argv.join(" ")),
            HealthCheck::Http { url } => write!(f, "http {url}"),
            HealthCheck::Tcp { address } => write!(f, "tcp {address}"),
        }
    }
}

/// A bounded readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthProbe {
    pub check: HealthCheck,
    /// Delay between attempts.
    #[serde(with = "crate::descriptor::duration_serde")]
    pub interval: Duration,
    /// Upper bound for one attempt.
    #[serde(with = "crate::descriptor::duration_serde")]
    pub timeout: Duration,
    /// Consecutive failed attempts before the service is failed.
    pub retries: u32,
    /// Grace period before the first attempt.
    #[serde(with = "crate::descriptor::duration_serde")]
    pub start_period: Duration,
}

impl HealthProbe {
    /// Probe with compose-style defaults: 30s interval, 30s timeout,
    /// 3 retries, no start period.
    pub fn new(check: HealthCheck) -> Self {
        Self {
            check,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Declarative definition of one service in a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Image or artifact reference, with the version variable already substituted.
    pub image: String,
    /// Services that must be `Ready` first, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Command handed to the runtime backend, if any.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub healthcheck: Option<HealthProbe>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            depends_on: Vec::new(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            healthcheck: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_healthcheck(mut self, probe: HealthProbe) -> Self {
        self.healthcheck = Some(probe);
        self
    }
}

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Starting,
    HealthChecking,
    Ready,
    Failed,
    Stopped,
}

impl ServiceState {
    /// No further transition happens without a new start or stop request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::Ready | ServiceState::Failed | ServiceState::Stopped
        )
    }

    /// An instance may be holding runtime resources.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::HealthChecking | ServiceState::Ready
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::HealthChecking => "health_checking",
            ServiceState::Ready => "ready",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Opaque handle returned by a runtime backend for a started instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub service: String,
    pub id: String,
}

impl InstanceHandle {
    pub fn new(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_dependencies_in_order() {
        let spec = ServiceSpec::new("celery", "app:latest")
            .depends_on("redis")
            .depends_on("backend");
        assert_eq!(spec.depends_on, vec!["redis", "backend"]);
        assert!(spec.healthcheck.is_none());
    }

    #[test]
    fn test_probe_defaults() {
        let probe = HealthProbe::new(HealthCheck::Tcp {
            address: "127.0.0.1:6379".to_string(),
        });
        assert_eq!(probe.retries, 3);
        assert_eq!(probe.interval, Duration::from_secs(30));
        assert_eq!(probe.start_period, Duration::ZERO);
    }

    #[test]
    fn test_state_classification() {
        assert!(ServiceState::Ready.is_terminal());
        assert!(ServiceState::Failed.is_terminal());
        assert!(!ServiceState::HealthChecking.is_terminal());
        assert!(ServiceState::HealthChecking.is_running());
        assert!(!ServiceState::Pending.is_running());
        assert!(!ServiceState::Stopped.is_running());
    }

    #[test]
    fn test_spec_serde_roundtrip() {
        let spec = ServiceSpec::new("backend", "registry/backend:latest")
            .depends_on("redis")
            .with_healthcheck(
                HealthProbe::new(HealthCheck::Http {
                    url: "http://127.0.0.1:8000/health".to_string(),
                })
                .with_interval(Duration::from_secs(5))
                .with_retries(2),
            );
        let json = serde_json::to_string(&spec).unwrap();
        let back: ServiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
