//! Per-service readiness gate.
//!
//! `Pending` waits out the start period, then `Probing` issues one attempt per
//! interval until an attempt succeeds (`Ready`) or `retries` consecutive
//! attempts fail (`Failed`). Each attempt is bounded by the probe timeout.
//! A cancelled gate ends in `Cancelled` without further attempts.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::backend::HealthProber;
use crate::cancel::CancelSignal;
use crate::error::{BerthError, Result};
use crate::metrics::METRICS;
use crate::service::HealthProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pending,
    Probing,
    Ready,
    Failed,
    Cancelled,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateState::Pending => "pending",
            GateState::Probing => "probing",
            GateState::Ready => "ready",
            GateState::Failed => "failed",
            GateState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a gate ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub state: GateState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
}

impl GateOutcome {
    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    /// `Ok` only for a ready gate.
    pub fn into_result(self, service: &str) -> Result<()> {
        match self.state {
            GateState::Ready => Ok(()),
            GateState::Cancelled => Err(BerthError::Cancelled),
            _ => Err(BerthError::HealthCheckFailed {
                service: service.to_string(),
                cause: self
                    .last_error
                    .unwrap_or_else(|| "no successful probe".to_string()),
            }),
        }
    }
}

/// Drives a [`HealthProbe`] to a terminal state through a [`HealthProber`].
#[derive(Clone)]
pub struct HealthGate {
    prober: Arc<dyn HealthProber>,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn HealthProber>) -> Self {
        Self { prober }
    }

    /// Wait until `service` passes `probe`, fails it, or `cancel` fires.
    ///
    /// A probe with `retries == 0` still gets one attempt.
    pub async fn wait(
        &self,
        service: &str,
        probe: &HealthProbe,
        mut cancel: CancelSignal,
    ) -> GateOutcome {
        let started = Instant::now();
        let max_attempts = probe.retries.max(1);
        let mut state = GateState::Pending;
        let mut attempts = 0u32;
        let mut last_error: Option<String> = None;

        let finish = |state: GateState, attempts: u32, last_error: Option<String>| GateOutcome {
            state,
            attempts,
            last_error,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        if !probe.start_period.is_zero() {
            tokio::select! {
                _ = sleep(probe.start_period) => {}
                _ = cancel.cancelled() => return finish(GateState::Cancelled, attempts, last_error),
            }
        }
        advance(service, &mut state, GateState::Probing);

        loop {
            attempts += 1;
            METRICS.inc_probe_attempts();

            let attempt = tokio::select! {
                result = timeout(probe.timeout, self.prober.probe(service, &probe.check)) => result,
                _ = cancel.cancelled() => {
                    advance(service, &mut state, GateState::Cancelled);
                    return finish(state, attempts, last_error);
                }
            };

            match attempt {
                Ok(Ok(())) => {
                    advance(service, &mut state, GateState::Ready);
                    return finish(state, attempts, None);
                }
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => {
                    last_error = Some(format!(
                        "probe timed out after {}",
                        humantime::format_duration(probe.timeout)
                    ))
                }
            }
            debug!(
                service = %service,
                attempt = attempts,
                max_attempts = max_attempts,
                error = last_error.as_deref().unwrap_or_default(),
                "health probe failed"
            );

            if attempts >= max_attempts {
                advance(service, &mut state, GateState::Failed);
                return finish(state, attempts, last_error);
            }

            tokio::select! {
                _ = sleep(probe.interval) => {}
                _ = cancel.cancelled() => {
                    advance(service, &mut state, GateState::Cancelled);
                    return finish(state, attempts, last_error);
                }
            }
        }
    }
}

fn advance(service: &str, state: &mut GateState, to: GateState) {
    debug!(service = %service, from = %state, to = %to, "health gate");
    *state = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::fakes::ScriptedProber;
    use crate::service::HealthCheck;
    use std::time::Duration;

    fn probe() -> HealthProbe {
        HealthProbe::new(HealthCheck::Http {
            url: "http://127.0.0.1:8000/health".to_string(),
        })
        .with_interval(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(5))
        .with_retries(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_is_ready() {
        let prober = Arc::new(ScriptedProber::new());
        let gate = HealthGate::new(prober.clone());
        let outcome = gate.wait("backend", &probe(), CancelSignal::never()).await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(prober.attempts("backend"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retries() {
        let prober = Arc::new(ScriptedProber::new().script(
            "backend",
            vec![Err("connection refused".into()), Err("503".into()), Ok(())],
        ));
        let outcome = HealthGate::new(prober)
            .wait("backend", &probe(), CancelSignal::never())
            .await;
        assert_eq!(outcome.state, GateState::Ready);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_exactly_retries_attempts() {
        let prober = Arc::new(ScriptedProber::new().always_fail("backend", "connection refused"));
        let gate = HealthGate::new(prober.clone());
        let outcome = gate.wait("backend", &probe(), CancelSignal::never()).await;
        assert_eq!(outcome.state, GateState::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(prober.attempts("backend"), 3);
        assert!(outcome.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_period_delays_first_attempt() {
        let prober = Arc::new(ScriptedProber::new());
        let gate = HealthGate::new(prober.clone());
        let probe = probe().with_start_period(Duration::from_secs(30));

        let handle = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait("backend", &probe, CancelSignal::never()).await }
        });
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(prober.attempts("backend"), 0);

        let outcome = handle.await.unwrap();
        assert!(outcome.is_ready());
        assert!(outcome.elapsed_ms >= 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_failed_attempt() {
        let prober = Arc::new(ScriptedProber::new().delay("backend", Duration::from_secs(60)));
        let outcome = HealthGate::new(prober)
            .wait("backend", &probe().with_retries(2), CancelSignal::never())
            .await;
        assert_eq!(outcome.state, GateState::Failed);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_probes_once() {
        let prober = Arc::new(ScriptedProber::new().always_fail("backend", "down"));
        let outcome = HealthGate::new(prober)
            .wait("backend", &probe().with_retries(0), CancelSignal::never())
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.state, GateState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_interval() {
        let prober = Arc::new(ScriptedProber::new().always_fail("backend", "down"));
        let gate = HealthGate::new(prober);
        let (handle, signal) = cancel_pair();
        let task = tokio::spawn(async move { gate.wait("backend", &probe(), signal).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, GateState::Cancelled);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.into_result("backend"),
            Err(BerthError::Cancelled)
        ));
    }

    #[test]
    fn test_failed_outcome_maps_to_health_error() {
        let outcome = GateOutcome {
            state: GateState::Failed,
            attempts: 3,
            last_error: Some("503".to_string()),
            elapsed_ms: 0,
        };
        let err = outcome.into_result("backend").unwrap_err();
        assert!(matches!(
            err,
            BerthError::HealthCheckFailed { ref service, .. } if service == "backend"
        ));
    }
}
