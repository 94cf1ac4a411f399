//! Structured lifecycle events.
//!
//! Every event is an `info!` (or `warn!`) record with an `event` field, so
//! JSON output can be filtered on it, e.g. `event=service.transition`.

use tracing::info;
use uuid::Uuid;

use crate::service::ServiceState;

/// RAII guard for a command-scoped span.
///
/// ```ignore
/// let _span = RunSpan::enter("release", "feature-login");
/// ```
pub struct RunSpan {
    run_id: Uuid,
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Enter a span tagged with a fresh run id.
    pub fn enter(command: &str, tag: &str) -> Self {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "berth.run",
            run_id = %run_id,
            command = %command,
            tag = %tag
        );
        Self {
            run_id,
            _span: span.entered(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

pub fn emit_tag_resolved(git_ref: &str, tag: &str) {
    info!(event = "tag.resolved", git_ref = %git_ref, tag = %tag);
}

pub fn emit_build_started(stages: usize, tag: Option<&str>) {
    info!(event = "build.started", stages = stages, tag = tag.unwrap_or("-"));
}

/// `status` is one of `built`, `cached`, `failed`, `blocked`, `cancelled`.
pub fn emit_stage_finished(stage: &str, status: &str, fingerprint: &str, duration_ms: u64) {
    info!(
        event = "build.stage_finished",
        stage = %stage,
        status = %status,
        fingerprint = %fingerprint,
        duration_ms = duration_ms,
    );
}

pub fn emit_build_finished(duration_ms: u64, success: bool) {
    info!(event = "build.finished", duration_ms = duration_ms, success = success);
}

pub fn emit_service_transition(service: &str, from: ServiceState, to: ServiceState) {
    info!(event = "service.transition", service = %service, from = %from, to = %to);
}

pub fn emit_artifact_pushed(reference: &str, digest: &str) {
    info!(event = "release.pushed", reference = %reference, digest = %digest);
}

pub fn emit_push_failed(reference: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "release.push_failed", reference = %reference, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = RunSpan::enter("build", "latest");
        assert!(!span.run_id().is_nil());
        emit_stage_finished("app", "built", "abc123", 12);
    }
}
