//! Runtime backend that runs each service's command as a local process.
//!
//! The service image is exported as `BERTH_IMAGE`; the declared environment
//! is passed through. A service without a command is launched through the
//! image command template, e.g. `docker run --rm ${IMAGE}`. Children are
//! killed when stopped or when the runtime is dropped.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use berth_core::{InstanceHandle, RuntimeBackend, ServiceSpec};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BackendError, Result};

#[derive(Default)]
pub struct ProcessRuntime {
    workdir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    image_command: Vec<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Send each service's stdout and stderr to `<dir>/<service>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Launch command-less services with `argv`, substituting `${IMAGE}`
    /// and `${SERVICE}`.
    pub fn with_image_command(mut self, argv: Vec<String>) -> Self {
        self.image_command = argv;
        self
    }

    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }

    fn output(&self, service: &str) -> Result<(Stdio, Stdio)> {
        let Some(dir) = &self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        std::fs::create_dir_all(dir)?;
        let file = File::options()
            .create(true)
            .append(true)
            .open(dir.join(format!("{service}.log")))?;
        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }

    fn argv(&self, spec: &ServiceSpec) -> Vec<String> {
        if !spec.command.is_empty() {
            return spec.command.clone();
        }
        self.image_command
            .iter()
            .map(|arg| {
                arg.replace("${IMAGE}", &spec.image)
                    .replace("${SERVICE}", &spec.name)
            })
            .collect()
    }

    async fn spawn(&self, spec: &ServiceSpec) -> Result<InstanceHandle> {
        let argv = self.argv(spec);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BackendError::EmptyCommand(spec.name.clone()))?;
        let (stdout, stderr) = self.output(&spec.name)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.environment)
            .env("BERTH_SERVICE", &spec.name)
            .env("BERTH_IMAGE", &spec.image)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        // A process that is already gone never became an instance.
        if let Some(status) = child.try_wait()? {
            return Err(BackendError::CommandFailed {
                program: program.clone(),
                status: status.to_string(),
                detail: "exited during start".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        info!(
            service = %spec.name,
            instance = %id,
            pid = child.id().unwrap_or_default(),
            "process started"
        );
        self.children.lock().await.insert(id.clone(), child);
        Ok(InstanceHandle::new(spec.name.as_str(), id))
    }

    async fn kill(&self, handle: &InstanceHandle) -> Result<()> {
        let child = self.children.lock().await.remove(&handle.id);
        let Some(mut child) = child else {
            return Err(BackendError::NotFound(format!(
                "{} instance {}",
                handle.service, handle.id
            )));
        };
        if let Err(e) = child.kill().await {
            // Already exited on its own.
            warn!(service = %handle.service, error = %e, "kill failed");
        }
        info!(service = %handle.service, instance = %handle.id, "process stopped");
        Ok(())
    }
}

#[async_trait]
impl RuntimeBackend for ProcessRuntime {
    async fn start_instance(&self, spec: &ServiceSpec) -> berth_core::Result<InstanceHandle> {
        self.spawn(spec).await.map_err(BackendError::into_runtime)
    }

    async fn stop_instance(&self, handle: &InstanceHandle) -> berth_core::Result<()> {
        self.kill(handle).await.map_err(BackendError::into_runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_less_service_uses_image_command() {
        let runtime = ProcessRuntime::new().with_image_command(vec![
            "docker".to_string(),
            "run".to_string(),
            "--name".to_string(),
            "berth-${SERVICE}".to_string(),
            "${IMAGE}".to_string(),
        ]);
        assert_eq!(
            runtime.argv(&ServiceSpec::new("redis", "redis:7")),
            vec!["docker", "run", "--name", "berth-redis", "redis:7"]
        );

        let explicit = ServiceSpec::new("web", "acme/web:latest")
            .with_command(vec!["gunicorn".to_string(), "app:app".to_string()]);
        assert_eq!(runtime.argv(&explicit), vec!["gunicorn", "app:app"]);
    }

    #[test]
    fn test_no_image_command_leaves_argv_empty() {
        let runtime = ProcessRuntime::new();
        assert!(runtime.argv(&ServiceSpec::new("redis", "redis:7")).is_empty());
    }
}
