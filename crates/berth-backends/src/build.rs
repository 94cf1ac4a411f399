//! Build backend that runs each stage's command as a child process.
//!
//! The command runs in the working directory with these variables set:
//!
//! | variable             | value                                     |
//! |----------------------|-------------------------------------------|
//! | `BERTH_STAGE`        | stage name                                |
//! | `BERTH_FINGERPRINT`  | stage fingerprint                         |
//! | `BERTH_TAG`          | release tag, empty when none was resolved |
//! | `BERTH_OUTPUT`       | file the stage may write its output to    |
//! | `BERTH_DEP_<STAGE>`  | digest of each direct dependency          |
//!
//! The artifact digest is the SHA-256 of `BERTH_OUTPUT` when the command
//! wrote it, else of the fingerprint. Stages without a command produce the
//! fingerprint-derived artifact without running anything.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use berth_core::{Artifact, BuildBackend, BuildRequest};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{BackendError, Result};

const STDERR_TAIL: usize = 2048;

pub struct CommandBuildBackend {
    workdir: PathBuf,
    output_dir: PathBuf,
}

impl CommandBuildBackend {
    /// Run commands in `workdir`, keeping stage outputs under `output_dir`.
    pub fn new(workdir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn output_path(&self, request: &BuildRequest) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.out", request.stage, request.fingerprint.short()))
    }

    async fn run(&self, request: &BuildRequest) -> Result<Artifact> {
        let Some((program, args)) = request.command.split_first() else {
            return Ok(Artifact::from_content(
                request.stage.as_str(),
                request.fingerprint.as_str().as_bytes(),
            ));
        };

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_path = self.output_path(request);
        match tokio::fs::remove_file(&output_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.workdir)
            .env("BERTH_STAGE", &request.stage)
            .env("BERTH_FINGERPRINT", request.fingerprint.as_str())
            .env("BERTH_TAG", request.tag.as_deref().unwrap_or_default())
            .env("BERTH_OUTPUT", &output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (dep, artifact) in &request.dependencies {
            command.env(dependency_var(dep), &artifact.digest);
        }

        let start = Instant::now();
        debug!(stage = %request.stage, program = %program, "running build command");
        let output = command.spawn()?.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CommandFailed {
                program: program.clone(),
                status: output.status.to_string(),
                detail: tail(stderr.trim(), STDERR_TAIL).to_string(),
            });
        }

        let artifact = match tokio::fs::read(&output_path).await {
            Ok(bytes) => Artifact::from_content(request.stage.as_str(), &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Artifact::from_content(
                request.stage.as_str(),
                request.fingerprint.as_str().as_bytes(),
            ),
            Err(e) => return Err(e.into()),
        };
        info!(
            stage = %request.stage,
            digest = %artifact.short_digest(),
            duration_ms = start.elapsed().as_millis() as u64,
            "stage command finished"
        );
        Ok(artifact)
    }
}

/// `BERTH_DEP_<STAGE>` with the stage name upper-cased and non-alphanumerics
/// replaced by `_`.
fn dependency_var(stage: &str) -> String {
    let suffix: String = stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("BERTH_DEP_{suffix}")
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl BuildBackend for CommandBuildBackend {
    async fn build(&self, request: &BuildRequest) -> berth_core::Result<Artifact> {
        self.run(request)
            .await
            .map_err(|e| e.into_build(&request.stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_var_is_shell_safe() {
        assert_eq!(dependency_var("deps"), "BERTH_DEP_DEPS");
        assert_eq!(dependency_var("web-app.v2"), "BERTH_DEP_WEB_APP_V2");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }
}
