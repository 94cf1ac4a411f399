//! Health prober for `command`, `http` and `tcp` checks.

use std::process::Stdio;

use async_trait::async_trait;
use berth_core::{HealthCheck, HealthProber};
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::error::{BackendError, Result};

pub struct CompositeHealthProber {
    http: reqwest::Client,
}

impl CompositeHealthProber {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    async fn check(&self, check: &HealthCheck) -> Result<()> {
        match check {
            HealthCheck::Command { argv } => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| BackendError::EmptyCommand("health check".to_string()))?;
                let output = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output()
                    .await?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(BackendError::CommandFailed {
                        program: program.clone(),
                        status: output.status.to_string(),
                        detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    })
                }
            }
            HealthCheck::Http { url } => {
                let response = self.http.get(url).send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(BackendError::Http(format!("{url} returned {status}")))
                }
            }
            HealthCheck::Tcp { address } => {
                TcpStream::connect(address.as_str()).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HealthProber for CompositeHealthProber {
    async fn probe(&self, service: &str, check: &HealthCheck) -> berth_core::Result<()> {
        self.check(check).await.map_err(|e| e.into_health(service))
    }
}
