use anyhow::{bail, Context};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use super::xdotool::DesktopHost;
use crate::computer::EnvironmentKind;

/// Attaches to an already running container with an X display inside.
pub struct DockerHost {
    container: String,
    docker: Option<Docker>,
}

impl DockerHost {
    pub fn new(container: impl Into<String>) -> Self {
        Self { container: container.into(), docker: None }
    }

    fn client(&self) -> anyhow::Result<&Docker> {
        self.docker.as_ref().context("docker client not connected")
    }
}

#[async_trait]
impl DesktopHost for DockerHost {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::ContainerDesktop
    }

    async fn provision(&mut self) -> anyhow::Result<()> {
        let docker = Docker::connect_with_local_defaults().context("docker daemon unreachable")?;
        let inspect = docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("container '{}' not found", self.container))?;
        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        if !running {
            bail!("container '{}' is not running", self.container);
        }
        info!(container = %self.container, "attached to container");
        self.docker = Some(docker);
        Ok(())
    }

    async fn exec(&self, command: &str) -> anyhow::Result<String> {
        let docker = self.client()?;
        let exec = docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("exec create failed")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            docker.start_exec(&exec.id, None).await.context("exec start failed")?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let inspect = docker.inspect_exec(&exec.id).await.context("exec inspect failed")?;
        match inspect.exit_code {
            Some(0) | None => Ok(stdout),
            Some(code) => {
                debug!(code, stderr = %stderr.trim(), "container command failed");
                bail!("command exited with {}: {}", code, stderr.trim())
            }
        }
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        // the container outlives the session; just drop the connection
        self.docker = None;
        Ok(())
    }
}
