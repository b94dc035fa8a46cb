use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::xdotool::DesktopHost;
use crate::computer::EnvironmentKind;

#[derive(Clone, Debug)]
pub struct DaytonaConfig {
    pub api_key: String,
    pub server_url: String,
    pub target: String,
    pub workspace_name: String,
    pub image: String,
    pub display: String,
    /// Minutes of inactivity before the workspace stops; 0 disables.
    pub auto_stop_interval: u32,
}

impl DaytonaConfig {
    pub fn new(api_key: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            server_url: server_url.into(),
            target: "us".into(),
            workspace_name: "cua-sandbox".into(),
            image: "nikodaytona/ubuntu-vnc-firefox:1.0.0".into(),
            display: ":99".into(),
            auto_stop_interval: 30,
        }
    }
}

#[derive(Deserialize)]
struct Workspace {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
struct ExecReply {
    #[serde(rename = "exitCode", default)]
    exit_code: i64,
    #[serde(default)]
    result: String,
}

/// A Daytona workspace created for the session and removed afterwards.
pub struct DaytonaHost {
    http: Client,
    cfg: DaytonaConfig,
    workspace_id: Option<String>,
}

impl DaytonaHost {
    pub fn new(cfg: DaytonaConfig) -> anyhow::Result<Self> {
        if cfg.api_key.trim().is_empty() || cfg.server_url.trim().is_empty() {
            bail!("Daytona API key and server URL are required");
        }
        Ok(Self { http: Client::new(), cfg, workspace_id: None })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.server_url.trim_end_matches('/'), path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> anyhow::Result<String> {
        let resp = req.bearer_auth(&self.cfg.api_key).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Daytona error {}: {}", status, text);
        }
        Ok(text)
    }

    async fn wait_started(&self, id: &str) -> anyhow::Result<()> {
        for _ in 0..60 {
            let text = self.send(self.http.get(self.url(&format!("workspace/{id}")))).await?;
            let ws: Workspace = serde_json::from_str(&text).context("bad workspace JSON")?;
            match ws.state.as_deref() {
                Some("started") | None => return Ok(()),
                Some("error") => bail!("workspace {} failed to start", id),
                Some(other) => debug!(state = other, "waiting for workspace"),
            }
            sleep(Duration::from_secs(1)).await;
        }
        bail!("workspace {} did not start in time", id)
    }

    fn create_body(&self) -> Value {
        json!({
            "name": self.cfg.workspace_name,
            "image": self.cfg.image,
            "target": self.cfg.target,
            "env": { "DISPLAY": self.cfg.display },
            "resources": { "cpu": 2, "memory": 4, "disk": 10 },
            "autoStopInterval": self.cfg.auto_stop_interval,
        })
    }
}

#[async_trait]
impl DesktopHost for DaytonaHost {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::CloudSandbox
    }

    async fn provision(&mut self) -> anyhow::Result<()> {
        info!(name = %self.cfg.workspace_name, "creating Daytona workspace");
        let text = self
            .send(self.http.post(self.url("workspace")).json(&self.create_body()))
            .await?;
        let ws: Workspace = serde_json::from_str(&text).context("bad workspace JSON")?;
        // recorded before waiting so a failed start is still removed
        self.workspace_id = Some(ws.id.clone());
        self.wait_started(&ws.id).await
    }

    async fn exec(&self, command: &str) -> anyhow::Result<String> {
        let id = self.workspace_id.as_deref().context("workspace not initialized")?;
        let text = self
            .send(
                self.http
                    .post(self.url(&format!("toolbox/{id}/toolbox/process/execute")))
                    .json(&json!({ "command": format!("sh -c {}", shell_quote(command)) })),
            )
            .await?;
        let reply: ExecReply = serde_json::from_str(&text).context("bad exec JSON")?;
        if reply.exit_code != 0 {
            warn!(code = reply.exit_code, "sandbox command failed");
            bail!("command exited with {}: {}", reply.exit_code, reply.result.trim());
        }
        Ok(reply.result)
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.workspace_id.take() else { return Ok(()) };
        info!(%id, "removing Daytona workspace");
        self.send(self.http.delete(self.url(&format!("workspace/{id}"))).query(&[("force", "true")]))
            .await?;
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_credentials() {
        assert!(DaytonaHost::new(DaytonaConfig::new("", "https://daytona.example")).is_err());
        assert!(DaytonaHost::new(DaytonaConfig::new("key", " ")).is_err());
        assert!(DaytonaHost::new(DaytonaConfig::new("key", "https://daytona.example")).is_ok());
    }

    #[test]
    fn workspace_request_carries_display_and_resources() {
        let host = DaytonaHost::new(DaytonaConfig::new("key", "https://daytona.example/api/")).unwrap();
        let body = host.create_body();
        assert_eq!(body["env"]["DISPLAY"], ":99");
        assert_eq!(body["resources"]["memory"], 4);
        assert_eq!(body["target"], "us");
        assert_eq!(host.url("workspace"), "https://daytona.example/api/workspace");
    }

    #[tokio::test]
    async fn teardown_without_workspace_is_a_noop() {
        let mut host = DaytonaHost::new(DaytonaConfig::new("key", "http://127.0.0.1:9")).unwrap();
        host.teardown().await.unwrap();
        assert!(host.exec("true").await.is_err());
    }

    #[test]
    fn commands_are_single_quoted() {
        assert_eq!(shell_quote("echo 'hi'"), r#"'echo '\''hi'\'''"#);
    }
}
