use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::cdp::{BrowserEndpoint, BrowserProvider};
use super::xdotool::DesktopHost;
use crate::computer::EnvironmentKind;

const API_BASE: &str = "https://api.scrapybara.com/v1";

#[derive(Deserialize)]
struct Instance {
    id: String,
}

#[derive(Deserialize)]
struct BashReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct BrowserReply {
    cdp_url: String,
}

/// Thin client for the hosted instance API, shared by both adapters.
struct Instances {
    http: Client,
    api_base: String,
    api_key: String,
    id: Option<String>,
}

impl Instances {
    fn new(api_key: String) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            bail!("SCRAPYBARA_API_KEY is not set");
        }
        Ok(Self { http: Client::new(), api_base: API_BASE.into(), api_key, id: None })
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(format!("{}/{}", self.api_base, path))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Scrapybara error {}: {}", status, text);
        }
        Ok(text)
    }

    fn id(&self) -> anyhow::Result<&str> {
        self.id.as_deref().context("instance not started")
    }

    async fn start(&mut self, instance_type: &str) -> anyhow::Result<&str> {
        info!(instance_type, "starting Scrapybara instance");
        let text = self.post("start", json!({ "instance_type": instance_type })).await?;
        let inst: Instance = serde_json::from_str(&text).context("bad instance JSON")?;
        Ok(self.id.insert(inst.id).as_str())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.id.take() else { return Ok(()) };
        info!(%id, "stopping Scrapybara instance");
        self.post(&format!("instance/{id}/stop"), json!({})).await?;
        Ok(())
    }
}

/// Ubuntu desktop instance driven through its bash endpoint.
pub struct ScrapybaraDesktop {
    api: Instances,
}

impl ScrapybaraDesktop {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self { api: Instances::new(api_key.into())? })
    }
}

#[async_trait]
impl DesktopHost for ScrapybaraDesktop {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::RemoteDesktop
    }

    async fn provision(&mut self) -> anyhow::Result<()> {
        self.api.start("ubuntu").await?;
        Ok(())
    }

    async fn exec(&self, command: &str) -> anyhow::Result<String> {
        let id = self.api.id()?;
        let text = self
            .api
            .post(&format!("instance/{id}/bash"), json!({ "command": command }))
            .await?;
        let reply: BashReply = serde_json::from_str(&text).context("bad bash JSON")?;
        match reply.error {
            Some(err) if !err.is_empty() => bail!("command failed: {}", err),
            _ => Ok(reply.output),
        }
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.api.stop().await
    }
}

/// Browser instance reached over the CDP URL it hands back.
pub struct ScrapybaraBrowser {
    api: Instances,
}

impl ScrapybaraBrowser {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self { api: Instances::new(api_key.into())? })
    }
}

#[async_trait]
impl BrowserProvider for ScrapybaraBrowser {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::RemoteBrowser
    }

    async fn provision(&mut self, _viewport: (u32, u32)) -> anyhow::Result<BrowserEndpoint> {
        let id = self.api.start("browser").await?.to_string();
        let text = self.api.post(&format!("instance/{id}/browser/start"), json!({})).await?;
        let reply: BrowserReply = serde_json::from_str(&text).context("bad browser JSON")?;
        Ok(BrowserEndpoint::Connect { ws_url: reply.cdp_url })
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.api.stop().await
    }
}
