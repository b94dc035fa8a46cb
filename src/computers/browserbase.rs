use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::cdp::{BrowserEndpoint, BrowserProvider};
use crate::computer::EnvironmentKind;

const API_BASE: &str = "https://api.browserbase.com/v1";

#[derive(Deserialize)]
struct Session {
    id: String,
    #[serde(rename = "connectUrl")]
    connect_url: String,
}

/// Hosted browser session, released on teardown.
pub struct BrowserbaseProvider {
    http: Client,
    api_key: String,
    project_id: String,
    session_id: Option<String>,
}

impl BrowserbaseProvider {
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> anyhow::Result<Self> {
        let (api_key, project_id) = (api_key.into(), project_id.into());
        if api_key.trim().is_empty() || project_id.trim().is_empty() {
            bail!("BROWSERBASE_API_KEY and BROWSERBASE_PROJECT_ID are required");
        }
        Ok(Self { http: Client::new(), api_key, project_id, session_id: None })
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(format!("{API_BASE}/{path}"))
            .header("X-BB-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Browserbase error {}: {}", status, text);
        }
        Ok(text)
    }

    fn session_body(&self, viewport: (u32, u32)) -> Value {
        json!({
            "projectId": self.project_id,
            "browserSettings": {
                "viewport": { "width": viewport.0, "height": viewport.1 }
            }
        })
    }
}

#[async_trait]
impl BrowserProvider for BrowserbaseProvider {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::RemoteBrowser
    }

    async fn provision(&mut self, viewport: (u32, u32)) -> anyhow::Result<BrowserEndpoint> {
        let text = self.post("sessions", &self.session_body(viewport)).await?;
        let session: Session = serde_json::from_str(&text).context("bad session JSON")?;
        info!(id = %session.id, "Browserbase session created");
        self.session_id = Some(session.id);
        Ok(BrowserEndpoint::Connect { ws_url: session.connect_url })
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.session_id.take() else { return Ok(()) };
        let body = json!({ "projectId": self.project_id, "status": "REQUEST_RELEASE" });
        self.post(&format!("sessions/{id}"), &body).await?;
        info!(%id, "Browserbase session released");
        Ok(())
    }
}
