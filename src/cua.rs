use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::env;
use tracing::{debug, warn};

use crate::computer::{EnvironmentDescriptor, EnvironmentKind};
use crate::items::{Action, CallOutcome, Item, PendingSafetyCheck};

/// The language model seen from the loop: full conversation in, proposed items out.
#[async_trait]
pub trait Model: Send + Sync {
    async fn respond(&self, env: &EnvironmentDescriptor, conversation: &[Item]) -> Result<Vec<Item>>;
}

#[derive(Clone)]
pub struct ResponsesConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub model: String,         // e.g. "computer-use-preview"
    pub instructions: Option<String>,
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_CUA_MODEL").unwrap_or_else(|_| "computer-use-preview".into()),
            instructions: None,
        }
    }
}

#[derive(Clone)]
pub struct ResponsesModel {
    http: Client,
    cfg: ResponsesConfig,
}

impl ResponsesModel {
    pub fn new(cfg: ResponsesConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    fn request_body(&self, env: &EnvironmentDescriptor, conversation: &[Item]) -> Value {
        let mut req = json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "input": encode_input(conversation),
            "tools": [{
                "type": "computer_use_preview",
                "display_width": env.dimensions.0,
                "display_height": env.dimensions.1,
                "environment": tool_environment(env.kind),
            }],
        });
        if let Some(instructions) = &self.cfg.instructions {
            req["instructions"] = Value::String(instructions.clone());
        }
        req
    }
}

#[async_trait]
impl Model for ResponsesModel {
    async fn respond(&self, env: &EnvironmentDescriptor, conversation: &[Item]) -> Result<Vec<Item>> {
        let url = format!("{}/responses", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.request_body(env, conversation))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model endpoint error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse model response JSON")?;
        parse_output(&v)
    }
}

fn tool_environment(kind: EnvironmentKind) -> &'static str {
    if kind.is_browser() {
        "browser"
    } else {
        "linux"
    }
}

// ========================= Decoding =========================

pub fn parse_output(v: &Value) -> Result<Vec<Item>> {
    let outputs = v
        .get("output")
        .and_then(|x| x.as_array())
        .context("response has no output array")?;

    let mut items = Vec::with_capacity(outputs.len());
    for o in outputs {
        let id = o.get("id").and_then(|x| x.as_str()).map(str::to_string);
        match o.get("type").and_then(|x| x.as_str()).unwrap_or_default() {
            "message" => {
                let text = o
                    .get("content")
                    .and_then(|x| x.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                items.push(Item::Message { id, text });
            }
            "reasoning" => {
                let summary = o
                    .get("summary")
                    .and_then(|x| x.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                items.push(Item::Reasoning { id, summary });
            }
            "computer_call" => {
                let call_id = o
                    .get("call_id")
                    .and_then(|x| x.as_str())
                    .context("computer_call without call_id")?
                    .to_string();
                let action = o.get("action").map(decode_action).unwrap_or(Action::Unknown {
                    kind: "missing".into(),
                });
                let pending_safety_checks = o
                    .get("pending_safety_checks")
                    .cloned()
                    .map(serde_json::from_value::<Vec<PendingSafetyCheck>>)
                    .transpose()
                    .context("malformed pending_safety_checks")?
                    .unwrap_or_default();
                items.push(Item::ComputerCall { id, call_id, action, pending_safety_checks });
            }
            other => warn!("ignoring output item of type {:?}", other),
        }
    }
    debug!(count = items.len(), "decoded model output");
    Ok(items)
}

fn decode_action(v: &Value) -> Action {
    match serde_json::from_value::<Action>(v.clone()) {
        Ok(action) => action,
        Err(e) => {
            let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("unknown").to_string();
            debug!(%kind, "undecodable action: {}", e);
            Action::Unknown { kind }
        }
    }
}

// ========================= Encoding =========================

/// Calls that never produced a screenshot are replayed to the model as plain
/// user text, since a computer_call_output must carry an image.
pub fn encode_input(conversation: &[Item]) -> Vec<Value> {
    let unobserved: HashSet<&str> = conversation
        .iter()
        .filter_map(|i| match i {
            Item::ComputerCallOutput { call_id, outcome, .. }
                if !matches!(outcome, CallOutcome::Observed { .. }) =>
            {
                Some(call_id.as_str())
            }
            _ => None,
        })
        .collect();
    let is_unobserved_call = |item: Option<&Item>| {
        matches!(item, Some(Item::ComputerCall { call_id, .. }) if unobserved.contains(call_id.as_str()))
    };

    let mut out = Vec::with_capacity(conversation.len());
    for (idx, item) in conversation.iter().enumerate() {
        match item {
            Item::User { content } => out.push(json!({ "role": "user", "content": content })),
            Item::Message { id, text } => {
                let mut m = json!({
                    "type": "message",
                    "role": "assistant",
                    "content": [{ "type": "output_text", "text": text }],
                });
                if let Some(id) = id {
                    m["id"] = Value::String(id.clone());
                }
                out.push(m);
            }
            Item::Reasoning { id, summary } => {
                // reasoning must be followed by the item it produced
                if is_unobserved_call(conversation.get(idx + 1)) {
                    continue;
                }
                let Some(id) = id else { continue };
                let summary: Vec<Value> = summary
                    .iter()
                    .map(|s| json!({ "type": "summary_text", "text": s }))
                    .collect();
                out.push(json!({ "type": "reasoning", "id": id, "summary": summary }));
            }
            Item::ComputerCall { id, call_id, action, pending_safety_checks } => {
                if unobserved.contains(call_id.as_str()) {
                    continue;
                }
                let mut c = json!({
                    "type": "computer_call",
                    "call_id": call_id,
                    "action": action,
                    "pending_safety_checks": pending_safety_checks,
                    "status": "completed",
                });
                if let Some(id) = id {
                    c["id"] = Value::String(id.clone());
                }
                out.push(c);
            }
            Item::ComputerCallOutput { call_id, acknowledged_safety_checks, outcome } => match outcome {
                CallOutcome::Observed { screenshot_base64, current_url } => {
                    let mut o = json!({
                        "type": "computer_call_output",
                        "call_id": call_id,
                        "acknowledged_safety_checks": acknowledged_safety_checks,
                        "output": {
                            "type": "input_image",
                            "image_url": format!("data:image/png;base64,{}", screenshot_base64),
                        },
                    });
                    if !current_url.is_empty() {
                        o["output"]["current_url"] = Value::String(current_url.clone());
                    }
                    out.push(o);
                }
                CallOutcome::Failed { error } => out.push(json!({
                    "role": "user",
                    "content": format!("Computer action {} failed: {}", call_id, error),
                })),
                CallOutcome::Rejected { message } => out.push(json!({
                    "role": "user",
                    "content": format!("Computer action {} was not executed: {}", call_id, message),
                })),
            },
        }
    }
    out
}
