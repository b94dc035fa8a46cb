//! Recording fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::computer::{
    Computer, ComputerError, EnvironmentDescriptor, EnvironmentKind, LifecycleState,
    ScrollCapability,
};
use crate::cua::Model;
use crate::items::{Action, Item, MouseButton, Point};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Acquire,
    Release,
    Screenshot,
    Location,
    Click(i64, i64, MouseButton),
    DoubleClick(i64, i64),
    Scroll(i64, i64, i64, i64),
    Type(String),
    Keypress(Vec<String>),
    Wait(u64),
    Move(i64, i64),
    Drag(Vec<Point>),
    Goto(String),
}

pub struct FakeComputer {
    desc: EnvironmentDescriptor,
    log: Arc<Mutex<Vec<Call>>>,
    fail_acquire: bool,
    fail_kind: Option<&'static str>,
    teardowns: usize,
    url: String,
}

impl FakeComputer {
    pub fn new() -> Self {
        Self {
            desc: EnvironmentDescriptor::new(
                EnvironmentKind::ContainerDesktop,
                (1280, 720),
                ScrollCapability::UnitSteps { step: 1 },
            ),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_acquire: false,
            fail_kind: None,
            teardowns: 0,
            url: String::new(),
        }
    }

    pub fn browser() -> Self {
        let mut fake = Self::new();
        fake.desc.kind = EnvironmentKind::LocalBrowser;
        fake.desc.scroll = ScrollCapability::NativeDelta;
        fake.url = "about:blank".into();
        fake
    }

    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    /// Make every action of the given kind fail with an execution error.
    pub fn failing_on(mut self, kind: &'static str) -> Self {
        self.fail_kind = Some(kind);
        self
    }

    pub fn log(&self) -> Arc<Mutex<Vec<Call>>> {
        self.log.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns
    }

    fn record(&self, call: Call, kind: &str) -> Result<(), ComputerError> {
        self.log.lock().unwrap().push(call);
        if self.fail_kind == Some(kind) {
            return Err(ComputerError::Execution(format!("{kind} exploded")));
        }
        Ok(())
    }
}

#[async_trait]
impl Computer for FakeComputer {
    fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.desc
    }

    async fn acquire(&mut self) -> Result<EnvironmentDescriptor, ComputerError> {
        self.log.lock().unwrap().push(Call::Acquire);
        if self.fail_acquire {
            return Err(ComputerError::Provisioning("no capacity".into()));
        }
        self.desc.state = LifecycleState::Active;
        Ok(self.desc.clone())
    }

    async fn release(&mut self) -> Result<(), ComputerError> {
        if self.desc.state == LifecycleState::Released {
            return Ok(());
        }
        self.log.lock().unwrap().push(Call::Release);
        self.teardowns += 1;
        self.desc.state = LifecycleState::Released;
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ComputerError> {
        self.record(Call::Screenshot, "screenshot")
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        Ok(b"png".to_vec())
    }

    async fn click(&mut self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.record(Call::Click(x, y, button), "click")
    }

    async fn double_click(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.record(Call::DoubleClick(x, y), "double_click")
    }

    async fn scroll(&mut self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        self.record(Call::Scroll(x, y, dx, dy), "scroll")
    }

    async fn type_text(&mut self, text: &str) -> Result<(), ComputerError> {
        self.record(Call::Type(text.to_string()), "type")
    }

    async fn keypress(&mut self, keys: &[String]) -> Result<(), ComputerError> {
        self.record(Call::Keypress(keys.to_vec()), "keypress")
    }

    async fn wait(&mut self, ms: u64) -> Result<(), ComputerError> {
        self.record(Call::Wait(ms), "wait")?;
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn move_to(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.record(Call::Move(x, y), "move")
    }

    async fn drag(&mut self, path: &[Point]) -> Result<(), ComputerError> {
        self.record(Call::Drag(path.to_vec()), "drag")
    }

    async fn current_location(&mut self) -> Result<String, ComputerError> {
        self.log.lock().unwrap().push(Call::Location);
        Ok(self.url.clone())
    }

    async fn goto(&mut self, url: &str) -> Result<(), ComputerError> {
        if !self.desc.kind.is_browser() {
            return Err(ComputerError::unsupported("goto", self.desc.kind));
        }
        self.record(Call::Goto(url.to_string()), "goto")?;
        self.url = url.to_string();
        Ok(())
    }
}

/// Replays canned model responses in order; an exhausted script answers with a plain message.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Vec<Item>>>,
    seen: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Vec<Item>>) -> Self {
        Self { responses: Mutex::new(responses.into()), seen: Mutex::new(Vec::new()) }
    }

    /// Conversation length observed by each model call.
    pub fn seen(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    async fn respond(
        &self,
        _env: &EnvironmentDescriptor,
        conversation: &[Item],
    ) -> anyhow::Result<Vec<Item>> {
        self.seen.lock().unwrap().push(conversation.len());
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| vec![message("done")]))
    }
}

pub fn call(call_id: &str, action: Action) -> Item {
    Item::ComputerCall { id: None, call_id: call_id.into(), action, pending_safety_checks: vec![] }
}

pub fn message(text: &str) -> Item {
    Item::Message { id: None, text: text.into() }
}
