use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::items::{Action, MouseButton, Point};

// ========================= Environment =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    LocalBrowser,
    ContainerDesktop,
    RemoteBrowser,
    RemoteDesktop,
    CloudSandbox,
}

impl EnvironmentKind {
    pub fn is_browser(self) -> bool {
        matches!(self, EnvironmentKind::LocalBrowser | EnvironmentKind::RemoteBrowser)
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentKind::LocalBrowser => "local browser",
            EnvironmentKind::ContainerDesktop => "container desktop",
            EnvironmentKind::RemoteBrowser => "remote browser",
            EnvironmentKind::RemoteDesktop => "remote desktop",
            EnvironmentKind::CloudSandbox => "cloud sandbox",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Active,
    Released,
}

/// How an adapter turns a scroll delta into backend events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollCapability {
    /// The backend takes the delta as-is.
    NativeDelta,
    /// The backend only knows unit wheel clicks; `step` is how much delta one click covers.
    UnitSteps { step: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub kind: EnvironmentKind,
    pub dimensions: (u32, u32),
    pub state: LifecycleState,
    pub scroll: ScrollCapability,
}

impl EnvironmentDescriptor {
    pub fn new(kind: EnvironmentKind, dimensions: (u32, u32), scroll: ScrollCapability) -> Self {
        Self { kind, dimensions, state: LifecycleState::Uninitialized, scroll }
    }

    /// Only honoured before the environment is active; dimensions are fixed afterwards.
    pub fn refine_dimensions(&mut self, dimensions: (u32, u32)) {
        if self.state == LifecycleState::Active {
            warn!(kind = %self.kind, "ignoring dimension change on an active environment");
            return;
        }
        self.dimensions = dimensions;
    }
}

// ========================= Errors =========================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputerError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("action failed: {0}")]
    Execution(String),
    #[error("action '{action}' is not supported by the {backend} backend")]
    Unsupported { action: String, backend: EnvironmentKind },
    #[error("cancelled")]
    Cancelled,
}

impl ComputerError {
    pub fn unsupported(action: &str, backend: EnvironmentKind) -> Self {
        ComputerError::Unsupported { action: action.to_string(), backend }
    }
}

// ========================= Contract =========================

/// Capability set every backend adapter implements. The turn executor only
/// ever talks to this trait.
#[async_trait]
pub trait Computer: Send {
    fn descriptor(&self) -> &EnvironmentDescriptor;

    async fn acquire(&mut self) -> Result<EnvironmentDescriptor, ComputerError>;
    /// Best-effort teardown. Safe after a partial acquire and safe to repeat.
    async fn release(&mut self) -> Result<(), ComputerError>;

    async fn screenshot(&mut self) -> Result<Vec<u8>, ComputerError>;
    async fn click(&mut self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError>;
    async fn double_click(&mut self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn scroll(&mut self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError>;
    async fn type_text(&mut self, text: &str) -> Result<(), ComputerError>;
    async fn keypress(&mut self, keys: &[String]) -> Result<(), ComputerError>;
    async fn move_to(&mut self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn drag(&mut self, path: &[Point]) -> Result<(), ComputerError>;
    async fn current_location(&mut self) -> Result<String, ComputerError>;

    async fn wait(&mut self, ms: u64) -> Result<(), ComputerError> {
        sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn goto(&mut self, _url: &str) -> Result<(), ComputerError> {
        Err(ComputerError::unsupported("goto", self.descriptor().kind))
    }

    async fn back(&mut self) -> Result<(), ComputerError> {
        Err(ComputerError::unsupported("back", self.descriptor().kind))
    }

    async fn forward(&mut self) -> Result<(), ComputerError> {
        Err(ComputerError::unsupported("forward", self.descriptor().kind))
    }

    async fn exec(&mut self, _command: &str) -> Result<String, ComputerError> {
        Err(ComputerError::unsupported("exec", self.descriptor().kind))
    }
}

/// Route an action to the matching contract method.
pub async fn perform(computer: &mut dyn Computer, action: &Action) -> Result<(), ComputerError> {
    match action {
        Action::Click { x, y, button } => computer.click(*x, *y, *button).await,
        Action::DoubleClick { x, y } => computer.double_click(*x, *y).await,
        Action::Scroll { x, y, scroll_x, scroll_y } => {
            computer.scroll(*x, *y, *scroll_x, *scroll_y).await
        }
        Action::Type { text } => computer.type_text(text).await,
        Action::Keypress { keys } => computer.keypress(keys).await,
        Action::Wait { ms } => computer.wait(*ms).await,
        Action::Move { x, y } => computer.move_to(*x, *y).await,
        Action::Drag { path } => computer.drag(path).await,
        Action::Screenshot => Ok(()),
        Action::Goto { url } => computer.goto(url).await,
        Action::Back => computer.back().await,
        Action::Forward => computer.forward().await,
        Action::Exec { command } => computer.exec(command).await.map(|_| ()),
        Action::Unknown { kind } => {
            Err(ComputerError::unsupported(kind, computer.descriptor().kind))
        }
    }
}

// ========================= Keys & Scroll =========================

pub fn xdotool_key(name: &str) -> &str {
    match name {
        "ENTER" => "Return",
        "LEFT" => "Left",
        "RIGHT" => "Right",
        "UP" => "Up",
        "DOWN" => "Down",
        "ESC" => "Escape",
        "SPACE" => "space",
        "BACKSPACE" => "BackSpace",
        "TAB" => "Tab",
        "CTRL" => "ctrl",
        "ALT" => "alt",
        "SHIFT" => "shift",
        "CMD" | "META" | "SUPER" => "super",
        other => other,
    }
}

pub fn dom_key(name: &str) -> &str {
    match name {
        "ENTER" => "Enter",
        "LEFT" => "ArrowLeft",
        "RIGHT" => "ArrowRight",
        "UP" => "ArrowUp",
        "DOWN" => "ArrowDown",
        "ESC" => "Escape",
        "SPACE" => " ",
        "BACKSPACE" => "Backspace",
        "TAB" => "Tab",
        "CTRL" => "Control",
        "ALT" => "Alt",
        "SHIFT" => "Shift",
        "CMD" | "META" | "SUPER" => "Meta",
        other => other,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Split a delta into unit events. Partial steps round up so nothing is dropped.
pub fn scroll_steps(dx: i64, dy: i64, step: u32) -> Vec<(ScrollDirection, u64)> {
    let step = u64::from(step.max(1));
    let count = |delta: i64| delta.unsigned_abs().div_ceil(step);
    let mut out = Vec::new();
    if dy != 0 {
        let dir = if dy < 0 { ScrollDirection::Up } else { ScrollDirection::Down };
        out.push((dir, count(dy)));
    }
    if dx != 0 {
        let dir = if dx < 0 { ScrollDirection::Left } else { ScrollDirection::Right };
        out.push((dir, count(dx)));
    }
    out
}

// ========================= Scoped acquisition =========================

/// Owns an acquired computer and guarantees it is released. Call
/// [`ScopedComputer::release`] on the normal path; dropping the guard while
/// still active spawns a best-effort release on the current runtime.
pub struct ScopedComputer {
    inner: Option<Box<dyn Computer>>,
}

impl ScopedComputer {
    pub async fn acquire(mut computer: Box<dyn Computer>) -> Result<Self, ComputerError> {
        match computer.acquire().await {
            Ok(desc) => {
                info!(kind = %desc.kind, width = desc.dimensions.0, height = desc.dimensions.1, "environment acquired");
                Ok(Self { inner: Some(computer) })
            }
            Err(err) => {
                warn!("acquire failed, releasing partial resources: {}", err);
                if let Err(e) = computer.release().await {
                    warn!("release after failed acquire: {}", e);
                }
                Err(err)
            }
        }
    }

    pub fn computer(&mut self) -> &mut dyn Computer {
        self.inner
            .as_deref_mut()
            .expect("computer is held until release consumes the guard")
    }

    pub async fn release(mut self) -> Result<(), ComputerError> {
        match self.inner.take() {
            Some(mut computer) => {
                let res = computer.release().await;
                info!(kind = %computer.descriptor().kind, "environment released");
                res
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScopedComputer {
    fn drop(&mut self) {
        let Some(mut computer) = self.inner.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(kind = %computer.descriptor().kind, "scope left without release; releasing in background");
                handle.spawn(async move {
                    if let Err(e) = computer.release().await {
                        warn!("background release failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("scope left without release and no runtime is available"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeComputer};

    #[test]
    fn key_table_maps_known_names_and_passes_others_through() {
        assert_eq!(xdotool_key("ENTER"), "Return");
        assert_eq!(xdotool_key("BACKSPACE"), "BackSpace");
        assert_eq!(xdotool_key("F5"), "F5");
        assert_eq!(dom_key("LEFT"), "ArrowLeft");
        assert_eq!(dom_key("a"), "a");
    }

    #[test]
    fn scroll_steps_use_magnitude_and_sign() {
        assert_eq!(scroll_steps(0, -3, 1), vec![(ScrollDirection::Up, 3)]);
        assert_eq!(scroll_steps(0, 2, 1), vec![(ScrollDirection::Down, 2)]);
        assert_eq!(
            scroll_steps(4, 0, 1),
            vec![(ScrollDirection::Right, 4)]
        );
        assert!(scroll_steps(0, 0, 1).is_empty());
    }

    #[test]
    fn scroll_steps_round_partial_steps_up() {
        assert_eq!(scroll_steps(0, 250, 100), vec![(ScrollDirection::Down, 3)]);
        assert_eq!(scroll_steps(0, -100, 100), vec![(ScrollDirection::Up, 1)]);
    }

    #[test]
    fn dimensions_are_frozen_once_active() {
        let mut d = EnvironmentDescriptor::new(
            EnvironmentKind::CloudSandbox,
            (1280, 720),
            ScrollCapability::UnitSteps { step: 1 },
        );
        d.refine_dimensions((1920, 1080));
        d.state = LifecycleState::Active;
        d.refine_dimensions((800, 600));
        assert_eq!(d.dimensions, (1920, 1080));
    }

    #[tokio::test]
    async fn unknown_action_is_unsupported() {
        let mut fake = FakeComputer::new();
        let err = perform(&mut fake, &Action::Unknown { kind: "teleport".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ComputerError::Unsupported { .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_acquire_still_releases() {
        let fake = FakeComputer::new().failing_acquire();
        let log = fake.log();
        let res = ScopedComputer::acquire(Box::new(fake)).await;
        assert!(matches!(res, Err(ComputerError::Provisioning(_))));
        assert_eq!(log.lock().unwrap().as_slice(), &[Call::Acquire, Call::Release]);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mut fake = FakeComputer::new();
        fake.acquire().await.unwrap();
        fake.release().await.unwrap();
        fake.release().await.unwrap();
        assert_eq!(fake.descriptor().state, LifecycleState::Released);
        assert_eq!(fake.teardowns(), 1);
    }
}
