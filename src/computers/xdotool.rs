use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::computer::{
    scroll_steps, xdotool_key, Computer, ComputerError, EnvironmentDescriptor, EnvironmentKind,
    LifecycleState, ScrollCapability, ScrollDirection,
};
use crate::items::{MouseButton, Point};

/// A shell on the machine that hosts the X display.
#[async_trait]
pub trait DesktopHost: Send + Sync {
    fn kind(&self) -> EnvironmentKind;
    /// Create or attach to the machine. `teardown` runs even when this fails.
    async fn provision(&mut self) -> anyhow::Result<()>;
    /// Run a shell command and return its stdout.
    async fn exec(&self, command: &str) -> anyhow::Result<String>;
    async fn teardown(&mut self) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct DesktopConfig {
    pub display: String,
    pub screen: (u32, u32),
    /// apt-get the X tooling before first use.
    pub install_tools: bool,
    /// Start Xvfb and a window manager when none is running.
    pub start_display: bool,
    pub scroll_step: u32,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            display: ":99".into(),
            screen: (1280, 720),
            install_tools: false,
            start_display: false,
            scroll_step: 1,
        }
    }
}

pub struct XdotoolComputer<H: DesktopHost> {
    host: H,
    cfg: DesktopConfig,
    desc: EnvironmentDescriptor,
}

impl<H: DesktopHost> XdotoolComputer<H> {
    pub fn new(host: H, cfg: DesktopConfig) -> Self {
        let desc = EnvironmentDescriptor::new(
            host.kind(),
            cfg.screen,
            ScrollCapability::UnitSteps { step: cfg.scroll_step.max(1) },
        );
        Self { host, cfg, desc }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    async fn xdo(&self, args: &str) -> Result<String, ComputerError> {
        self.run(&format!("DISPLAY={} xdotool {}", self.cfg.display, args))
            .await
    }

    async fn run(&self, cmd: &str) -> Result<String, ComputerError> {
        if self.desc.state != LifecycleState::Active {
            return Err(ComputerError::Execution(format!("{} is not active", self.desc.kind)));
        }
        debug!(cmd, "exec");
        self.host
            .exec(cmd)
            .await
            .map_err(|e| ComputerError::Execution(e.to_string()))
    }

    async fn prepare(&mut self) -> anyhow::Result<()> {
        self.host.provision().await?;
        let display = &self.cfg.display;
        if self.cfg.install_tools {
            info!("installing X tooling");
            self.host
                .exec("apt-get update && apt-get install -y imagemagick xdotool x11-utils")
                .await?;
        }
        if self.cfg.start_display {
            let (w, h) = self.cfg.screen;
            // bracketed so the check never matches the shell running it
            let running = self.host.exec(&format!("pgrep -f '[X]vfb {display}' || true")).await?;
            if running.trim().is_empty() {
                info!(display = %self.cfg.display, "starting Xvfb");
                self.host
                    .exec(&format!("nohup Xvfb {display} -screen 0 {w}x{h}x24 >/dev/null 2>&1 &"))
                    .await?;
            }
            let wm = self.host.exec("pgrep -x fluxbox || true").await?;
            if wm.trim().is_empty() {
                self.host
                    .exec(&format!("DISPLAY={display} nohup fluxbox >/dev/null 2>&1 &"))
                    .await?;
            }
        }
        let geometry = self
            .host
            .exec(&format!("DISPLAY={display} xdotool getdisplaygeometry"))
            .await?;
        match parse_geometry(&geometry) {
            Some(dims) => self.desc.refine_dimensions(dims),
            None => warn!(reply = %geometry.trim(), "unreadable display geometry, keeping {:?}", self.desc.dimensions),
        }
        Ok(())
    }
}

#[async_trait]
impl<H: DesktopHost> Computer for XdotoolComputer<H> {
    fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.desc
    }

    async fn acquire(&mut self) -> Result<EnvironmentDescriptor, ComputerError> {
        if self.desc.state != LifecycleState::Uninitialized {
            return Err(ComputerError::Provisioning(format!(
                "{} already {:?}",
                self.desc.kind, self.desc.state
            )));
        }
        self.prepare()
            .await
            .map_err(|e| ComputerError::Provisioning(e.to_string()))?;
        self.desc.state = LifecycleState::Active;
        info!(kind = %self.desc.kind, display = %self.cfg.display, dims = ?self.desc.dimensions, "desktop ready");
        Ok(self.desc.clone())
    }

    async fn release(&mut self) -> Result<(), ComputerError> {
        if self.desc.state == LifecycleState::Released {
            return Ok(());
        }
        self.desc.state = LifecycleState::Released;
        // hosts only undo what they actually created
        if let Err(e) = self.host.teardown().await {
            warn!(kind = %self.desc.kind, "desktop teardown: {}", e);
        }
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ComputerError> {
        let out = self
            .run(&format!(
                "export DISPLAY={} && import -window root png:- | base64 -w 0",
                self.cfg.display
            ))
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        B64.decode(out.trim())
            .map_err(|e| ComputerError::Capture(format!("screenshot is not base64: {e}")))
    }

    async fn click(&mut self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.xdo(&format!("mousemove {x} {y} click {}", button_number(button)))
            .await
            .map(drop)
    }

    async fn double_click(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.xdo(&format!("mousemove {x} {y} click --repeat 2 1"))
            .await
            .map(drop)
    }

    async fn scroll(&mut self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        let step = match self.desc.scroll {
            ScrollCapability::UnitSteps { step } => step,
            ScrollCapability::NativeDelta => 1,
        };
        self.xdo(&format!("mousemove {x} {y}")).await?;
        for (dir, count) in scroll_steps(dx, dy, step) {
            let button = match dir {
                ScrollDirection::Up => 4,
                ScrollDirection::Down => 5,
                ScrollDirection::Left => 6,
                ScrollDirection::Right => 7,
            };
            for _ in 0..count {
                self.xdo(&format!("click {button}")).await?;
            }
        }
        Ok(())
    }

    async fn type_text(&mut self, text: &str) -> Result<(), ComputerError> {
        let safe = text.replace('\'', "'\\''");
        self.xdo(&format!("type -- '{safe}'")).await.map(drop)
    }

    async fn keypress(&mut self, keys: &[String]) -> Result<(), ComputerError> {
        if keys.is_empty() {
            return Ok(());
        }
        let combo = keys.iter().map(|k| xdotool_key(k)).collect::<Vec<_>>().join("+");
        self.xdo(&format!("key {combo}")).await.map(drop)
    }

    async fn move_to(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.xdo(&format!("mousemove {x} {y}")).await.map(drop)
    }

    async fn drag(&mut self, path: &[Point]) -> Result<(), ComputerError> {
        let Some((first, rest)) = path.split_first() else { return Ok(()) };
        self.xdo(&format!("mousemove {} {} mousedown 1", first.x, first.y))
            .await?;
        for p in rest {
            self.xdo(&format!("mousemove {} {}", p.x, p.y)).await?;
        }
        self.xdo("mouseup 1").await.map(drop)
    }

    async fn current_location(&mut self) -> Result<String, ComputerError> {
        Ok(String::new())
    }

    async fn exec(&mut self, command: &str) -> Result<String, ComputerError> {
        self.run(&format!("export DISPLAY={} && {}", self.cfg.display, command))
            .await
    }
}

fn button_number(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 3,
        MouseButton::Back => 8,
        MouseButton::Forward => 9,
    }
}

fn parse_geometry(reply: &str) -> Option<(u32, u32)> {
    let mut parts = reply.split_whitespace();
    let w = parts.next()?.parse().ok()?;
    let h = parts.next()?.parse().ok()?;
    Some((w, h))
}
