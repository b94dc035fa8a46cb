use anyhow::anyhow;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::computer::{
    dom_key, Computer, ComputerError, EnvironmentDescriptor, EnvironmentKind, LifecycleState,
    ScrollCapability,
};
use crate::items::{MouseButton, Point};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub start_url: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 720), start_url: None }
    }
}

/// Where the Chromium instance comes from.
pub enum BrowserEndpoint {
    Launch { headless: bool },
    Connect { ws_url: String },
}

/// Supplies and disposes of a browser for [`CdpComputer`].
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    fn kind(&self) -> EnvironmentKind;
    async fn provision(&mut self, viewport: (u32, u32)) -> anyhow::Result<BrowserEndpoint>;
    async fn teardown(&mut self) -> anyhow::Result<()>;
}

pub struct LocalChromium {
    headless: bool,
}

impl LocalChromium {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

#[async_trait]
impl BrowserProvider for LocalChromium {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::LocalBrowser
    }

    async fn provision(&mut self, _viewport: (u32, u32)) -> anyhow::Result<BrowserEndpoint> {
        Ok(BrowserEndpoint::Launch { headless: self.headless })
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct CdpSession {
    browser: OxideBrowser,
    page: Page,
    handler: JoinHandle<()>,
}

/// A computer driven over the Chrome DevTools Protocol.
pub struct CdpComputer<P: BrowserProvider> {
    provider: P,
    cfg: BrowserConfig,
    desc: EnvironmentDescriptor,
    session: Option<CdpSession>,
    /// Scratch profile of a locally launched browser, removed on release.
    profile_dir: Option<PathBuf>,
}

impl<P: BrowserProvider> CdpComputer<P> {
    pub fn new(provider: P, cfg: BrowserConfig) -> Self {
        let desc = EnvironmentDescriptor::new(provider.kind(), cfg.viewport, ScrollCapability::NativeDelta);
        Self { provider, cfg, desc, session: None, profile_dir: None }
    }

    fn page(&self) -> Result<&Page, ComputerError> {
        self.session
            .as_ref()
            .map(|s| &s.page)
            .ok_or_else(|| ComputerError::Execution("browser is not acquired".into()))
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let endpoint = self.provider.provision(self.cfg.viewport).await?;
        let (browser, mut handler) = match endpoint {
            BrowserEndpoint::Launch { headless } => {
                let mut builder = chromiumoxide::browser::BrowserConfig::builder();
                if !headless {
                    builder = builder.with_head();
                }
                // unique profile per launch, Chromium locks the profile dir
                let mut profile_dir: PathBuf = std::env::temp_dir();
                profile_dir.push(format!("cua-profile-{}-{}", std::process::id(), nanoid::nanoid!(8)));
                std::fs::create_dir_all(&profile_dir)?;
                self.profile_dir = Some(profile_dir.clone());
                builder = builder
                    .user_data_dir(profile_dir)
                    .window_size(self.cfg.viewport.0, self.cfg.viewport.1)
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check")
                    .arg("--disable-extensions")
                    .arg("--disable-file-system");
                let bcfg = builder.build().map_err(|e| anyhow!(e))?;
                OxideBrowser::launch(bcfg).await?
            }
            BrowserEndpoint::Connect { ws_url } => OxideBrowser::connect(ws_url).await?,
        };
        let handler = tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        self.session = Some(CdpSession { browser, page, handler });

        let page = &self.session.as_ref().ok_or_else(|| anyhow!("session vanished"))?.page;
        if let Some(ua) = &self.cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let (w, h) = self.cfg.viewport;
        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(w as i64)
                .height(h as i64)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(|e| anyhow!(e))?,
        )
        .await?;
        if let Some(url) = &self.cfg.start_url {
            page.goto(url.as_str()).await?;
            page.wait_for_navigation().await?;
        }
        let measured: Value = page
            .evaluate("({ w: window.innerWidth, h: window.innerHeight })")
            .await?
            .into_value()?;
        if let (Some(w), Some(h)) = (measured["w"].as_u64(), measured["h"].as_u64()) {
            if w > 0 && h > 0 {
                self.desc.refine_dimensions((w as u32, h as u32));
            }
        }
        Ok(())
    }

    async fn eval(&self, script: String) -> Result<(), ComputerError> {
        let eval = EvaluateParams::builder().expression(script).build().map_err(exec_err)?;
        self.page()?.execute(eval).await.map_err(exec_err)?;
        Ok(())
    }

    async fn mouse(&self, x: i64, y: i64, button: CdpButton, click_count: i64) -> Result<(), ComputerError> {
        let page = self.page()?;
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .click_count(click_count);
        page.move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await
            .map_err(exec_err)?;
        page.execute(cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(exec_err)?)
            .await
            .map_err(exec_err)?;
        page.execute(cmd.r#type(DispatchMouseEventType::MouseReleased).build().map_err(exec_err)?)
            .await
            .map_err(exec_err)?;
        Ok(())
    }

    async fn key_event(&self, kind: DispatchKeyEventType, key: &str, modifiers: i64) -> Result<(), ComputerError> {
        let mut builder = DispatchKeyEventParams::builder().r#type(kind.clone()).key(key).modifiers(modifiers);
        if let Some(code) = virtual_key_code(key) {
            builder = builder.windows_virtual_key_code(code);
        }
        // only printable, unmodified keys produce text
        if kind == DispatchKeyEventType::KeyDown && modifiers & !SHIFT == 0 {
            if let Some(text) = key_text(key) {
                builder = builder.text(text);
            }
        }
        let params = builder.build().map_err(exec_err)?;
        self.page()?.execute(params).await.map_err(exec_err)?;
        Ok(())
    }
}

#[async_trait]
impl<P: BrowserProvider> Computer for CdpComputer<P> {
    fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.desc
    }

    async fn acquire(&mut self) -> Result<EnvironmentDescriptor, ComputerError> {
        if self.desc.state != LifecycleState::Uninitialized {
            return Err(ComputerError::Provisioning(format!(
                "{} browser already {:?}",
                self.desc.kind, self.desc.state
            )));
        }
        self.start()
            .await
            .map_err(|e| ComputerError::Provisioning(e.to_string()))?;
        self.desc.state = LifecycleState::Active;
        info!(kind = %self.desc.kind, dims = ?self.desc.dimensions, "browser ready");
        Ok(self.desc.clone())
    }

    async fn release(&mut self) -> Result<(), ComputerError> {
        if self.desc.state == LifecycleState::Released {
            return Ok(());
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.browser.close().await {
                warn!("closing browser: {}", e);
            }
            session.handler.abort();
        }
        remove_profile(self.profile_dir.take()).await;
        if let Err(e) = self.provider.teardown().await {
            warn!(kind = %self.desc.kind, "browser teardown: {}", e);
        }
        self.desc.state = LifecycleState::Released;
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ComputerError> {
        let page = self.page().map_err(|e| ComputerError::Capture(e.to_string()))?;
        page.screenshot(ScreenshotParams::builder().full_page(false).build())
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))
    }

    async fn click(&mut self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        let btn = match button {
            MouseButton::Left => CdpButton::Left,
            MouseButton::Middle => CdpButton::Middle,
            MouseButton::Right => CdpButton::Right,
            MouseButton::Back => CdpButton::Back,
            MouseButton::Forward => CdpButton::Forward,
        };
        self.mouse(x, y, btn, 1).await
    }

    async fn double_click(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.mouse(x, y, CdpButton::Left, 2).await
    }

    async fn scroll(&mut self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        let page = self.page()?;
        page.move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await
            .map_err(exec_err)?;
        let wheel = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x as f64)
            .y(y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(exec_err)?;
        page.execute(wheel).await.map_err(exec_err)?;
        Ok(())
    }

    async fn type_text(&mut self, text: &str) -> Result<(), ComputerError> {
        self.page()?
            .execute(InsertTextParams { text: text.to_string() })
            .await
            .map_err(exec_err)?;
        Ok(())
    }

    async fn keypress(&mut self, keys: &[String]) -> Result<(), ComputerError> {
        let chord = Chord::from_names(keys);
        debug!(keys = ?chord.keys, modifiers = chord.modifiers, "key chord");
        for key in &chord.keys {
            self.key_event(DispatchKeyEventType::KeyDown, key, chord.modifiers).await?;
        }
        for key in chord.keys.iter().rev() {
            self.key_event(DispatchKeyEventType::KeyUp, key, chord.modifiers).await?;
        }
        Ok(())
    }

    async fn move_to(&mut self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.page()?
            .move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await
            .map_err(exec_err)?;
        Ok(())
    }

    async fn drag(&mut self, path: &[Point]) -> Result<(), ComputerError> {
        let Some((first, rest)) = path.split_first() else { return Ok(()) };
        let page = self.page()?;
        let down = DispatchMouseEventParams::builder()
            .x(first.x as f64)
            .y(first.y as f64)
            .button(CdpButton::Left);
        page.move_mouse(CdpPoint { x: first.x as f64, y: first.y as f64 })
            .await
            .map_err(exec_err)?;
        page.execute(down.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(exec_err)?)
            .await
            .map_err(exec_err)?;
        let mut last = *first;
        for p in rest {
            page.move_mouse(CdpPoint { x: p.x as f64, y: p.y as f64 })
                .await
                .map_err(exec_err)?;
            last = *p;
        }
        let up = DispatchMouseEventParams::builder()
            .x(last.x as f64)
            .y(last.y as f64)
            .button(CdpButton::Left)
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(exec_err)?;
        page.execute(up).await.map_err(exec_err)?;
        Ok(())
    }

    async fn current_location(&mut self) -> Result<String, ComputerError> {
        Ok(self
            .page()?
            .url()
            .await
            .map_err(exec_err)?
            .unwrap_or_default())
    }

    async fn goto(&mut self, url: &str) -> Result<(), ComputerError> {
        let page = self.page()?;
        page.goto(url).await.map_err(exec_err)?;
        page.wait_for_navigation().await.map_err(exec_err)?;
        Ok(())
    }

    async fn back(&mut self) -> Result<(), ComputerError> {
        self.eval("history.back()".into()).await?;
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }

    async fn forward(&mut self) -> Result<(), ComputerError> {
        self.eval("history.forward()".into()).await?;
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }
}

async fn remove_profile(dir: Option<PathBuf>) {
    let Some(dir) = dir else { return };
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        warn!(dir = %dir.display(), "removing browser profile: {}", e);
    }
}

fn exec_err(e: impl Display) -> ComputerError {
    ComputerError::Execution(e.to_string())
}

// CDP modifier bits
const ALT: i64 = 1;
const CTRL: i64 = 2;
const META: i64 = 4;
const SHIFT: i64 = 8;

/// A key combination: modifiers folded into one bitmask, the rest pressed together.
#[derive(Debug, PartialEq)]
pub(crate) struct Chord {
    pub keys: Vec<String>,
    pub modifiers: i64,
}

impl Chord {
    pub(crate) fn from_names(names: &[String]) -> Self {
        let mut modifiers = 0;
        let mut keys = Vec::new();
        let mut last_modifier = None;
        for name in names {
            let key = dom_key(name);
            let bit = match key {
                "Alt" => ALT,
                "Control" => CTRL,
                "Meta" => META,
                "Shift" => SHIFT,
                _ => 0,
            };
            if bit == 0 {
                keys.push(key.to_string());
            } else {
                modifiers |= bit;
                last_modifier = Some(key.to_string());
            }
        }
        // a bare modifier press still needs one key event
        if keys.is_empty() {
            keys.extend(last_modifier);
        }
        Self { keys, modifiers }
    }
}

fn virtual_key_code(key: &str) -> Option<i64> {
    let code = match key {
        "Backspace" => 8,
        "Tab" => 9,
        "Enter" => 13,
        "Shift" => 16,
        "Control" => 17,
        "Alt" => 18,
        "Escape" => 27,
        " " => 32,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Meta" => 91,
        k if k.chars().count() == 1 => {
            let c = k.chars().next()?.to_ascii_uppercase();
            if c.is_ascii_alphanumeric() {
                c as i64
            } else {
                return None;
            }
        }
        _ => return None,
    };
    Some(code)
}

fn key_text(key: &str) -> Option<String> {
    match key {
        "Enter" => Some("\r".into()),
        k if k.chars().count() == 1 => Some(k.to_string()),
        _ => None,
    }
}
