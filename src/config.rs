use std::fmt;
use std::str::FromStr;

use crate::computer::{Computer, ComputerError};
use crate::computers::{
    BrowserConfig, BrowserbaseProvider, CdpComputer, DaytonaConfig, DaytonaHost, DesktopConfig,
    DockerHost, LocalChromium, ScrapybaraBrowser, ScrapybaraDesktop, XdotoolComputer,
};

/// Which backend a session drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputerChoice {
    LocalBrowser,
    Docker,
    Browserbase,
    ScrapybaraBrowser,
    ScrapybaraUbuntu,
    Daytona,
}

impl FromStr for ComputerChoice {
    type Err = ComputerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local-browser" | "local-playwright" => Ok(Self::LocalBrowser),
            "docker" => Ok(Self::Docker),
            "browserbase" => Ok(Self::Browserbase),
            "scrapybara-browser" => Ok(Self::ScrapybaraBrowser),
            "scrapybara-ubuntu" => Ok(Self::ScrapybaraUbuntu),
            "daytona" => Ok(Self::Daytona),
            other => Err(ComputerError::Provisioning(format!("unknown computer '{other}'"))),
        }
    }
}

impl fmt::Display for ComputerChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalBrowser => "local-browser",
            Self::Docker => "docker",
            Self::Browserbase => "browserbase",
            Self::ScrapybaraBrowser => "scrapybara-browser",
            Self::ScrapybaraUbuntu => "scrapybara-ubuntu",
            Self::Daytona => "daytona",
        })
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub computer: String,
    pub start_url: String,
    pub display: String,
    pub headless: bool,
    pub docker_container: String,
    pub daytona_api_key: String,
    pub daytona_server_url: String,
    pub daytona_target: String,
    pub browserbase_api_key: String,
    pub browserbase_project_id: String,
    pub scrapybara_api_key: String,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            computer: env_or("CUA_COMPUTER", "local-browser"),
            start_url: env_or("CUA_START_URL", "https://bing.com"),
            display: env_or("CUA_DISPLAY", ":99"),
            headless: matches!(env_or("CUA_HEADLESS", "false").as_str(), "1" | "true" | "yes"),
            docker_container: env_or("CUA_DOCKER_CONTAINER", "cua-sample-app"),
            daytona_api_key: env_or("DAYTONA_API_KEY", ""),
            daytona_server_url: env_or("DAYTONA_SERVER_URL", ""),
            daytona_target: env_or("DAYTONA_TARGET", "us"),
            browserbase_api_key: env_or("BROWSERBASE_API_KEY", ""),
            browserbase_project_id: env_or("BROWSERBASE_PROJECT_ID", ""),
            scrapybara_api_key: env_or("SCRAPYBARA_API_KEY", ""),
        }
    }
}

impl SessionConfig {
    pub fn choice(&self) -> Result<ComputerChoice, ComputerError> {
        self.computer.parse()
    }

    fn browser(&self, headless: bool) -> BrowserConfig {
        let start_url = Some(self.start_url.clone()).filter(|u| !u.trim().is_empty());
        BrowserConfig { headless, start_url, ..Default::default() }
    }

    fn desktop(&self) -> DesktopConfig {
        DesktopConfig { display: self.display.clone(), ..Default::default() }
    }
}

fn provisioning(err: anyhow::Error) -> ComputerError {
    ComputerError::Provisioning(err.to_string())
}

/// Construct the adapter for the configured backend. Nothing is provisioned
/// until the returned computer is acquired.
pub fn build_computer(cfg: &SessionConfig) -> Result<Box<dyn Computer>, ComputerError> {
    let computer: Box<dyn Computer> = match cfg.choice()? {
        ComputerChoice::LocalBrowser => Box::new(CdpComputer::new(
            LocalChromium::new(cfg.headless),
            cfg.browser(cfg.headless),
        )),
        ComputerChoice::Docker => Box::new(XdotoolComputer::new(
            DockerHost::new(cfg.docker_container.clone()),
            cfg.desktop(),
        )),
        ComputerChoice::Browserbase => {
            let provider = BrowserbaseProvider::new(
                cfg.browserbase_api_key.clone(),
                cfg.browserbase_project_id.clone(),
            )
            .map_err(provisioning)?;
            Box::new(CdpComputer::new(provider, cfg.browser(true)))
        }
        ComputerChoice::ScrapybaraBrowser => {
            let provider =
                ScrapybaraBrowser::new(cfg.scrapybara_api_key.clone()).map_err(provisioning)?;
            Box::new(CdpComputer::new(provider, cfg.browser(true)))
        }
        ComputerChoice::ScrapybaraUbuntu => {
            let host =
                ScrapybaraDesktop::new(cfg.scrapybara_api_key.clone()).map_err(provisioning)?;
            Box::new(XdotoolComputer::new(host, cfg.desktop()))
        }
        ComputerChoice::Daytona => {
            let mut daytona =
                DaytonaConfig::new(cfg.daytona_api_key.clone(), cfg.daytona_server_url.clone());
            daytona.target = cfg.daytona_target.clone();
            daytona.display = cfg.display.clone();
            let host = DaytonaHost::new(daytona).map_err(provisioning)?;
            let desktop = DesktopConfig { install_tools: true, start_display: true, ..cfg.desktop() };
            Box::new(XdotoolComputer::new(host, desktop))
        }
    };
    Ok(computer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::{EnvironmentKind, ScrollCapability};

    fn cfg(computer: &str) -> SessionConfig {
        SessionConfig {
            computer: computer.into(),
            start_url: "https://bing.com".into(),
            display: ":42".into(),
            headless: true,
            docker_container: "box".into(),
            daytona_api_key: String::new(),
            daytona_server_url: String::new(),
            daytona_target: "eu".into(),
            browserbase_api_key: String::new(),
            browserbase_project_id: String::new(),
            scrapybara_api_key: String::new(),
        }
    }

    #[test]
    fn parses_every_choice() {
        assert_eq!("local-playwright".parse::<ComputerChoice>().unwrap(), ComputerChoice::LocalBrowser);
        assert_eq!(" Daytona ".parse::<ComputerChoice>().unwrap(), ComputerChoice::Daytona);
        for c in ["local-browser", "docker", "browserbase", "scrapybara-browser", "scrapybara-ubuntu", "daytona"] {
            assert_eq!(c.parse::<ComputerChoice>().unwrap().to_string(), c);
        }
        assert!("vnc".parse::<ComputerChoice>().is_err());
    }

    #[test]
    fn builds_keyless_backends() {
        let local = build_computer(&cfg("local-browser")).unwrap();
        assert_eq!(local.descriptor().kind, EnvironmentKind::LocalBrowser);
        assert_eq!(local.descriptor().scroll, ScrollCapability::NativeDelta);

        let docker = build_computer(&cfg("docker")).unwrap();
        assert_eq!(docker.descriptor().kind, EnvironmentKind::ContainerDesktop);
        assert!(matches!(docker.descriptor().scroll, ScrollCapability::UnitSteps { .. }));
    }

    #[test]
    fn missing_credentials_fail_before_provisioning() {
        for c in ["daytona", "browserbase", "scrapybara-browser", "scrapybara-ubuntu"] {
            let err = build_computer(&cfg(c)).err().unwrap();
            assert!(matches!(err, ComputerError::Provisioning(_)), "{c}: {err}");
        }
    }

    #[test]
    fn daytona_is_a_cloud_sandbox() {
        let mut c = cfg("daytona");
        c.daytona_api_key = "key".into();
        c.daytona_server_url = "https://daytona.example".into();
        let computer = build_computer(&c).unwrap();
        assert_eq!(computer.descriptor().kind, EnvironmentKind::CloudSandbox);
    }
}
