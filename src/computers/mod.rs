pub mod browserbase;
pub mod cdp;
pub mod daytona;
pub mod docker;
pub mod scrapybara;
pub mod xdotool;

pub use browserbase::BrowserbaseProvider;
pub use cdp::{BrowserConfig, BrowserEndpoint, BrowserProvider, CdpComputer, LocalChromium};
pub use daytona::{DaytonaConfig, DaytonaHost};
pub use docker::DockerHost;
pub use scrapybara::{ScrapybaraBrowser, ScrapybaraDesktop};
pub use xdotool::{DesktopConfig, DesktopHost, XdotoolComputer};
