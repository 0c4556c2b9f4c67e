use async_trait::async_trait;
use thirtyfour::error::WebDriverError;
use thirtyfour::{CapabilitiesHelper, ChromiumLikeCapabilities, DesiredCapabilities, Proxy, WebDriver};

use crate::error::SessionError;
use crate::models::ProxyEndpoint;
use crate::session::{Browser, Session};

/// Rendering browser backed by a remote WebDriver (chromedriver, Selenium grid).
/// Every `open` starts a brand new browser session, so cookies and storage
/// never leak between units of work.
pub struct WebDriverBrowser {
    server_url: String,
    headless: bool,
}

impl WebDriverBrowser {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            headless: true,
        }
    }

    pub fn headed(mut self) -> Self {
        self.headless = false;
        self
    }
}

fn driver_err(e: WebDriverError) -> SessionError {
    SessionError::Driver(e.to_string())
}

fn proxy_capability(endpoint: &ProxyEndpoint) -> Proxy {
    let address = format!("{}:{}", endpoint.host, endpoint.port);
    if endpoint.protocol.starts_with("socks") {
        Proxy::Manual {
            ftp_proxy: None,
            http_proxy: None,
            ssl_proxy: None,
            socks_proxy: Some(address),
            socks_version: Some(5),
            socks_username: endpoint.username.clone(),
            socks_password: endpoint.password.clone(),
            no_proxy: None,
        }
    } else {
        if endpoint.username.is_some() {
            tracing::warn!("Chrome ignores HTTP proxy credentials; {endpoint} must allow the client IP");
        }
        Proxy::Manual {
            ftp_proxy: None,
            http_proxy: Some(address.clone()),
            ssl_proxy: Some(address),
            socks_proxy: None,
            socks_version: None,
            socks_username: None,
            socks_password: None,
            no_proxy: None,
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn Session>, SessionError> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.set_headless().map_err(driver_err)?;
        }
        caps.add_arg("--incognito").map_err(driver_err)?;
        caps.add_arg("--disable-blink-features=AutomationControlled")
            .map_err(driver_err)?;
        if let Some(endpoint) = proxy {
            caps.set_proxy(proxy_capability(endpoint))
                .map_err(driver_err)?;
        }

        let driver = WebDriver::new(self.server_url.as_str(), caps)
            .await
            .map_err(driver_err)?;
        tracing::debug!("Opened WebDriver session via {}", self.server_url);
        Ok(Box::new(WebDriverSession { driver }))
    }
}

pub struct WebDriverSession {
    driver: WebDriver,
}

#[async_trait]
impl Session for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), SessionError> {
        self.driver
            .goto(url)
            .await
            .map_err(|e| SessionError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn title(&self) -> Result<String, SessionError> {
        self.driver.title().await.map_err(driver_err)
    }

    async fn content(&self) -> Result<String, SessionError> {
        self.driver.source().await.map_err(driver_err)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.driver
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(driver_err)
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.driver.refresh().await.map_err(driver_err)
    }

    async fn scroll_by(&self, pixels: i64) -> Result<(), SessionError> {
        self.driver
            .execute(format!("window.scrollBy(0, {pixels});"), Vec::new())
            .await
            .map_err(driver_err)?;
        Ok(())
    }

    async fn move_pointer(&self, x: i64, y: i64) -> Result<(), SessionError> {
        self.driver
            .action_chain()
            .move_by_offset(x, y)
            .perform()
            .await
            .map_err(driver_err)
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        self.driver.quit().await.map_err(driver_err)
    }
}
