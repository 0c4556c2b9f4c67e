//! Isolated browsing sessions.
//!
//! One session per concurrent unit of work; sessions are never shared. A
//! [`SessionHandle`] ties the session to the proxy it borrowed and guarantees
//! the session is closed even if the owning future is dropped mid-flight.

pub mod http;
pub mod webdriver;

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::models::ProxyEndpoint;
use crate::proxy_pool::{Outcome, ProxyPool, SelectionStrategy};

pub use http::HttpBrowser;
pub use webdriver::WebDriverBrowser;

/// A live page context with its own cookies and storage.
#[async_trait]
pub trait Session: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), SessionError>;

    async fn title(&self) -> Result<String, SessionError>;

    async fn content(&self) -> Result<String, SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;

    async fn reload(&self) -> Result<(), SessionError>;

    async fn scroll_by(&self, pixels: i64) -> Result<(), SessionError>;

    async fn move_pointer(&self, x: i64, y: i64) -> Result<(), SessionError>;

    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}

/// Session factory.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn Session>, SessionError>;
}

pub struct SessionProvider {
    browser: Arc<dyn Browser>,
    pool: Option<Arc<ProxyPool>>,
    strategy: SelectionStrategy,
}

impl SessionProvider {
    pub fn new(browser: Arc<dyn Browser>, pool: Option<Arc<ProxyPool>>) -> Self {
        Self {
            browser,
            pool,
            strategy: SelectionStrategy::Best,
        }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Open a fresh session, routed through a pooled proxy when asked for and
    /// one is available. Running without a proxy is a degraded, not fatal, mode.
    pub async fn new_session(&self, use_proxy: bool) -> Result<SessionHandle, SessionError> {
        let proxy = match (&self.pool, use_proxy) {
            (Some(pool), true) => match pool.acquire(self.strategy).await {
                Ok(Some(proxy)) => Some(proxy),
                Ok(None) => {
                    tracing::warn!("No usable proxy, opening session without one");
                    None
                }
                Err(e) => {
                    tracing::warn!("Proxy pool unavailable ({e}), opening session without proxy");
                    None
                }
            },
            _ => None,
        };

        let endpoint = proxy.as_ref().map(|p| p.endpoint());
        match self.browser.open(endpoint.as_ref()).await {
            Ok(session) => Ok(SessionHandle {
                inner: session,
                proxy_id: proxy.map(|p| p.id),
                pool: self.pool.clone(),
                closed: false,
            }),
            Err(e) => {
                if let (Some(pool), Some(proxy)) = (&self.pool, &proxy)
                    && let Err(release_err) = pool.release(proxy.id, Outcome::Failure).await
                {
                    tracing::warn!("Failed to record proxy failure: {release_err}");
                }
                Err(e)
            }
        }
    }
}

/// Scoped ownership of one session and its borrowed proxy.
///
/// Call [`SessionHandle::close`] to report the proxy outcome. Dropping the
/// handle without closing (cancellation, panic) still closes the session on
/// the runtime but reports nothing about the proxy.
pub struct SessionHandle {
    inner: Box<dyn Session>,
    proxy_id: Option<i64>,
    pool: Option<Arc<ProxyPool>>,
    closed: bool,
}

impl SessionHandle {
    pub fn proxy_id(&self) -> Option<i64> {
        self.proxy_id
    }

    pub async fn close(mut self, outcome: Outcome) {
        self.closed = true;
        let session = std::mem::replace(&mut self.inner, Box::new(ClosedSession));
        if let Err(e) = session.close().await {
            tracing::warn!("Failed to close session cleanly: {e}");
        }

        if let (Some(pool), Some(proxy_id)) = (self.pool.take(), self.proxy_id)
            && let Err(e) = pool.release(proxy_id, outcome).await
        {
            tracing::warn!("Failed to release proxy {proxy_id}: {e}");
        }
    }
}

impl Deref for SessionHandle {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let session = std::mem::replace(&mut self.inner, Box::new(ClosedSession));
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        tracing::warn!("Failed to close abandoned session: {e}");
                    }
                });
            }
            Err(_) => tracing::warn!("Session dropped outside the runtime and could not be closed"),
        }
    }
}

/// Placeholder left behind once the real session has been handed to `close`.
struct ClosedSession;

#[async_trait]
impl Session for ClosedSession {
    async fn goto(&self, _url: &str) -> Result<(), SessionError> {
        Err(SessionError::NoPage)
    }

    async fn title(&self) -> Result<String, SessionError> {
        Err(SessionError::NoPage)
    }

    async fn content(&self) -> Result<String, SessionError> {
        Err(SessionError::NoPage)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Err(SessionError::NoPage)
    }

    async fn reload(&self) -> Result<(), SessionError> {
        Err(SessionError::NoPage)
    }

    async fn scroll_by(&self, _pixels: i64) -> Result<(), SessionError> {
        Err(SessionError::NoPage)
    }

    async fn move_pointer(&self, _x: i64, _y: i64) -> Result<(), SessionError> {
        Err(SessionError::NoPage)
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}
