use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use scraper::{Html, Selector};

use crate::error::SessionError;
use crate::models::ProxyEndpoint;
use crate::session::{Browser, Session};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
];

/// Non-rendering browser: plain HTTP fetches with a private cookie jar per
/// session. Pages that need JavaScript will come back incomplete.
#[derive(Default)]
pub struct HttpBrowser;

impl HttpBrowser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn Session>, SessionError> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
        }

        Ok(Box::new(HttpSession {
            client: builder.build()?,
            page: Mutex::new(None),
        }))
    }
}

#[derive(Clone)]
struct LoadedPage {
    requested: String,
    url: String,
    body: String,
}

pub struct HttpSession {
    client: reqwest::Client,
    page: Mutex<Option<LoadedPage>>,
}

impl HttpSession {
    fn current(&self) -> Result<LoadedPage, SessionError> {
        self.page
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::NoPage)
    }

    async fn fetch(&self, url: &str) -> Result<(), SessionError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SessionError::Timeout(REQUEST_TIMEOUT)
            } else {
                SessionError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        check_status(url, status)?;
        let body = resp.text().await?;
        tracing::debug!("Fetched {final_url} ({status}, {} bytes)", body.len());

        *self.page.lock().unwrap_or_else(|e| e.into_inner()) = Some(LoadedPage {
            requested: url.to_string(),
            url: final_url,
            body,
        });
        Ok(())
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn goto(&self, url: &str) -> Result<(), SessionError> {
        self.fetch(url).await
    }

    async fn title(&self) -> Result<String, SessionError> {
        Ok(page_title(&self.current()?.body))
    }

    async fn content(&self) -> Result<String, SessionError> {
        Ok(self.current()?.body)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok(self.current()?.url)
    }

    async fn reload(&self) -> Result<(), SessionError> {
        let page = self.current()?;
        self.fetch(&page.requested).await
    }

    async fn scroll_by(&self, _pixels: i64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn move_pointer(&self, _x: i64, _y: i64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}

pub(crate) fn page_title(body: &str) -> String {
    let Ok(selector) = Selector::parse("title") else {
        return String::new();
    };
    Html::parse_document(body)
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Missing pages and server faults fail navigation. Challenge and block pages
/// arrive as 403/429/503 and are kept so they can be classified.
fn check_status(url: &str, status: StatusCode) -> Result<(), SessionError> {
    let failed = matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
        || (status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE);
    if failed {
        return Err(SessionError::Navigation {
            url: url.to_string(),
            reason: format!("server returned {status}"),
        });
    }
    Ok(())
}
