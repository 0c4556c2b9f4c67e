//! Test doubles for the engine's seams.
//!
//! These let the scheduler, pipeline and pool be exercised without a browser,
//! a network or a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PipelineError, SessionError};
use crate::models::{ExtractedRecord, Job, JobStatus, ProxyEndpoint};
use crate::proxy_pool::ProxyProber;
use crate::proxy_pool::probe::PROBE_TIMEOUT;
use crate::scheduler::{JobExecutor, ProgressSink};
use crate::session::http::page_title;
use crate::session::{Browser, Session};
use crate::store::JobStore;

/// When a scripted challenge page turns into the real page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// After this many content reads of the challenge page.
    AfterChecks(usize),
    /// Once the page is reloaded.
    OnReload,
    Never,
}

#[derive(Clone)]
struct ChallengeScript {
    challenge: String,
    resolved: String,
    resolution: Resolution,
}

#[derive(Default)]
struct BrowserState {
    pages: Mutex<HashMap<String, String>>,
    challenges: Mutex<HashMap<String, ChallengeScript>>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    visits: Mutex<Vec<String>>,
    proxies: Mutex<Vec<Option<String>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    open_now: AtomicUsize,
    peak_open: AtomicUsize,
    reloads: AtomicUsize,
}

/// A scripted browser: URL -> HTML, with optional failing URLs and
/// challenge pages that resolve on a schedule.
#[derive(Default)]
pub struct MockBrowser {
    state: Arc<BrowserState>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.state.pages.lock().unwrap().insert(url.into(), html.into());
        self
    }

    pub fn challenge(
        self,
        url: impl Into<String>,
        challenge: impl Into<String>,
        resolved: impl Into<String>,
        resolution: Resolution,
    ) -> Self {
        self.state.challenges.lock().unwrap().insert(
            url.into(),
            ChallengeScript {
                challenge: challenge.into(),
                resolved: resolved.into(),
                resolution,
            },
        );
        self
    }

    /// Navigation to `url` fails.
    pub fn failing(self, url: impl Into<String>) -> Self {
        self.state.failing.lock().unwrap().insert(url.into());
        self
    }

    /// Every navigation takes this long.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = Some(latency);
        self
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Most sessions that were open at the same time.
    pub fn peak_open(&self) -> usize {
        self.state.peak_open.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    /// Every URL navigated to, in order.
    pub fn visits(&self) -> Vec<String> {
        self.state.visits.lock().unwrap().clone()
    }

    pub fn proxies_used(&self) -> Vec<Option<String>> {
        self.state.proxies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn open(&self, proxy: Option<&ProxyEndpoint>) -> Result<Box<dyn Session>, SessionError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.state.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_open.fetch_max(now, Ordering::SeqCst);
        self.state.proxies.lock().unwrap().push(proxy.map(|p| p.url()));
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            current: Mutex::new(None),
        }))
    }
}

struct Current {
    url: String,
    checks: usize,
    reloaded: bool,
}

struct MockSession {
    state: Arc<BrowserState>,
    current: Mutex<Option<Current>>,
}

impl MockSession {
    fn body(&self, count_check: bool) -> Result<String, SessionError> {
        let mut current = self.current.lock().unwrap();
        let current = current.as_mut().ok_or(SessionError::NoPage)?;

        let script = self.state.challenges.lock().unwrap().get(&current.url).cloned();
        if let Some(script) = script {
            let resolved = match script.resolution {
                Resolution::AfterChecks(n) => current.checks >= n,
                Resolution::OnReload => current.reloaded,
                Resolution::Never => false,
            };
            if count_check {
                current.checks += 1;
            }
            return Ok(if resolved { script.resolved } else { script.challenge });
        }

        self.state
            .pages
            .lock()
            .unwrap()
            .get(&current.url)
            .cloned()
            .ok_or(SessionError::NoPage)
    }
}

#[async_trait]
impl Session for MockSession {
    async fn goto(&self, url: &str) -> Result<(), SessionError> {
        let latency = *self.state.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.visits.lock().unwrap().push(url.to_string());

        let known = self.state.pages.lock().unwrap().contains_key(url)
            || self.state.challenges.lock().unwrap().contains_key(url);
        if self.state.failing.lock().unwrap().contains(url) || !known {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        *self.current.lock().unwrap() = Some(Current {
            url: url.to_string(),
            checks: 0,
            reloaded: false,
        });
        Ok(())
    }

    async fn title(&self) -> Result<String, SessionError> {
        Ok(page_title(&self.body(false)?))
    }

    async fn content(&self) -> Result<String, SessionError> {
        self.body(true)
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.url.clone())
            .ok_or(SessionError::NoPage)
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.state.reloads.fetch_add(1, Ordering::SeqCst);
        let mut current = self.current.lock().unwrap();
        let current = current.as_mut().ok_or(SessionError::NoPage)?;
        current.reloaded = true;
        current.checks = 0;
        Ok(())
    }

    async fn scroll_by(&self, _pixels: i64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn move_pointer(&self, _x: i64, _y: i64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.state.open_now.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Prober that fails for chosen hosts and answers in 250ms otherwise.
#[derive(Default)]
pub struct MockProber {
    failing: HashSet<String>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, host: impl Into<String>) -> Self {
        self.failing.insert(host.into());
        self
    }
}

#[async_trait]
impl ProxyProber for MockProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<f64, SessionError> {
        if self.failing.contains(&endpoint.host) {
            Err(SessionError::Timeout(PROBE_TIMEOUT))
        } else {
            Ok(0.25)
        }
    }
}

#[derive(Clone)]
enum Behavior {
    Return(usize),
    Invalid(String),
    Block,
    Panic(String),
}

/// Executor double that records calls and behaves as configured.
pub struct RecordingExecutor {
    behavior: Behavior,
    delay: Duration,
    executions: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self {
            behavior: Behavior::Return(0),
            delay: Duration::ZERO,
            executions: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `count` records.
    pub fn returning(mut self, count: usize) -> Self {
        self.behavior = Behavior::Return(count);
        self
    }

    /// Fail validation with `message`.
    pub fn invalid(mut self, message: impl Into<String>) -> Self {
        self.behavior = Behavior::Invalid(message.into());
        self
    }

    /// Never finish; reports a progress tick every 10ms until cancelled.
    pub fn blocking(mut self) -> Self {
        self.behavior = Behavior::Block;
        self
    }

    pub fn panicking(mut self, message: impl Into<String>) -> Self {
        self.behavior = Behavior::Panic(message.into());
        self
    }

    /// Hold each execution for `delay` before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Most executions that were in flight at the same time.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    fn validate(&self, _job: &Job) -> Result<(), PipelineError> {
        match &self.behavior {
            Behavior::Invalid(message) => Err(PipelineError::InvalidInput(message.clone())),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        job: &Job,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Vec<ExtractedRecord>, PipelineError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behavior {
            Behavior::Return(count) => Ok((0..*count).map(|i| sample_record(i, "lamp")).collect()),
            Behavior::Invalid(message) => Err(PipelineError::InvalidInput(message.clone())),
            Behavior::Block => loop {
                progress.report(job.id, "tick").await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            Behavior::Panic(message) => panic!("{message}"),
        }
    }
}

pub fn sample_record(i: usize, term: &str) -> ExtractedRecord {
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("title".to_string(), serde_json::Value::from(format!("Item {i}")));
    ExtractedRecord {
        candidate_id: format!("c{i}"),
        search_term: term.to_string(),
        source_url: format!("https://shop.test/dp/{i}"),
        fields,
        missing_fields: Vec::new(),
        completeness: 1.0,
    }
}

/// Poll the store until the job reaches `status`. Panics after five seconds.
pub async fn wait_for_status(store: &dyn JobStore, id: Uuid, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(job)) = store.get_job(id).await
            && job.status == status
        {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {id} did not reach {status} in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
