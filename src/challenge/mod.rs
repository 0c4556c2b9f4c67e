//! Anti-automation challenge negotiation.
//!
//! `Clear -> Detected -> Waiting -> {Bypassed | Failed}`. While waiting the
//! handler performs human-like interaction, polls for success markers, and
//! reloads the page exactly once at the halfway mark. The whole negotiation
//! is bounded by `max_wait`.

pub mod behavior;
pub mod classifier;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::session::Session;

pub use behavior::{HumanBehavior, NoopBehavior, RandomizedBehavior};
pub use classifier::{PageVerdict, classify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassState {
    Clear,
    Detected,
    Waiting,
    Bypassed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassOutcome {
    /// No challenge on the page.
    Clear,
    /// A challenge was present and resolved.
    Bypassed,
    /// The challenge did not resolve within `max_wait`.
    Failed,
    /// Hard block or CAPTCHA; nothing was attempted.
    Blocked,
}

impl BypassOutcome {
    pub fn is_usable(self) -> bool {
        matches!(self, BypassOutcome::Clear | BypassOutcome::Bypassed)
    }
}

#[derive(Debug, Clone)]
pub struct BypassReport {
    pub outcome: BypassOutcome,
    pub trace: Vec<BypassState>,
    pub reloaded: bool,
    pub elapsed: Duration,
}

/// What the caller does with a page whose challenge could not be negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePolicy {
    /// Parse the page anyway.
    Proceed,
    /// Treat the page as unusable and move on.
    #[default]
    Skip,
    /// Fail the whole job.
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct BypassConfig {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(3),
        }
    }
}

pub struct ChallengeHandler {
    config: BypassConfig,
    behavior: Arc<dyn HumanBehavior>,
}

impl ChallengeHandler {
    pub fn new(config: BypassConfig, behavior: Arc<dyn HumanBehavior>) -> Self {
        Self { config, behavior }
    }

    /// Classify whatever the session currently shows.
    pub async fn inspect(&self, session: &dyn Session) -> Result<PageVerdict, SessionError> {
        let title = session.title().await?;
        let content = session.content().await?;
        Ok(classify(&title, &content))
    }

    /// Run the bypass protocol on the current page. `content_markers` are
    /// strings whose presence proves the real page has loaded.
    pub async fn negotiate(&self, session: &dyn Session, content_markers: &[&str]) -> BypassReport {
        let started = Instant::now();
        let mut trace = Vec::new();

        let verdict = match self.inspect(session).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Could not inspect page for challenges: {e}");
                PageVerdict::Unknown
            }
        };

        match verdict {
            PageVerdict::Clear | PageVerdict::Unknown => {
                trace.push(BypassState::Clear);
                return BypassReport {
                    outcome: BypassOutcome::Clear,
                    trace,
                    reloaded: false,
                    elapsed: started.elapsed(),
                };
            }
            PageVerdict::Blocked => {
                trace.push(BypassState::Detected);
                return BypassReport {
                    outcome: BypassOutcome::Blocked,
                    trace,
                    reloaded: false,
                    elapsed: started.elapsed(),
                };
            }
            PageVerdict::Challenge => trace.push(BypassState::Detected),
        }

        let challenge_url = session.current_url().await.unwrap_or_default();
        tracing::info!("Challenge detected on {challenge_url}, waiting up to {:?}", self.config.max_wait);

        let mut reloaded = false;
        trace.push(BypassState::Waiting);
        let waited = tokio::time::timeout(
            self.config.max_wait,
            self.wait_for_resolution(session, &challenge_url, content_markers, started, &mut reloaded),
        )
        .await;

        let outcome = match waited {
            Ok(true) => {
                trace.push(BypassState::Bypassed);
                tracing::info!("Challenge on {challenge_url} cleared after {:?}", started.elapsed());
                BypassOutcome::Bypassed
            }
            Ok(false) | Err(_) => {
                trace.push(BypassState::Failed);
                tracing::warn!("Challenge on {challenge_url} not cleared within {:?}", self.config.max_wait);
                BypassOutcome::Failed
            }
        };

        BypassReport {
            outcome,
            trace,
            reloaded,
            elapsed: started.elapsed(),
        }
    }

    /// Returns `true` once a success marker shows up, `false` if the page turns
    /// into a hard block. Runs until cancelled by the caller's timeout otherwise.
    async fn wait_for_resolution(
        &self,
        session: &dyn Session,
        challenge_url: &str,
        content_markers: &[&str],
        started: Instant,
        reloaded: &mut bool,
    ) -> bool {
        let halfway = self.config.max_wait / 2;
        loop {
            if let Err(e) = self.behavior.perform(session).await {
                tracing::debug!("Human behavior step failed: {e}");
            }
            tokio::time::sleep(self.config.poll_interval).await;

            if !*reloaded && started.elapsed() >= halfway {
                *reloaded = true;
                tracing::debug!("Challenge still present at halfway mark, reloading once");
                if let Err(e) = session.reload().await {
                    tracing::debug!("Reload during challenge failed: {e}");
                }
            }

            match self.check(session, challenge_url, content_markers).await {
                Some(resolved) => return resolved,
                None => continue,
            }
        }
    }

    async fn check(&self, session: &dyn Session, challenge_url: &str, content_markers: &[&str]) -> Option<bool> {
        let title = session.title().await.ok()?;
        let content = session.content().await.ok()?;

        if content_markers.iter().any(|m| content.contains(m)) {
            return Some(true);
        }
        match classify(&title, &content) {
            PageVerdict::Clear => Some(true),
            PageVerdict::Blocked => Some(false),
            PageVerdict::Challenge | PageVerdict::Unknown => {
                let url = session.current_url().await.ok()?;
                if !challenge_url.is_empty() && url != challenge_url && !classifier::title_is_challenge(&title) {
                    Some(true)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Browser;
    use crate::testing::{MockBrowser, Resolution};

    const CHALLENGE: &str = "<html><head><title>Just a moment...</title></head><body><div id=\"challenge-platform\"></div></body></html>";
    const REAL: &str = "<html><head><title>Lamps</title></head><body><div class=\"results\">ok</div></body></html>";

    fn handler() -> ChallengeHandler {
        ChallengeHandler::new(
            BypassConfig {
                max_wait: Duration::from_secs(120),
                poll_interval: Duration::from_secs(3),
            },
            Arc::new(NoopBehavior),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn clear_page_skips_the_protocol() {
        let browser = MockBrowser::new().page("https://shop.test/s", REAL);
        let session = browser.open(None).await.unwrap();
        session.goto("https://shop.test/s").await.unwrap();

        let report = handler().negotiate(session.as_ref(), &["results"]).await;
        assert_eq!(report.outcome, BypassOutcome::Clear);
        assert_eq!(report.trace, vec![BypassState::Clear]);
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_resolving_on_its_own_is_bypassed() {
        let browser = MockBrowser::new().challenge(
            "https://shop.test/s",
            CHALLENGE,
            REAL,
            Resolution::AfterChecks(3),
        );
        let session = browser.open(None).await.unwrap();
        session.goto("https://shop.test/s").await.unwrap();

        let report = handler().negotiate(session.as_ref(), &["results"]).await;
        assert_eq!(report.outcome, BypassOutcome::Bypassed);
        assert_eq!(
            report.trace,
            vec![BypassState::Detected, BypassState::Waiting, BypassState::Bypassed]
        );
        assert!(!report.reloaded);
        assert!(report.elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_happens_once_at_halfway() {
        let browser = MockBrowser::new().challenge(
            "https://shop.test/s",
            CHALLENGE,
            REAL,
            Resolution::OnReload,
        );
        let session = browser.open(None).await.unwrap();
        session.goto("https://shop.test/s").await.unwrap();

        let report = handler().negotiate(session.as_ref(), &["results"]).await;
        assert_eq!(report.outcome, BypassOutcome::Bypassed);
        assert!(report.reloaded);
        assert_eq!(browser.reloads(), 1);
        assert!(report.elapsed >= Duration::from_secs(60));
        assert!(report.elapsed < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_challenge_fails_within_max_wait() {
        let browser = MockBrowser::new().challenge(
            "https://shop.test/s",
            CHALLENGE,
            REAL,
            Resolution::Never,
        );
        let session = browser.open(None).await.unwrap();
        session.goto("https://shop.test/s").await.unwrap();

        let report = handler().negotiate(session.as_ref(), &["results"]).await;
        assert_eq!(report.outcome, BypassOutcome::Failed);
        assert_eq!(report.trace.last(), Some(&BypassState::Failed));
        assert!(report.reloaded);
        assert_eq!(browser.reloads(), 1);
        assert!(report.elapsed <= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_wall_is_reported_blocked_immediately() {
        let browser = MockBrowser::new().page(
            "https://shop.test/s",
            "<html><head><title>Robot Check</title></head><body><div class=\"g-recaptcha\"></div></body></html>",
        );
        let session = browser.open(None).await.unwrap();
        session.goto("https://shop.test/s").await.unwrap();

        let report = handler().negotiate(session.as_ref(), &["results"]).await;
        assert_eq!(report.outcome, BypassOutcome::Blocked);
        assert!(!report.outcome.is_usable());
    }
}
