use std::collections::HashSet;
use std::fmt;

use url::Url;
use uuid::Uuid;

use crate::challenge::{BypassOutcome, ChallengePolicy};
use crate::error::PipelineError;
use crate::extractors::SiteExtractor;
use crate::pipeline::rules::{self, Candidate};
use crate::pipeline::{JobParams, Pipeline, RunSettings};
use crate::proxy_pool::Outcome;
use crate::scheduler::ProgressSink;

const SCROLL_STEP_PX: i64 = 1200;

/// Probable reason discovery came back empty, for operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    AntiBot,
    NoResults,
    InvalidLocation,
    MarkupDrift,
    Unreachable,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Diagnosis::AntiBot => {
                "probable anti-bot detection (challenge or block pages were served)"
            }
            Diagnosis::NoResults => "the site reported no matching content for the search",
            Diagnosis::InvalidLocation => "the site did not recognise the location; check its spelling",
            Diagnosis::MarkupDrift => {
                "pages loaded but no candidate selector matched; the site markup has probably changed"
            }
            Diagnosis::Unreachable => "the search page could not be loaded on any attempt",
        };
        f.write_str(msg)
    }
}

/// What the search pages looked like across all attempts.
#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    blocked_pages: u32,
    no_results_pages: u32,
    invalid_location_pages: u32,
    empty_pages: u32,
}

impl Signals {
    fn diagnose(&self) -> Diagnosis {
        if self.invalid_location_pages > 0 {
            Diagnosis::InvalidLocation
        } else if self.no_results_pages > 0 {
            Diagnosis::NoResults
        } else if self.blocked_pages > 0 {
            Diagnosis::AntiBot
        } else if self.empty_pages > 0 {
            Diagnosis::MarkupDrift
        } else {
            Diagnosis::Unreachable
        }
    }
}

struct DiscoveryState {
    found: Vec<Candidate>,
    seen: HashSet<String>,
    consecutive_blocked: u32,
    signals: Signals,
}

impl DiscoveryState {
    fn new() -> Self {
        Self {
            found: Vec::new(),
            seen: HashSet::new(),
            consecutive_blocked: 0,
            signals: Signals::default(),
        }
    }

    fn merge(&mut self, candidates: Vec<Candidate>, max: usize) -> usize {
        let before = self.found.len();
        for candidate in candidates {
            if self.found.len() >= max {
                break;
            }
            if self.seen.insert(candidate.id.clone()) {
                self.found.push(candidate);
            }
        }
        self.found.len() - before
    }
}

impl Pipeline {
    /// Discovery with retry-for-completeness. Returns at most
    /// `params.max_results` unique candidates; zero candidates after every
    /// attempt is an error carrying a diagnosis.
    pub(crate) async fn discover(
        &self,
        extractor: &dyn SiteExtractor,
        term: &str,
        params: &JobParams,
        settings: RunSettings,
        job_id: Uuid,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let max = params.max_results;

        if let Some(seeded) = extractor.seed_candidates(term) {
            let mut state = DiscoveryState::new();
            state.merge(seeded, max);
            if state.found.is_empty() {
                return Err(PipelineError::InvalidInput(format!("'{term}' is not a usable URL")));
            }
            return Ok(state.found);
        }

        let mut state = DiscoveryState::new();

        let attempts = self.config.discovery_attempts.max(1);
        let mut made = 0;
        for attempt in 1..=attempts {
            made = attempt;
            if attempt > 1 {
                progress
                    .report(
                        job_id,
                        &format!(
                            "Retrying discovery for '{term}' (attempt {attempt}/{attempts}, {} of {max} so far)",
                            state.found.len()
                        ),
                    )
                    .await;
                tokio::time::sleep(self.config.attempt_delay).await;
            }

            self.discovery_pass(extractor, term, params, settings, &mut state)
                .await?;

            if state.found.len() >= max {
                break;
            }
        }

        if state.found.is_empty() {
            return Err(PipelineError::NoCandidates {
                attempts: made,
                diagnosis: state.signals.diagnose(),
            });
        }
        Ok(state.found)
    }

    /// One walk over the search pages in a fresh session.
    async fn discovery_pass(
        &self,
        extractor: &dyn SiteExtractor,
        term: &str,
        params: &JobParams,
        settings: RunSettings,
        state: &mut DiscoveryState,
    ) -> Result<(), PipelineError> {
        let session = match self.sessions.new_session(settings.use_proxy).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Could not open discovery session for '{term}': {e}");
                return Ok(());
            }
        };

        let mut outcome = Outcome::Success;
        let result = async {
            for page in 0..extractor.pages().max(1) {
                let url = extractor.search_url(term, params.location.as_deref(), page);
                if let Err(e) = session.goto(&url).await {
                    tracing::warn!("Search page {url} failed: {e}");
                    outcome = Outcome::Failure;
                    break;
                }

                let report = self
                    .challenges
                    .negotiate(&*session, extractor.content_markers())
                    .await;
                let usable = match report.outcome {
                    BypassOutcome::Clear | BypassOutcome::Bypassed => true,
                    BypassOutcome::Failed if settings.policy == ChallengePolicy::Abort => {
                        outcome = Outcome::Failure;
                        return Err(PipelineError::ChallengeAborted { url });
                    }
                    BypassOutcome::Failed => settings.policy == ChallengePolicy::Proceed,
                    BypassOutcome::Blocked => false,
                };

                if !usable {
                    state.consecutive_blocked += 1;
                    state.signals.blocked_pages += 1;
                    outcome = Outcome::Failure;
                    tracing::warn!(
                        "Blocked on search page {url} ({} consecutive)",
                        state.consecutive_blocked
                    );
                    if state.consecutive_blocked >= self.config.blocked_page_limit {
                        return Err(PipelineError::Blocked {
                            term: term.to_string(),
                            pages: state.consecutive_blocked,
                        });
                    }
                    continue;
                }
                state.consecutive_blocked = 0;

                for _ in 0..extractor.scroll_steps() {
                    if let Err(e) = session.scroll_by(SCROLL_STEP_PX).await {
                        tracing::debug!("Scroll failed on {url}: {e}");
                        break;
                    }
                    tokio::time::sleep(self.config.scroll_pause).await;
                }

                let content = session.content().await?;
                let page_url = session.current_url().await.unwrap_or_else(|_| url.clone());
                let candidates = parse_page(extractor, &content, &page_url, self.config.min_strategy_yield);

                if candidates.is_empty() {
                    if rules::contains_any(&content, extractor.invalid_location_markers()) {
                        state.signals.invalid_location_pages += 1;
                    } else if rules::contains_any(&content, extractor.no_results_markers()) {
                        state.signals.no_results_pages += 1;
                    } else {
                        state.signals.empty_pages += 1;
                    }
                    // Later pages will not have what the first one lacked.
                    break;
                }

                let added = state.merge(candidates, params.max_results);
                tracing::debug!("Search page {url} added {added} new candidates");
                if state.found.len() >= params.max_results {
                    break;
                }
            }
            Ok(())
        }
        .await;

        if let Err(PipelineError::Session(e)) = &result {
            tracing::warn!("Discovery session for '{term}' failed: {e}");
            session.close(Outcome::Failure).await;
            return Ok(());
        }
        session.close(outcome).await;
        result
    }
}

fn parse_page(
    extractor: &dyn SiteExtractor,
    content: &str,
    page_url: &str,
    min_yield: usize,
) -> Vec<Candidate> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    rules::collect_candidates(content, extractor.candidate_strategies(), min_yield, &base)
}
