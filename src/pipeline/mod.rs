//! Generic two-phase extraction engine shared by every site extractor:
//! discovery (with completeness retries), batched detail extraction, then
//! filtering and aggregation across search terms.

pub mod detail;
pub mod discovery;
pub mod params;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::challenge::{ChallengeHandler, ChallengePolicy};
use crate::error::PipelineError;
use crate::extractors::{Registry, SiteExtractor};
use crate::models::{ExtractedRecord, Job};
use crate::scheduler::{JobExecutor, ProgressSink};
use crate::session::SessionProvider;

pub use params::{Filters, JobParams};
pub use rules::Candidate;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Items extracted concurrently per batch; clamped to 3..=5.
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub discovery_attempts: u32,
    pub attempt_delay: Duration,
    /// Consecutive blocked search pages that abort discovery.
    pub blocked_page_limit: u32,
    /// A candidate strategy yielding fewer than this falls through to the next.
    pub min_strategy_yield: usize,
    pub scroll_pause: Duration,
    pub use_proxies: bool,
    pub challenge_policy: ChallengePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_delay: Duration::from_millis(1500),
            discovery_attempts: 3,
            attempt_delay: Duration::from_secs(2),
            blocked_page_limit: 2,
            min_strategy_yield: 3,
            scroll_pause: Duration::from_millis(800),
            use_proxies: true,
            challenge_policy: ChallengePolicy::Skip,
        }
    }
}

impl PipelineConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(3, 5);
        self
    }
}

pub struct Pipeline {
    registry: Arc<Registry>,
    sessions: Arc<SessionProvider>,
    challenges: Arc<ChallengeHandler>,
    config: PipelineConfig,
}

/// Per-job settings after job input overrides are applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunSettings {
    pub(crate) use_proxy: bool,
    pub(crate) policy: ChallengePolicy,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionProvider>,
        challenges: Arc<ChallengeHandler>,
        config: PipelineConfig,
    ) -> Self {
        let config = PipelineConfig {
            batch_size: config.batch_size.clamp(3, 5),
            ..config
        };
        Self {
            registry,
            sessions,
            challenges,
            config,
        }
    }

    fn resolve(&self, job: &Job) -> Result<(Arc<dyn SiteExtractor>, JobParams), PipelineError> {
        let extractor = self
            .registry
            .get(&job.site)
            .ok_or_else(|| PipelineError::UnknownSite(job.site.clone()))?;
        let params = JobParams::parse(&job.input)?;
        extractor.validate(&params)?;
        Ok((extractor, params))
    }
}

#[async_trait]
impl JobExecutor for Pipeline {
    fn validate(&self, job: &Job) -> Result<(), PipelineError> {
        self.resolve(job).map(|_| ())
    }

    async fn execute(
        &self,
        job: &Job,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Vec<ExtractedRecord>, PipelineError> {
        let (extractor, params) = self.resolve(job)?;
        let settings = RunSettings {
            use_proxy: params.use_proxy.unwrap_or(self.config.use_proxies),
            policy: params.challenge_policy.unwrap_or(self.config.challenge_policy),
        };

        let mut results = Vec::new();
        let mut total_candidates = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;
        let mut last_diagnosis = None;

        for term in &params.search_terms {
            progress
                .report(job.id, &format!("Discovering candidates for '{term}'"))
                .await;
            let candidates = match self
                .discover(extractor.as_ref(), term, &params, settings, job.id, progress.as_ref())
                .await
            {
                Ok(candidates) => candidates,
                Err(PipelineError::NoCandidates { attempts, diagnosis }) => {
                    progress
                        .report(
                            job.id,
                            &format!("No candidates for '{term}' after {attempts} attempt(s): {diagnosis}"),
                        )
                        .await;
                    last_diagnosis = Some((attempts, diagnosis));
                    continue;
                }
                Err(e) => return Err(e),
            };
            total_candidates += candidates.len();
            progress
                .report(job.id, &format!("Found {} candidates for '{term}'", candidates.len()))
                .await;

            let summary = self
                .extract_details(extractor.as_ref(), term, candidates, settings, job.id, progress.as_ref())
                .await?;
            let extracted = summary.records.len();
            succeeded += extracted;
            failed += summary.failed;
            if summary.last_error.is_some() {
                last_error = summary.last_error;
            }
            let kept: Vec<ExtractedRecord> = summary
                .records
                .into_iter()
                .filter(|r| params.filters.accepts(r))
                .collect();
            if !params.filters.is_empty() {
                progress
                    .report(
                        job.id,
                        &format!("Kept {} of {extracted} records for '{term}' after filters", kept.len()),
                    )
                    .await;
            }
            results.extend(kept);
        }

        if total_candidates == 0 {
            let (attempts, diagnosis) =
                last_diagnosis.unwrap_or((self.config.discovery_attempts, discovery::Diagnosis::NoResults));
            return Err(PipelineError::NoCandidates { attempts, diagnosis });
        }
        if succeeded == 0 && failed > 0 {
            return Err(PipelineError::AllItemsFailed {
                count: failed,
                last_error: last_error.unwrap_or_default(),
            });
        }

        progress
            .report(
                job.id,
                &format!(
                    "Extraction finished: {} records ({} items failed)",
                    results.len(),
                    failed
                ),
            )
            .await;
        Ok(results)
    }
}
