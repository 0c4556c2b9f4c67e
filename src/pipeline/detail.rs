use futures::future::join_all;
use url::Url;
use uuid::Uuid;

use crate::challenge::{BypassOutcome, ChallengePolicy};
use crate::error::{FieldError, PipelineError, SessionError};
use crate::extractors::SiteExtractor;
use crate::models::ExtractedRecord;
use crate::pipeline::rules::{self, Candidate};
use crate::pipeline::{Pipeline, RunSettings};
use crate::proxy_pool::Outcome;
use crate::scheduler::ProgressSink;

/// Why one candidate produced no record. Never escalates past its batch,
/// except for an explicit challenge abort.
#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0} served a block page")]
    Blocked(String),

    #[error("challenge on {0} was not cleared")]
    Challenge(String),

    #[error("challenge on {0} was not cleared and policy is abort")]
    Abort(String),

    #[error("every field failed on {url}: {source}")]
    NoFields { url: String, source: FieldError },
}

impl ItemError {
    /// Whether the failure says something about the egress proxy.
    fn proxy_outcome(&self) -> Outcome {
        match self {
            ItemError::Session(_) | ItemError::Blocked(_) | ItemError::Challenge(_) | ItemError::Abort(_) => {
                Outcome::Failure
            }
            ItemError::NoFields { .. } => Outcome::Success,
        }
    }
}

#[derive(Debug, Default)]
pub struct DetailSummary {
    pub records: Vec<ExtractedRecord>,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl Pipeline {
    /// Extract every candidate in fixed-size batches. Items in a batch run
    /// concurrently and fail independently; batches run strictly in sequence
    /// with a politeness delay between them.
    pub(crate) async fn extract_details(
        &self,
        extractor: &dyn SiteExtractor,
        term: &str,
        candidates: Vec<Candidate>,
        settings: RunSettings,
        job_id: Uuid,
        progress: &dyn ProgressSink,
    ) -> Result<DetailSummary, PipelineError> {
        let mut summary = DetailSummary::default();
        let batches: Vec<&[Candidate]> = candidates.chunks(self.config.batch_size.max(1)).collect();
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|candidate| self.extract_one(extractor, term, candidate, settings)),
            )
            .await;

            let mut ok = 0;
            let mut abort = None;
            for (candidate, result) in batch.iter().zip(results) {
                match result {
                    Ok(record) => {
                        ok += 1;
                        summary.records.push(record);
                    }
                    Err(ItemError::Abort(url)) => abort = Some(url),
                    Err(e) => {
                        tracing::warn!("Detail extraction failed for {}: {e}", candidate.id);
                        summary.failed += 1;
                        summary.last_error = Some(e.to_string());
                    }
                }
            }
            if let Some(url) = abort {
                return Err(PipelineError::ChallengeAborted { url });
            }

            progress
                .report(
                    job_id,
                    &format!(
                        "Batch {}/{total} for '{term}': {ok} extracted, {} failed",
                        i + 1,
                        batch.len() - ok
                    ),
                )
                .await;
        }
        Ok(summary)
    }

    async fn extract_one(
        &self,
        extractor: &dyn SiteExtractor,
        term: &str,
        candidate: &Candidate,
        settings: RunSettings,
    ) -> Result<ExtractedRecord, ItemError> {
        let session = self.sessions.new_session(settings.use_proxy).await?;
        let url = extractor.detail_url(candidate);

        let result = async {
            session.goto(&url).await?;
            let report = self
                .challenges
                .negotiate(&*session, extractor.content_markers())
                .await;
            match report.outcome {
                BypassOutcome::Clear | BypassOutcome::Bypassed => {}
                BypassOutcome::Blocked => return Err(ItemError::Blocked(url.clone())),
                BypassOutcome::Failed => match settings.policy {
                    ChallengePolicy::Proceed => {
                        tracing::debug!("Parsing {url} despite unresolved challenge");
                    }
                    ChallengePolicy::Skip => return Err(ItemError::Challenge(url.clone())),
                    ChallengePolicy::Abort => return Err(ItemError::Abort(url.clone())),
                },
            }

            let content = session.content().await?;
            let page_url = session.current_url().await.unwrap_or_else(|_| url.clone());
            build_record(extractor, term, candidate, &page_url, &content)
        }
        .await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) => e.proxy_outcome(),
        };
        session.close(outcome).await;
        result
    }
}

fn build_record(
    extractor: &dyn SiteExtractor,
    term: &str,
    candidate: &Candidate,
    page_url: &str,
    content: &str,
) -> Result<ExtractedRecord, ItemError> {
    let base = Url::parse(page_url).map_err(|e| {
        ItemError::Session(SessionError::Navigation {
            url: page_url.to_string(),
            reason: e.to_string(),
        })
    })?;

    let outcomes = rules::extract_fields(content, extractor.fields(), &base);
    let total = outcomes.len();
    let mut fields = std::collections::BTreeMap::new();
    let mut missing_fields = Vec::new();
    let mut first_error = None;

    for outcome in outcomes {
        match outcome.result {
            Ok(value) => {
                fields.insert(outcome.name.to_string(), value);
            }
            Err(e) => {
                tracing::debug!("Field '{}' missing on {page_url}: {e}", outcome.name);
                missing_fields.push(outcome.name.to_string());
                first_error.get_or_insert(e);
            }
        }
    }

    if fields.is_empty() && total > 0 {
        return Err(ItemError::NoFields {
            url: page_url.to_string(),
            source: first_error.unwrap_or(FieldError::NotFound { tried: 0 }),
        });
    }

    let completeness = if total == 0 {
        1.0
    } else {
        fields.len() as f32 / total as f32
    };

    Ok(ExtractedRecord {
        candidate_id: candidate.id.clone(),
        search_term: term.to_string(),
        source_url: page_url.to_string(),
        fields,
        missing_fields,
        completeness,
    })
}
