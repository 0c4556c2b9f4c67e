// Site extractors: per-site strategy tables consumed by the generic pipeline.
// Each extractor only describes *where* things are; navigation, retries,
// batching and challenge handling live in `pipeline`.

pub mod job_board;
pub mod maps;
pub mod marketplace;
pub mod metadata;

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::PipelineError;
use crate::pipeline::JobParams;
use crate::pipeline::rules::{Candidate, CandidateStrategy, FieldSpec};

pub use job_board::JobBoard;
pub use maps::Maps;
pub use marketplace::Marketplace;
pub use metadata::Metadata;

/// Characters that encodeURIComponent does NOT encode.
/// RFC 3986 unreserved: A-Z a-z 0-9 - _ . ! ~ * ' ( )
const ENCODE_URI_COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub(crate) fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, ENCODE_URI_COMPONENT_SET).to_string()
}

/// Extraction-strategy table for one target site.
pub trait SiteExtractor: Send + Sync {
    /// Identifier matching `Job::site`.
    fn site(&self) -> &str;

    /// Site-specific input checks on top of the shared ones.
    fn validate(&self, _params: &JobParams) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Search view for `term`, zero-based `page`.
    fn search_url(&self, term: &str, location: Option<&str>, page: u32) -> String;

    fn pages(&self) -> u32 {
        1
    }

    /// Scroll steps applied to surface lazily loaded results.
    fn scroll_steps(&self) -> u32 {
        0
    }

    /// Ordered fallbacks for locating candidates on a search page.
    fn candidate_strategies(&self) -> &[CandidateStrategy];

    fn detail_url(&self, candidate: &Candidate) -> String {
        candidate.url.clone()
    }

    fn fields(&self) -> &[FieldSpec];

    /// Strings whose presence proves a real (non-challenge) page loaded.
    fn content_markers(&self) -> &[&str];

    fn no_results_markers(&self) -> &[&str] {
        &[]
    }

    fn invalid_location_markers(&self) -> &[&str] {
        &[]
    }

    /// Sites whose search terms are already candidates skip discovery.
    fn seed_candidates(&self, _term: &str) -> Option<Vec<Candidate>> {
        None
    }
}

/// Site identifier -> extractor.
#[derive(Default)]
pub struct Registry {
    extractors: HashMap<String, Arc<dyn SiteExtractor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in sites with their public base URLs.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Marketplace::default()));
        registry.register(Arc::new(Maps::default()));
        registry.register(Arc::new(JobBoard::default()));
        registry.register(Arc::new(Metadata));
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn SiteExtractor>) {
        self.extractors
            .insert(extractor.site().to_string(), extractor);
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteExtractor>> {
        self.extractors.get(site).cloned()
    }

    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.extractors.keys().cloned().collect();
        sites.sort();
        sites
    }
}
