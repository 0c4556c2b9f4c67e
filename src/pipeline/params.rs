use serde::Deserialize;
use serde_json::Value;

use crate::challenge::ChallengePolicy;
use crate::error::PipelineError;
use crate::models::ExtractedRecord;

pub const DEFAULT_MAX_RESULTS: usize = 20;
pub const MAX_RESULTS_CEILING: usize = 500;

/// Post-extraction predicates. A bound only rejects records whose value is
/// present and out of range; missing values pass.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_reviews: Option<f64>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.min_rating.is_none() && self.max_price.is_none() && self.min_reviews.is_none()
    }

    pub fn accepts(&self, record: &ExtractedRecord) -> bool {
        let at_least = |bound: Option<f64>, field: &str| match (bound, record.number(field)) {
            (Some(min), Some(v)) => v >= min,
            _ => true,
        };
        let at_most = |bound: Option<f64>, field: &str| match (bound, record.number(field)) {
            (Some(max), Some(v)) => v <= max,
            _ => true,
        };

        at_least(self.min_rating, "rating")
            && at_most(self.max_price, "price")
            && at_least(self.min_reviews, "reviews")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawParams {
    #[serde(default, alias = "search_terms", alias = "queries", alias = "urls")]
    keywords: Option<OneOrMany>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    max_results: Option<i64>,
    #[serde(default)]
    filters: Option<Filters>,
    #[serde(default)]
    min_rating: Option<f64>,
    #[serde(default)]
    max_price: Option<f64>,
    #[serde(default)]
    min_reviews: Option<f64>,
    #[serde(default)]
    use_proxy: Option<bool>,
    #[serde(default)]
    challenge_policy: Option<ChallengePolicy>,
}

/// Validated job input shared by every site.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub search_terms: Vec<String>,
    pub location: Option<String>,
    /// Cap on unique candidates per search term.
    pub max_results: usize,
    pub filters: Filters,
    pub use_proxy: Option<bool>,
    pub challenge_policy: Option<ChallengePolicy>,
}

impl JobParams {
    /// Parse and validate raw job input. Never touches the network.
    pub fn parse(input: &Value) -> Result<Self, PipelineError> {
        let raw: RawParams = serde_json::from_value(input.clone())
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        let search_terms: Vec<String> = match raw.keywords {
            Some(OneOrMany::One(term)) => vec![term],
            Some(OneOrMany::Many(terms)) => terms,
            None => Vec::new(),
        }
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

        if search_terms.is_empty() {
            return Err(PipelineError::MissingField("keywords"));
        }

        let max_results = match raw.max_results {
            None => DEFAULT_MAX_RESULTS,
            Some(n) if n < 1 => {
                return Err(PipelineError::InvalidInput(format!(
                    "max_results must be at least 1, got {n}"
                )));
            }
            Some(n) => usize::try_from(n).unwrap_or(MAX_RESULTS_CEILING).min(MAX_RESULTS_CEILING),
        };

        let nested = raw.filters.unwrap_or_default();
        let filters = Filters {
            min_rating: raw.min_rating.or(nested.min_rating),
            max_price: raw.max_price.or(nested.max_price),
            min_reviews: raw.min_reviews.or(nested.min_reviews),
        };

        Ok(JobParams {
            search_terms,
            location: raw
                .location
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            max_results,
            filters,
            use_proxy: raw.use_proxy,
            challenge_policy: raw.challenge_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn empty_keywords_name_the_missing_field() {
        let err = JobParams::parse(&json!({ "keywords": [] })).unwrap_err();
        assert!(matches!(err, PipelineError::MissingField("keywords")));
        assert!(err.to_string().contains("keywords"));

        let err = JobParams::parse(&json!({ "keywords": ["  ", ""] })).unwrap_err();
        assert!(matches!(err, PipelineError::MissingField(_)));

        assert!(JobParams::parse(&json!({})).is_err());
    }

    #[test]
    fn accepts_aliases_and_single_terms() {
        let p = JobParams::parse(&json!({ "search_terms": "desk lamp" })).unwrap();
        assert_eq!(p.search_terms, vec!["desk lamp"]);
        assert_eq!(p.max_results, DEFAULT_MAX_RESULTS);

        let p = JobParams::parse(&json!({ "urls": ["https://a.test", "https://b.test"] })).unwrap();
        assert_eq!(p.search_terms.len(), 2);
    }

    #[test]
    fn validates_result_cap() {
        assert!(matches!(
            JobParams::parse(&json!({ "keywords": ["x"], "max_results": 0 })),
            Err(PipelineError::InvalidInput(_))
        ));
        let p = JobParams::parse(&json!({ "keywords": ["x"], "max_results": 100000 })).unwrap();
        assert_eq!(p.max_results, MAX_RESULTS_CEILING);
        assert!(matches!(
            JobParams::parse(&json!({ "keywords": ["x"], "max_results": "lots" })),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn filters_merge_top_level_and_nested() {
        let p = JobParams::parse(&json!({
            "keywords": ["x"],
            "min_rating": 4.0,
            "filters": { "max_price": 50.0, "min_rating": 1.0 }
        }))
        .unwrap();
        assert_eq!(p.filters.min_rating, Some(4.0));
        assert_eq!(p.filters.max_price, Some(50.0));
        assert_eq!(p.filters.min_reviews, None);
    }

    #[test]
    fn filters_only_reject_present_violations() {
        let filters = Filters {
            min_rating: Some(4.0),
            max_price: Some(30.0),
            min_reviews: None,
        };
        let record = |fields: serde_json::Value| ExtractedRecord {
            candidate_id: "c".into(),
            search_term: "t".into(),
            source_url: "https://shop.test/c".into(),
            fields: serde_json::from_value::<BTreeMap<String, Value>>(fields).unwrap(),
            missing_fields: vec![],
            completeness: 1.0,
        };

        assert!(filters.accepts(&record(json!({ "rating": 4.5, "price": 20.0 }))));
        assert!(filters.accepts(&record(json!({ "title": "no numbers" }))));
        assert!(!filters.accepts(&record(json!({ "rating": 3.9 }))));
        assert!(!filters.accepts(&record(json!({ "rating": 4.9, "price": 31.0 }))));
    }
}
