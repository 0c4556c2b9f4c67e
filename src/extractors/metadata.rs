use url::Url;

use crate::error::PipelineError;
use crate::extractors::SiteExtractor;
use crate::pipeline::JobParams;
use crate::pipeline::rules::{Candidate, CandidateStrategy, FieldKind, FieldSpec, Rule};

static TITLE: [Rule; 2] = [
    Rule::attr(r#"meta[property="og:title"]"#, "content"),
    Rule::text("title"),
];
static DESCRIPTION: [Rule; 2] = [
    Rule::attr(r#"meta[name="description"]"#, "content"),
    Rule::attr(r#"meta[property="og:description"]"#, "content"),
];
static CANONICAL: [Rule; 2] = [
    Rule::attr(r#"link[rel="canonical"]"#, "href"),
    Rule::attr(r#"meta[property="og:url"]"#, "content"),
];
static IMAGE: [Rule; 2] = [
    Rule::attr(r#"meta[property="og:image"]"#, "content"),
    Rule::attr(r#"meta[name="twitter:image"]"#, "content"),
];
static SITE_NAME: [Rule; 1] = [Rule::attr(r#"meta[property="og:site_name"]"#, "content")];
static KEYWORDS: [Rule; 1] = [Rule::attr(r#"meta[name="keywords"]"#, "content")];
static LANGUAGE: [Rule; 1] = [Rule::attr("html", "lang")];
static HEADINGS: [Rule; 1] = [Rule::text("h1")];

static FIELDS: [FieldSpec; 8] = [
    FieldSpec::new("title", FieldKind::Text, &TITLE),
    FieldSpec::new("description", FieldKind::Text, &DESCRIPTION),
    FieldSpec::new("canonical_url", FieldKind::Url, &CANONICAL),
    FieldSpec::new("image", FieldKind::Url, &IMAGE),
    FieldSpec::new("site_name", FieldKind::Text, &SITE_NAME),
    FieldSpec::new("keywords", FieldKind::Text, &KEYWORDS),
    FieldSpec::new("language", FieldKind::Text, &LANGUAGE),
    FieldSpec::new("headings", FieldKind::List, &HEADINGS),
];

/// Page metadata for arbitrary URLs. Every search term is a URL and is its
/// own candidate, so discovery is skipped.
pub struct Metadata;

fn web_url(term: &str) -> Option<Url> {
    Url::parse(term)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
}

impl SiteExtractor for Metadata {
    fn site(&self) -> &str {
        "metadata"
    }

    fn validate(&self, params: &JobParams) -> Result<(), PipelineError> {
        match params.search_terms.iter().find(|t| web_url(t).is_none()) {
            Some(bad) => Err(PipelineError::InvalidInput(format!(
                "'{bad}' is not an http(s) URL"
            ))),
            None => Ok(()),
        }
    }

    fn search_url(&self, term: &str, _location: Option<&str>, _page: u32) -> String {
        term.to_string()
    }

    fn candidate_strategies(&self) -> &[CandidateStrategy] {
        &[]
    }

    fn fields(&self) -> &[FieldSpec] {
        &FIELDS
    }

    fn content_markers(&self) -> &[&str] {
        &[]
    }

    fn seed_candidates(&self, term: &str) -> Option<Vec<Candidate>> {
        let candidates = web_url(term)
            .map(|url| {
                vec![Candidate {
                    id: url.to_string(),
                    url: url.to_string(),
                }]
            })
            .unwrap_or_default();
        Some(candidates)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::pipeline::rules::extract_fields;

    #[test]
    fn only_web_urls_are_accepted() {
        let ok = JobParams::parse(&json!({ "urls": ["https://example.org/a"] })).unwrap();
        assert!(Metadata.validate(&ok).is_ok());

        let bad = JobParams::parse(&json!({ "urls": ["https://example.org", "mailto:x@y.z"] })).unwrap();
        assert!(matches!(Metadata.validate(&bad), Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn terms_seed_themselves() {
        let seeded = Metadata.seed_candidates("https://example.org/a").unwrap();
        assert_eq!(seeded[0].url, "https://example.org/a");
        assert!(Metadata.seed_candidates("not a url").unwrap().is_empty());
    }

    #[test]
    fn reads_open_graph_metadata() {
        let html = r#"<html lang="en"><head>
            <title>Fallback</title>
            <meta property="og:title" content="Field Notes">
            <meta name="description" content="Weekly notes.">
            <link rel="canonical" href="/notes">
        </head><body><h1>Notes</h1><h1>Archive</h1></body></html>"#;
        let base = Url::parse("https://example.org/notes?utm=x").unwrap();
        let out = extract_fields(html, Metadata.fields(), &base);
        let get = |name: &str| out.iter().find(|o| o.name == name).unwrap().result.clone();

        assert_eq!(get("title").unwrap(), "Field Notes");
        assert_eq!(get("description").unwrap(), "Weekly notes.");
        assert_eq!(get("canonical_url").unwrap(), "https://example.org/notes");
        assert_eq!(get("language").unwrap(), "en");
        assert_eq!(get("headings").unwrap(), json!(["Notes", "Archive"]));
        assert!(get("image").is_err());
    }
}
