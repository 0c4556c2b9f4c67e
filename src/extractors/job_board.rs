use crate::extractors::{SiteExtractor, encode_component};
use crate::pipeline::rules::{Candidate, CandidateStrategy, FieldKind, FieldSpec, Rule};

const DEFAULT_BASE_URL: &str = "https://www.indeed.com";
const PAGE_SIZE: u32 = 10;
const JOB_KEY: &str = r"[?&]jk=([0-9a-f]+)";

static STRATEGIES: [CandidateStrategy; 2] = [
    CandidateStrategy::link("a.jcs-JobTitle").id_from(JOB_KEY),
    CandidateStrategy::link("h2.jobTitle a").id_from(JOB_KEY),
];

static TITLE: [Rule; 2] = [
    Rule::text("h1.jobsearch-JobInfoHeader-title"),
    Rule::text("h1"),
];
static COMPANY: [Rule; 2] = [
    Rule::text(r#"div[data-testid="inlineHeader-companyName"]"#),
    Rule::text(r#"[data-company-name="true"]"#),
];
static LOCATION: [Rule; 2] = [
    Rule::text(r#"div[data-testid="inlineHeader-companyLocation"]"#),
    Rule::text(r#"div[data-testid="job-location"]"#),
];
static SALARY: [Rule; 2] = [
    Rule::text("#salaryInfoAndJobType span"),
    Rule::text(r#"div[data-testid="attribute_snippet_testid"]"#).capture(r"(\$[\d,]+.*)"),
];
static JOB_TYPE: [Rule; 1] = [
    Rule::text("#salaryInfoAndJobType span").capture(r"(Full-time|Part-time|Contract|Temporary|Internship)"),
];
static DESCRIPTION: [Rule; 1] = [Rule::text("#jobDescriptionText")];

static FIELDS: [FieldSpec; 6] = [
    FieldSpec::new("title", FieldKind::Text, &TITLE),
    FieldSpec::new("company", FieldKind::Text, &COMPANY),
    FieldSpec::new("location", FieldKind::Text, &LOCATION),
    FieldSpec::new("salary", FieldKind::Text, &SALARY),
    FieldSpec::new("job_type", FieldKind::Text, &JOB_TYPE),
    FieldSpec::new("description", FieldKind::Text, &DESCRIPTION),
];

/// Job board search, paged ten results at a time.
pub struct JobBoard {
    base_url: String,
}

impl JobBoard {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl SiteExtractor for JobBoard {
    fn site(&self) -> &str {
        "jobs"
    }

    fn search_url(&self, term: &str, location: Option<&str>, page: u32) -> String {
        format!(
            "{}/jobs?q={}&l={}&start={}",
            self.base_url,
            encode_component(term),
            encode_component(location.unwrap_or("")),
            page * PAGE_SIZE
        )
    }

    fn pages(&self) -> u32 {
        3
    }

    fn candidate_strategies(&self) -> &[CandidateStrategy] {
        &STRATEGIES
    }

    fn detail_url(&self, candidate: &Candidate) -> String {
        format!("{}/viewjob?jk={}", self.base_url, candidate.id)
    }

    fn fields(&self) -> &[FieldSpec] {
        &FIELDS
    }

    fn content_markers(&self) -> &[&str] {
        &["jobsearch-", "jobDescriptionText"]
    }

    fn no_results_markers(&self) -> &[&str] {
        &["did not match any jobs"]
    }

    fn invalid_location_markers(&self) -> &[&str] {
        &["we couldn't find this location", "Please enter a valid location"]
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::pipeline::rules::collect_candidates;

    #[test]
    fn pages_by_offset() {
        let board = JobBoard::new("https://jobs.test");
        assert_eq!(
            board.search_url("rust engineer", Some("Remote"), 2),
            "https://jobs.test/jobs?q=rust%20engineer&l=Remote&start=20"
        );
    }

    #[test]
    fn job_keys_become_candidates() {
        let board = JobBoard::new("https://jobs.test");
        let html = r#"
            <h2 class="jobTitle"><a href="/rc/clk?jk=9f3a1c&amp;from=serp">Rust Engineer</a></h2>
            <h2 class="jobTitle"><a href="/rc/clk?jk=77b0de">Backend Engineer</a></h2>
        "#;
        let base = Url::parse("https://jobs.test/jobs?q=rust").unwrap();
        let found = collect_candidates(html, board.candidate_strategies(), 1, &base);
        let ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["9f3a1c", "77b0de"]);
        assert_eq!(board.detail_url(&found[0]), "https://jobs.test/viewjob?jk=9f3a1c");
    }
}
