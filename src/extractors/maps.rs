use crate::error::PipelineError;
use crate::extractors::{SiteExtractor, encode_component};
use crate::pipeline::JobParams;
use crate::pipeline::rules::{CandidateStrategy, FieldKind, FieldSpec, Rule};

const DEFAULT_BASE_URL: &str = "https://www.google.com";
const PLACE: &str = r"/maps/place/([^/?#]+)";

static STRATEGIES: [CandidateStrategy; 2] = [
    CandidateStrategy::link("a.hfpxzc").id_from(PLACE),
    CandidateStrategy::link(r#"div[role="feed"] a[href*="/maps/place/"]"#).id_from(PLACE),
];

static NAME: [Rule; 2] = [Rule::text("h1.DUwDvf"), Rule::text("h1")];
static RATING: [Rule; 2] = [
    Rule::text(r#"div.F7nice span[aria-hidden="true"]"#),
    Rule::attr(r#"span[role="img"][aria-label*="stars"]"#, "aria-label"),
];
static REVIEWS: [Rule; 2] = [
    Rule::attr(r#"div.F7nice span[aria-label*="reviews"]"#, "aria-label"),
    Rule::text(r#"button[jsaction*="reviewChart"]"#),
];
static CATEGORY: [Rule; 1] = [Rule::text("button.DkEaL")];
static ADDRESS: [Rule; 2] = [
    Rule::attr(r#"button[data-item-id="address"]"#, "aria-label").capture(r"Address:\s*(.+)"),
    Rule::text(r#"button[data-item-id="address"]"#),
];
static PHONE: [Rule; 1] = [
    Rule::attr(r#"button[data-item-id^="phone"]"#, "aria-label").capture(r"Phone:\s*(.+)"),
];
static WEBSITE: [Rule; 1] = [Rule::attr(r#"a[data-item-id="authority"]"#, "href")];

static FIELDS: [FieldSpec; 7] = [
    FieldSpec::new("name", FieldKind::Text, &NAME),
    FieldSpec::new("rating", FieldKind::Number, &RATING),
    FieldSpec::new("reviews", FieldKind::Number, &REVIEWS),
    FieldSpec::new("category", FieldKind::Text, &CATEGORY),
    FieldSpec::new("address", FieldKind::Text, &ADDRESS),
    FieldSpec::new("phone", FieldKind::Text, &PHONE),
    FieldSpec::new("website", FieldKind::Url, &WEBSITE),
];

/// Business directory search. Results load lazily in a scrolling feed.
pub struct Maps {
    base_url: String,
}

impl Maps {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for Maps {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl SiteExtractor for Maps {
    fn site(&self) -> &str {
        "maps"
    }

    fn validate(&self, params: &JobParams) -> Result<(), PipelineError> {
        if params.location.is_none() {
            return Err(PipelineError::MissingField("location"));
        }
        Ok(())
    }

    fn search_url(&self, term: &str, location: Option<&str>, _page: u32) -> String {
        let query = match location {
            Some(location) => format!("{term} in {location}"),
            None => term.to_string(),
        };
        format!("{}/maps/search/{}", self.base_url, encode_component(&query))
    }

    fn scroll_steps(&self) -> u32 {
        6
    }

    fn candidate_strategies(&self) -> &[CandidateStrategy] {
        &STRATEGIES
    }

    fn fields(&self) -> &[FieldSpec] {
        &FIELDS
    }

    fn content_markers(&self) -> &[&str] {
        &[r#"role="feed""#, "DUwDvf"]
    }

    fn no_results_markers(&self) -> &[&str] {
        &["No results found", "did not match any locations"]
    }

    fn invalid_location_markers(&self) -> &[&str] {
        &["can't find", "Make sure your search is spelled correctly"]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::pipeline::rules::extract_fields;

    #[test]
    fn location_is_required() {
        let maps = Maps::default();
        let params = JobParams::parse(&json!({ "keywords": ["dentist"] })).unwrap();
        let err = maps.validate(&params).unwrap_err();
        assert!(err.to_string().contains("location"));

        let params = JobParams::parse(&json!({ "keywords": ["dentist"], "location": "Austin, TX" })).unwrap();
        assert!(maps.validate(&params).is_ok());
        assert_eq!(
            maps.search_url("dentist", params.location.as_deref(), 0),
            "https://www.google.com/maps/search/dentist%20in%20Austin%2C%20TX"
        );
    }

    #[test]
    fn reads_place_details() {
        let html = r#"
            <h1 class="DUwDvf">Bright Smiles Dental</h1>
            <div class="F7nice"><span aria-hidden="true">4.8</span><span aria-label="312 reviews">(312)</span></div>
            <button class="DkEaL">Dentist</button>
            <button data-item-id="address" aria-label="Address: 100 Congress Ave, Austin, TX"></button>
            <button data-item-id="phone:tel:+15125550100" aria-label="Phone: (512) 555-0100"></button>
        "#;
        let base = Url::parse("https://www.google.com/maps/place/Bright+Smiles").unwrap();
        let out = extract_fields(html, Maps::default().fields(), &base);
        let get = |name: &str| out.iter().find(|o| o.name == name).unwrap().result.clone();

        assert_eq!(get("name").unwrap(), "Bright Smiles Dental");
        assert_eq!(get("rating").unwrap(), 4.8);
        assert_eq!(get("reviews").unwrap(), 312.0);
        assert_eq!(get("address").unwrap(), "100 Congress Ave, Austin, TX");
        assert_eq!(get("phone").unwrap(), "(512) 555-0100");
        assert!(get("website").is_err());
    }
}
