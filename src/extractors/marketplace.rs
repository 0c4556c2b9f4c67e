use crate::extractors::{SiteExtractor, encode_component};
use crate::pipeline::rules::{Candidate, CandidateStrategy, FieldKind, FieldSpec, Rule};

const DEFAULT_BASE_URL: &str = "https://www.amazon.com";
const ASIN: &str = r"/dp/([A-Z0-9]{10})";

static STRATEGIES: [CandidateStrategy; 3] = [
    CandidateStrategy::link(r#"div[data-component-type="s-search-result"] h2 a"#).id_from(ASIN),
    CandidateStrategy::link("a.a-link-normal.s-no-outline").id_from(ASIN),
    CandidateStrategy::link(r#"a[href*="/dp/"]"#).id_from(ASIN),
];

static TITLE: [Rule; 2] = [Rule::text("#productTitle"), Rule::text("h1")];
static PRICE: [Rule; 3] = [
    Rule::text(".a-price .a-offscreen"),
    Rule::text("#corePrice_feature_div .a-offscreen"),
    Rule::text("#priceblock_ourprice"),
];
static RATING: [Rule; 2] = [
    Rule::attr("#acrPopover", "title"),
    Rule::text("span.a-icon-alt"),
];
static REVIEWS: [Rule; 1] = [Rule::text("#acrCustomerReviewText")];
static IMAGE: [Rule; 2] = [
    Rule::attr("#landingImage", "src"),
    Rule::attr(r#"meta[property="og:image"]"#, "content"),
];
static BRAND: [Rule; 2] = [
    Rule::text("#bylineInfo").capture(r"(?:Visit the|Brand:)\s*(.+?)(?:\s+Store)?$"),
    Rule::text("#bylineInfo"),
];
static FEATURES: [Rule; 1] = [Rule::text("#feature-bullets li span")];

static FIELDS: [FieldSpec; 7] = [
    FieldSpec::new("title", FieldKind::Text, &TITLE),
    FieldSpec::new("price", FieldKind::Number, &PRICE),
    FieldSpec::new("rating", FieldKind::Number, &RATING),
    FieldSpec::new("reviews", FieldKind::Number, &REVIEWS),
    FieldSpec::new("image", FieldKind::Url, &IMAGE),
    FieldSpec::new("brand", FieldKind::Text, &BRAND),
    FieldSpec::new("features", FieldKind::List, &FEATURES),
];

/// Product search on an Amazon-style marketplace.
pub struct Marketplace {
    base_url: String,
}

impl Marketplace {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for Marketplace {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl SiteExtractor for Marketplace {
    fn site(&self) -> &str {
        "marketplace"
    }

    fn search_url(&self, term: &str, _location: Option<&str>, page: u32) -> String {
        format!(
            "{}/s?k={}&page={}",
            self.base_url,
            encode_component(term),
            page + 1
        )
    }

    fn pages(&self) -> u32 {
        2
    }

    fn scroll_steps(&self) -> u32 {
        2
    }

    fn candidate_strategies(&self) -> &[CandidateStrategy] {
        &STRATEGIES
    }

    fn detail_url(&self, candidate: &Candidate) -> String {
        format!("{}/dp/{}", self.base_url, candidate.id)
    }

    fn fields(&self) -> &[FieldSpec] {
        &FIELDS
    }

    fn content_markers(&self) -> &[&str] {
        &["s-search-result", "productTitle"]
    }

    fn no_results_markers(&self) -> &[&str] {
        &["No results for", "did not match any products"]
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::pipeline::rules::{collect_candidates, extract_fields};

    #[test]
    fn builds_paged_search_urls() {
        let m = Marketplace::new("https://shop.test/");
        assert_eq!(m.search_url("desk lamp", None, 0), "https://shop.test/s?k=desk%20lamp&page=1");
        assert_eq!(m.search_url("desk lamp", None, 1), "https://shop.test/s?k=desk%20lamp&page=2");
    }

    #[test]
    fn reads_asins_and_product_fields() {
        let m = Marketplace::new("https://shop.test");
        let base = Url::parse("https://shop.test/s?k=lamp").unwrap();
        let search = r#"
            <div data-component-type="s-search-result"><h2><a href="/Brass-Lamp/dp/B0ABCDEF12/ref=sr_1">Lamp</a></h2></div>
            <div data-component-type="s-search-result"><h2><a href="/sspa/click?x=1">Sponsored</a></h2></div>
        "#;
        let found = collect_candidates(search, m.candidate_strategies(), 1, &base);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "B0ABCDEF12");
        assert_eq!(m.detail_url(&found[0]), "https://shop.test/dp/B0ABCDEF12");

        let detail = r#"
            <span id="productTitle"> Brass Desk Lamp </span>
            <a id="bylineInfo">Visit the Brasshaus Store</a>
            <span class="a-price"><span class="a-offscreen">$39.99</span></span>
            <span id="acrPopover" title="4.6 out of 5 stars"></span>
            <span id="acrCustomerReviewText">1,204 ratings</span>
            <img id="landingImage" src="/images/lamp.jpg">
        "#;
        let base = Url::parse("https://shop.test/dp/B0ABCDEF12").unwrap();
        let out = extract_fields(detail, m.fields(), &base);
        let get = |name: &str| out.iter().find(|o| o.name == name).unwrap().result.clone();
        assert_eq!(get("title").unwrap(), "Brass Desk Lamp");
        assert_eq!(get("price").unwrap(), 39.99);
        assert_eq!(get("rating").unwrap(), 4.6);
        assert_eq!(get("reviews").unwrap(), 1204.0);
        assert_eq!(get("image").unwrap(), "https://shop.test/images/lamp.jpg");
        assert_eq!(get("brand").unwrap(), "Brasshaus");
        assert!(get("features").is_err());
    }
}
