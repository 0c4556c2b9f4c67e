//! Table-driven field extraction.
//!
//! A field is an ordered chain of [`Rule`]s; the first rule that produces a
//! non-empty, well-typed value wins. All HTML handling stays in this module
//! and in synchronous functions, since `scraper::Html` is not `Send`.

use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use crate::error::FieldError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extract {
    Text,
    Attr(&'static str),
    Html,
}

/// One locator + extraction kind, optionally narrowed by a regex capture.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub selector: &'static str,
    pub extract: Extract,
    pub capture: Option<&'static str>,
}

impl Rule {
    pub const fn text(selector: &'static str) -> Self {
        Self {
            selector,
            extract: Extract::Text,
            capture: None,
        }
    }

    pub const fn attr(selector: &'static str, name: &'static str) -> Self {
        Self {
            selector,
            extract: Extract::Attr(name),
            capture: None,
        }
    }

    pub const fn html(selector: &'static str) -> Self {
        Self {
            selector,
            extract: Extract::Html,
            capture: None,
        }
    }

    /// Keep only the first capture group (or the whole match) of `pattern`.
    pub const fn capture(mut self, pattern: &'static str) -> Self {
        self.capture = Some(pattern);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Url,
    List,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub rules: &'static [Rule],
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind, rules: &'static [Rule]) -> Self {
        Self { name, kind, rules }
    }
}

/// How candidate identifiers are pulled from a search page.
#[derive(Debug, Clone, Copy)]
pub struct CandidateStrategy {
    pub selector: &'static str,
    /// Attribute holding the detail link, usually `href`.
    pub link_attr: &'static str,
    /// Pattern whose first group is the identifier; the resolved URL otherwise.
    pub id_pattern: Option<&'static str>,
}

impl CandidateStrategy {
    pub const fn link(selector: &'static str) -> Self {
        Self {
            selector,
            link_attr: "href",
            id_pattern: None,
        }
    }

    pub const fn id_from(mut self, pattern: &'static str) -> Self {
        self.id_pattern = Some(pattern);
        self
    }
}

/// A weak, deduplicated identifier pending detail extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub url: String,
}

pub struct FieldOutcome {
    pub name: &'static str,
    pub result: Result<Value, FieldError>,
}

/// Run every field chain against one detail page.
pub fn extract_fields(html: &str, fields: &[FieldSpec], base: &Url) -> Vec<FieldOutcome> {
    let doc = Html::parse_document(html);
    fields
        .iter()
        .map(|field| FieldOutcome {
            name: field.name,
            result: apply_chain(&doc, field, base),
        })
        .collect()
}

fn apply_chain(doc: &Html, field: &FieldSpec, base: &Url) -> Result<Value, FieldError> {
    let mut last_err = FieldError::NotFound {
        tried: field.rules.len(),
    };

    for rule in field.rules {
        match apply_rule(doc, rule, field.kind, base) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn apply_rule(doc: &Html, rule: &Rule, kind: FieldKind, base: &Url) -> Result<Option<Value>, FieldError> {
    let selector =
        Selector::parse(rule.selector).map_err(|_| FieldError::InvalidSelector(rule.selector.to_string()))?;
    let pattern = rule
        .capture
        .map(|p| Regex::new(p).map_err(|_| FieldError::InvalidPattern(p.to_string())))
        .transpose()?;

    let mut values = doc
        .select(&selector)
        .filter_map(|el| raw_value(el, rule.extract))
        .filter_map(|raw| narrow(&raw, pattern.as_ref()));

    match kind {
        FieldKind::List => {
            let items: Vec<Value> = values.map(Value::String).collect();
            Ok((!items.is_empty()).then_some(Value::Array(items)))
        }
        FieldKind::Text => Ok(values.next().map(Value::String)),
        FieldKind::Number => match values.next() {
            Some(raw) => parse_number(&raw).map(|n| Some(Value::from(n))).ok_or(FieldError::Unparseable {
                value: raw,
                expected: "number",
            }),
            None => Ok(None),
        },
        FieldKind::Url => match values.next() {
            Some(raw) => base
                .join(&raw)
                .map(|u| Some(Value::String(u.to_string())))
                .map_err(|_| FieldError::Unparseable {
                    value: raw,
                    expected: "url",
                }),
            None => Ok(None),
        },
    }
}

fn raw_value(el: ElementRef<'_>, extract: Extract) -> Option<String> {
    let value = match extract {
        Extract::Text => collapse_whitespace(&el.text().collect::<String>()),
        Extract::Attr(name) => el.value().attr(name)?.trim().to_string(),
        Extract::Html => el.inner_html().trim().to_string(),
    };
    (!value.is_empty()).then_some(value)
}

fn narrow(raw: &str, pattern: Option<&Regex>) -> Option<String> {
    let Some(re) = pattern else {
        return Some(raw.to_string());
    };
    let caps = re.captures(raw)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    let value = m.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First number in a display string: `"$1,299.99"` -> 1299.99,
/// `"4.5 out of 5 stars"` -> 4.5, `"(2,031)"` -> 2031.
pub fn parse_number(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let negative = raw[..start].ends_with('-');
    let token: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    let token = token.trim_end_matches('.');
    let value: f64 = token.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Pull candidates from a search page by trying each strategy in order until
/// at least `min_yield` unique candidates are known.
pub fn collect_candidates(
    html: &str,
    strategies: &[CandidateStrategy],
    min_yield: usize,
    base: &Url,
) -> Vec<Candidate> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for strategy in strategies {
        let Ok(selector) = Selector::parse(strategy.selector) else {
            tracing::warn!("Skipping invalid candidate selector '{}'", strategy.selector);
            continue;
        };
        let pattern = match strategy.id_pattern.map(Regex::new).transpose() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping candidate strategy with bad pattern: {e}");
                continue;
            }
        };

        for el in doc.select(&selector) {
            let Some(href) = el.value().attr(strategy.link_attr) else {
                continue;
            };
            let Ok(url) = base.join(href.trim()) else {
                continue;
            };
            let url = url.to_string();
            let id = match &pattern {
                Some(re) => match narrow(&url, Some(re)) {
                    Some(id) => id,
                    None => continue,
                },
                None => url.clone(),
            };
            if seen.insert(id.clone()) {
                found.push(Candidate { id, url });
            }
        }

        if found.len() >= min_yield {
            break;
        }
    }
    found
}

/// True when any of `markers` occurs in the page.
pub fn contains_any(content: &str, markers: &[&str]) -> bool {
    let lower = content.to_lowercase();
    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
}
