//! Listing parser trait, registry and built-in parsers.
//!
//! A parser declares which listing URLs it understands and turns a fetched
//! page into [`ListingFields`]. The registry is consulted once per envelope,
//! before any network I/O; there is no fallback parser.

mod cian;

use std::sync::LazyLock;

use listingflow_shared::{ListingFields, StageError};
use scraper::{Html, Selector};
use url::Url;

pub use cian::{CianRentParser, CianSaleParser};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A listing-site parser capability.
pub trait ListingParser: Send + Sync {
    /// Whether this parser handles listings at `url`.
    fn matches(&self, url: &Url) -> bool;

    /// Extract listing facts from a fetched page. `url`, `section`,
    /// `property_type` and `parser_name` are filled in by the caller.
    fn parse(&self, doc: &Html) -> Result<ListingFields, StageError>;

    /// Short parser name for tracing and the `parserName` field.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds registered parsers in priority order.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn ListingParser>>,
}

impl ParserRegistry {
    /// A registry with all built-in parsers.
    pub fn new() -> Self {
        Self {
            parsers: vec![Box::new(CianRentParser), Box::new(CianSaleParser)],
        }
    }

    /// A registry with no parsers.
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Add a parser after the existing ones.
    pub fn register(&mut self, parser: Box<dyn ListingParser>) {
        self.parsers.push(parser);
    }

    /// First parser whose predicate matches `url`.
    pub fn resolve(&self, url: &Url) -> Option<&dyn ListingParser> {
        self.parsers
            .iter()
            .find(|p| p.matches(url))
            .map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Page checks shared by all parsers
// ---------------------------------------------------------------------------

static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));

/// Reject pages that are not a rendered listing: no `<body>`, a captcha, or
/// a block notice. All of these clear up on their own, so they are transient.
pub fn check_page(raw: &str, doc: &Html) -> Result<(), StageError> {
    // html5ever always synthesizes a <body>, so look at the raw markup too.
    let has_body = raw.to_ascii_lowercase().contains("<body")
        && doc.select(&BODY_SEL).next().is_some();
    if !has_body {
        return Err(StageError::Transient("page has no <body>".into()));
    }

    let text = doc.root_element().text().collect::<String>().to_lowercase();
    if text.contains("captcha") {
        return Err(StageError::Transient("captcha page served".into()));
    }
    if text.contains("blocked") {
        return Err(StageError::Transient("client blocked by site".into()));
    }
    Ok(())
}

/// Whitespace-collapsed text of the first element matching `sel`.
pub(crate) fn select_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(|el| collapse(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

pub(crate) fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
