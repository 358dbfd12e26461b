//! Extraction: URL → parser → fetched page → [`ListingFields`].

use std::sync::Arc;

use listingflow_shared::{DealSection, ListingFields, PropertyType, StageError};
use scraper::Html;
use tracing::{debug, instrument};
use url::Url;

use crate::adapters::{ListingParser, ParserRegistry, check_page};
use crate::fetch::PageSource;

/// Resolves a parser, fetches the page and parses it.
#[derive(Clone)]
pub struct Extractor {
    registry: Arc<ParserRegistry>,
    source: Arc<dyn PageSource>,
}

impl Extractor {
    pub fn new(registry: Arc<ParserRegistry>, source: Arc<dyn PageSource>) -> Self {
        Self { registry, source }
    }

    /// Extract listing facts from `raw_url`.
    ///
    /// The parser is resolved before any network I/O, so an unsupported site
    /// fails with [`StageError::CapabilityNotFound`] without being fetched.
    #[instrument(skip_all, fields(url = %raw_url))]
    pub async fn extract(&self, raw_url: &str) -> Result<ListingFields, StageError> {
        let url = parse_listing_url(raw_url)?;

        let parser = self.registry.resolve(&url).ok_or_else(|| {
            StageError::CapabilityNotFound(format!(
                "no parser for host {}",
                url.host_str().unwrap_or_default()
            ))
        })?;
        let parser_name = parser.name().to_string();

        let raw = self.source.fetch(&url).await?;
        let mut fields = parse_page(parser, &raw)?;

        if fields.price.is_none() && fields.address.is_none() {
            return Err(StageError::Transient(
                "page parsed without price or address".into(),
            ));
        }

        fields.url = url.to_string();
        fields.section = derive_section(&url);
        fields.property_type = derive_property_type(&url);
        fields.parser_name = parser_name;

        debug!(
            parser = %fields.parser_name,
            price = ?fields.price,
            rooms = ?fields.rooms,
            "listing extracted"
        );
        Ok(fields)
    }
}

/// Parse an http(s) listing URL.
pub fn parse_listing_url(raw: &str) -> Result<Url, StageError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| StageError::Validation(format!("invalid url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(StageError::Validation(format!(
            "unsupported url scheme {other:?}"
        ))),
    }
}

// `Html` is not `Send`; keep it out of the async fn's state.
fn parse_page(parser: &dyn ListingParser, raw: &str) -> Result<ListingFields, StageError> {
    let doc = Html::parse_document(raw);
    check_page(raw, &doc)?;
    parser.parse(&doc)
}

fn path_segments_lower(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segs| {
            segs.filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Deal section from the URL path (`/rent/`, `/arenda/`, `/sale/`, `/prodazha/`).
pub fn derive_section(url: &Url) -> DealSection {
    let segments = path_segments_lower(url);
    let has = |words: &[&str]| segments.iter().any(|s| words.contains(&s.as_str()));

    if has(&["rent", "arenda", "snyat"]) {
        DealSection::Rent
    } else if has(&["sale", "prodazha", "kupit"]) {
        DealSection::Purchase
    } else {
        DealSection::Unknown
    }
}

/// Property type from the URL path.
pub fn derive_property_type(url: &Url) -> PropertyType {
    let segments = path_segments_lower(url);
    let has = |words: &[&str]| segments.iter().any(|s| words.contains(&s.as_str()));

    if has(&["flat", "kvartira", "kvartiry"]) {
        PropertyType::Flat
    } else if has(&["house", "dom", "doma"]) {
        PropertyType::House
    } else if has(&["commercial", "kommercheskaya"]) {
        PropertyType::Commercial
    } else {
        PropertyType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::fetch::PageFetcher;
    use listingflow_shared::FetchConfig;

    const FIXTURE: &str = include_str!("../fixtures/html/cian-rent-flat.html");

    /// Serves a fixed page and counts fetches.
    struct StaticSource {
        page: String,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn new(page: &str) -> Arc<Self> {
            Arc::new(Self {
                page: page.to_string(),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PageSource for StaticSource {
        async fn fetch(&self, _url: &Url) -> Result<String, StageError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.page.clone())
        }
    }

    /// Handles anything on 127.0.0.1 with the cian layout.
    struct LocalParser;

    impl ListingParser for LocalParser {
        fn matches(&self, url: &Url) -> bool {
            url.host_str() == Some("127.0.0.1")
        }

        fn parse(&self, doc: &Html) -> Result<ListingFields, StageError> {
            crate::adapters::CianRentParser.parse(doc)
        }

        fn name(&self) -> &str {
            "local"
        }
    }

    #[tokio::test]
    async fn extracts_cian_listing() {
        let source = StaticSource::new(FIXTURE);
        let extractor = Extractor::new(Arc::new(ParserRegistry::new()), source.clone());

        let fields = extractor
            .extract("https://spb.cian.ru/rent/flat/305548024/")
            .await
            .unwrap();

        assert_eq!(fields.url, "https://spb.cian.ru/rent/flat/305548024/");
        assert_eq!(fields.section, DealSection::Rent);
        assert_eq!(fields.property_type, PropertyType::Flat);
        assert_eq!(fields.parser_name, "cian_rent");
        assert_eq!(fields.price, Some(45_000));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_site_fails_before_fetch() {
        let source = StaticSource::new(FIXTURE);
        let extractor = Extractor::new(Arc::new(ParserRegistry::new()), source.clone());

        let err = extractor
            .extract("https://www.avito.ru/sankt-peterburg/kvartiry/2-k_123456789")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "CapabilityNotFoundError");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_url_is_validation_error() {
        let extractor = Extractor::new(Arc::new(ParserRegistry::new()), StaticSource::new(""));
        let err = extractor.extract("not a url").await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        let err = extractor.extract("ftp://cian.ru/rent/flat/1/").await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn empty_parse_is_transient() {
        let page = format!("<html><body><p>{}</p></body></html>", "загрузка ".repeat(200));
        let extractor = Extractor::new(Arc::new(ParserRegistry::new()), StaticSource::new(&page));

        let err = extractor
            .extract("https://spb.cian.ru/rent/flat/305548024/")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TransientError");
    }

    #[tokio::test]
    async fn extracts_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rent/flat/777001/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIXTURE))
            .mount(&server)
            .await;

        let mut registry = ParserRegistry::empty();
        registry.register(Box::new(LocalParser));
        let fetcher = PageFetcher::new(&FetchConfig::default()).unwrap();
        let extractor = Extractor::new(Arc::new(registry), Arc::new(fetcher));

        let fields = extractor
            .extract(&format!("{}/rent/flat/777001/", server.uri()))
            .await
            .unwrap();

        assert_eq!(fields.parser_name, "local");
        assert_eq!(fields.rooms, Some(2));
        assert_eq!(fields.section, DealSection::Rent);
    }

    #[tokio::test]
    async fn removed_listing_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let mut registry = ParserRegistry::empty();
        registry.register(Box::new(LocalParser));
        let fetcher = PageFetcher::new(&FetchConfig::default()).unwrap();
        let extractor = Extractor::new(Arc::new(registry), Arc::new(fetcher));

        let err = extractor
            .extract(&format!("{}/sale/flat/1/", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FatalError");
    }

    #[test]
    fn section_and_type_from_path() {
        let url = Url::parse("https://example.ru/arenda/kvartira/12345").unwrap();
        assert_eq!(derive_section(&url), DealSection::Rent);
        assert_eq!(derive_property_type(&url), PropertyType::Flat);

        let url = Url::parse("https://example.ru/prodazha/dom/12345").unwrap();
        assert_eq!(derive_section(&url), DealSection::Purchase);
        assert_eq!(derive_property_type(&url), PropertyType::House);

        let url = Url::parse("https://example.ru/sale/commercial/1").unwrap();
        assert_eq!(derive_property_type(&url), PropertyType::Commercial);

        let url = Url::parse("https://example.ru/offers/1").unwrap();
        assert_eq!(derive_section(&url), DealSection::Unknown);
        assert_eq!(derive_property_type(&url), PropertyType::Unknown);
    }
}
