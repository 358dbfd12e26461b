//! HTTP page fetching with per-failure classification.
//!
//! The fetcher decides at the point of failure whether a page is worth
//! asking for again: timeouts, connection failures, throttling, server
//! errors and half-rendered pages are [`StageError::Transient`]; a listing
//! that is gone or a request the site will never serve is
//! [`StageError::Fatal`].

use std::time::Duration;

use async_trait::async_trait;
use listingflow_shared::{FetchConfig, ListingFlowError, Result, StageError};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

/// Source of raw listing pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> std::result::Result<String, StageError>;
}

/// reqwest-backed [`PageSource`].
pub struct PageFetcher {
    client: Client,
    min_content_len: usize,
}

impl PageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ListingFlowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            min_content_len: config.min_content_len,
        })
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> StageError {
    match status.as_u16() {
        404 | 410 => StageError::Fatal(format!("listing not found: HTTP {status}")),
        403 | 408 | 429 => StageError::Transient(format!("temporarily refused: HTTP {status}")),
        500..=599 => StageError::Transient(format!("server error: HTTP {status}")),
        400..=499 => StageError::Fatal(format!("request rejected: HTTP {status}")),
        _ => StageError::Transient(format!("unexpected status: HTTP {status}")),
    }
}

fn classify_send_error(url: &Url, e: &reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::Transient(format!("{url}: timed out"))
    } else if e.is_connect() {
        StageError::Transient(format!("{url}: connection failed: {e}"))
    } else {
        StageError::Transient(format!("{url}: {e}"))
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<String, StageError> {
        debug!(%url, "fetching listing page");

        let response = self
            .client
            .get(url.as_str())
            .header(reqwest::header::ACCEPT_LANGUAGE, "ru-RU,ru;q=0.9,en;q=0.5")
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| StageError::Transient(format!("{url}: body read failed: {e}")))?;

        let len = body.chars().count();
        if len < self.min_content_len {
            return Err(StageError::Transient(format!(
                "content too short: {len} chars (minimum {})",
                self.min_content_len
            )));
        }

        debug!(%url, status = status.as_u16(), len, "page fetched");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(min_content_len: usize) -> PageFetcher {
        PageFetcher::new(&FetchConfig {
            timeout_secs: 2,
            min_content_len,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND).kind(), "FatalError");
        assert_eq!(classify_status(StatusCode::GONE).kind(), "FatalError");
        assert_eq!(classify_status(StatusCode::BAD_REQUEST).kind(), "FatalError");
        assert_eq!(classify_status(StatusCode::FORBIDDEN).kind(), "TransientError");
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS).kind(), "TransientError");
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY).kind(), "TransientError");
    }

    #[tokio::test]
    async fn fetches_long_page() {
        let server = MockServer::start().await;
        let page = format!("<html><body>{}</body></html>", "x".repeat(2000));
        Mock::given(method("GET"))
            .and(path("/rent/flat/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page.clone()))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/rent/flat/1/", server.uri())).unwrap();
        let body = fetcher(1000).fetch(&url).await.unwrap();
        assert_eq!(body, page);
    }

    #[tokio::test]
    async fn short_page_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(1000).fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), "TransientError");
        assert!(err.to_string().contains("too short"));
    }

    #[tokio::test]
    async fn missing_listing_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(10).fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), "FatalError");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(10).fetch(&url).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_server_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher(1).fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), "TransientError");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments.
        let url = Url::parse("http://127.0.0.1:9/rent/flat/1/").unwrap();
        let err = fetcher(1).fetch(&url).await.unwrap_err();
        assert_eq!(err.kind(), "TransientError");
    }
}
