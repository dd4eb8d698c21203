//! Feed HTTP client + issue persistence for itq.

mod store;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use itq_core::DecodeError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use thiserror::Error;
use tracing::{info_span, Instrument};

pub use store::{FsIssueStore, IssueStore, MemoryIssueStore, StoreError};

pub const CRATE_NAME: &str = "itq-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("could not decode feed: {0}")]
    Decode(#[from] DecodeError),
    #[error("feed reports {total_results} results with zero items per page")]
    Pagination { total_results: usize },
    #[error("first page holds {returned} of the {expected} results it should carry")]
    ShortPage { expected: usize, returned: usize },
    #[error("worker pool closed before the page was fetched")]
    PoolClosed,
}

/// The authenticated HTTP client every feed request goes through.
///
/// Timeouts and credentials are the implementation's business; callers only
/// see the response body or a [`FetchError`].
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedClient for HttpFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            Ok(resp.bytes().await?.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feeds/issues/p/chromium/issues/full"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<feed/>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let body = fetcher
            .get(&format!("{}/feeds/issues/p/chromium/issues/full", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(body, b"<feed/>");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .get(&format!("{}/anything", server.uri()))
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 503);
                assert!(url.ends_with("/anything"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn sends_bearer_token_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer s3cret"))
            .and(header("user-agent", "itq-test/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("itq-test/1".into()),
            bearer_token: Some("s3cret".into()),
            ..HttpClientConfig::default()
        })
        .expect("client");
        let body = fetcher.get(&server.uri()).await.expect("fetch");
        assert_eq!(body, b"ok");
    }

    #[test]
    fn decode_errors_convert_into_fetch_errors() {
        let err: FetchError = DecodeError::MissingFeed.into();
        assert!(matches!(err, FetchError::Decode(DecodeError::MissingFeed)));
        assert!(err.to_string().contains("could not decode feed"));
    }
}
