use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use super::completion::CompletionContext;
use super::model::RawFeed;
use super::parser::{parse_feed, ParseError, ParseOutcome};
use super::selector::ParserSelector;

/// Default bound on a whole request, headers and body included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default response size cap.
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Transport-level failures. All are retried on the next refresh cycle.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Errors that can occur while fetching a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The document could not be retrieved; the parser was never invoked.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// The document was retrieved but could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Tunables for [`FetchClient`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_feed_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_feed_size: DEFAULT_MAX_FEED_SIZE,
        }
    }
}

/// Retrieves feed documents and runs them through the selected parser.
///
/// Cloning is cheap: the HTTP client and the selector table are shared.
#[derive(Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    selector: Arc<ParserSelector>,
    config: FetchConfig,
}

impl FetchClient {
    /// Builds a client with its own HTTP connection pool.
    pub fn new(config: FetchConfig, selector: ParserSelector) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rssreader/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, config, selector))
    }

    /// Wraps an existing HTTP client (caller controls configuration).
    pub fn with_client(
        client: reqwest::Client,
        config: FetchConfig,
        selector: ParserSelector,
    ) -> Self {
        Self {
            client,
            selector: Arc::new(selector),
            config,
        }
    }

    /// Fetches and parses `url`.
    ///
    /// Performs a single GET bounded by the configured timeout. Transport
    /// failures, timeouts and non-2xx statuses yield [`FetchError::Network`]
    /// without invoking the parser.
    pub async fn fetch(&self, url: &Url) -> Result<RawFeed, FetchError> {
        let bytes = tokio::time::timeout(self.config.timeout, self.retrieve(url))
            .await
            .map_err(|_| NetworkError::Timeout)??;

        let variant = self.selector.select(url).clone();
        tracing::debug!(
            feed = %url,
            variant = %variant.name,
            bytes = bytes.len(),
            "Parsing feed document"
        );

        let source = url.clone();
        let ParseOutcome { feed, skipped } =
            tokio::task::spawn_blocking(move || parse_feed(&bytes, &source, &variant))
                .await
                .map_err(|e| ParseError::Malformed(format!("parser task failed: {e}")))??;

        if skipped > 0 {
            tracing::warn!(
                feed = %url,
                skipped = skipped,
                "Items without a link or a parseable publish date skipped"
            );
        }

        Ok(feed)
    }

    /// Spawns a fetch and delivers its result through `context`.
    ///
    /// Returns immediately. `callback` runs exactly once per call, with either
    /// the parsed feed or the error.
    pub fn fetch_with_callback<F>(
        &self,
        url: Url,
        context: CompletionContext,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<RawFeed, FetchError>) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.fetch(&url).await;
            context.dispatch(Box::new(move || callback(result)));
        })
    }

    async fn retrieve(&self, url: &Url) -> Result<Vec<u8>, NetworkError> {
        let response = self.client.get(url.as_str()).send().await?;

        if !response.status().is_success() {
            return Err(NetworkError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, self.config.max_feed_size).await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, NetworkError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(NetworkError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(NetworkError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(NetworkError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::completion::CompletionQueue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Test</title>
    <item><guid>1</guid><link>https://example.com/1</link><title>Test</title>
    <pubDate>Tue, 10 Nov 2015 18:10:09 +0000</pubDate></item>
</channel></rss>"#;

    fn client() -> FetchClient {
        FetchClient::with_client(
            reqwest::Client::new(),
            FetchConfig::default(),
            ParserSelector::default(),
        )
    }

    async fn serve(template: ResponseTemplate) -> (MockServer, Url) {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(template)
            .mount(&mock_server)
            .await;
        let url = Url::parse(&format!("{}/feed", mock_server.uri())).unwrap();
        (mock_server, url)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let (_server, url) = serve(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .insert_header("Content-Type", "application/xml"),
        )
        .await;

        let feed = client().fetch(&url).await.unwrap();
        assert_eq!(feed.title.as_deref(), Some("Test"));
        assert_eq!(feed.source_url, url);
        assert_eq!(feed.items.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_404_is_network_error() {
        let (_server, url) = serve(ResponseTemplate::new(404)).await;

        match client().fetch(&url).await.unwrap_err() {
            FetchError::Network(NetworkError::HttpStatus(404)) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // MockServer instances are pooled and keep listening after drop, so
        // release a port the OS handed out instead
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = Url::parse(&format!("http://127.0.0.1:{port}/feed")).unwrap();

        match client().fetch(&url).await.unwrap_err() {
            FetchError::Network(NetworkError::Request(_)) => {}
            e => panic!("Expected Request error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let (_server, url) = serve(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_millis(500)),
        )
        .await;

        let fetcher = FetchClient::with_client(
            reqwest::Client::new(),
            FetchConfig {
                timeout: Duration::from_millis(50),
                ..FetchConfig::default()
            },
            ParserSelector::default(),
        );

        match fetcher.fetch(&url).await.unwrap_err() {
            FetchError::Network(NetworkError::Timeout) => {}
            e => panic!("Expected Timeout, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let (_server, url) = serve(ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;

        let fetcher = FetchClient::with_client(
            reqwest::Client::new(),
            FetchConfig {
                max_feed_size: 16,
                ..FetchConfig::default()
            },
            ParserSelector::default(),
        );

        match fetcher.fetch(&url).await.unwrap_err() {
            FetchError::Network(NetworkError::ResponseTooLarge) => {}
            e => panic!("Expected ResponseTooLarge, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let (_server, url) = serve(ResponseTemplate::new(200).set_body_string("<not valid xml")).await;

        match client().fetch(&url).await.unwrap_err() {
            FetchError::Parse(ParseError::Malformed(_)) => {}
            e => panic!("Expected Parse error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_empty_feed_success() {
        let empty_rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel></channel></rss>"#;
        let (_server, url) = serve(ResponseTemplate::new(200).set_body_string(empty_rss)).await;

        let feed = client().fetch(&url).await.unwrap();
        assert!(feed.items.is_empty());
    }

    #[tokio::test]
    async fn test_callback_delivered_once_through_queue() {
        let (_server, url) = serve(ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        let mut queue = CompletionQueue::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = client().fetch_with_callback(url, queue.context(), move |result| {
            let _ = tx.send(result.map(|feed| feed.items.len()));
        });
        handle.await.unwrap();

        // Nothing is delivered until the host loop drains the queue
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_callback_receives_errors() {
        let (_server, url) = serve(ResponseTemplate::new(500)).await;
        let (tx, rx) = tokio::sync::oneshot::channel();

        client().fetch_with_callback(url, CompletionContext::Inline, move |result| {
            let _ = tx.send(result.is_err());
        });

        assert!(rx.await.unwrap());
    }
}
