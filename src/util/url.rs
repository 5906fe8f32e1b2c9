use thiserror::Error;
use url::Url;

/// Errors from validating a feed URL given by the user.
#[derive(Error, Debug)]
pub enum UrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Parses a feed source URL.
///
/// Only `http` and `https` URLs with a host are accepted. Surrounding
/// whitespace is ignored. The returned URL's string form is what the store
/// uses as the feed's identity.
///
/// ```
/// use rssreader::util::parse_feed_url;
///
/// let url = parse_feed_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(parse_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn parse_feed_url(input: &str) -> Result<Url, UrlError> {
    let url = Url::parse(input.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlError::MissingHost),
    }
}
