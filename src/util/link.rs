use thiserror::Error;
use url::Url;

/// Errors that can occur during feed link validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host to fetch from.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a configured feed link.
///
/// Feed links come from the operator's own configuration, so private and
/// loopback hosts are accepted. Only the shape is checked: an absolute
/// `http` or `https` URL with a host.
///
/// # Examples
///
/// ```
/// use gazette::util::validate_feed_link;
///
/// let url = validate_feed_link("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_feed_link("file:///etc/passwd").is_err());
/// assert!(validate_feed_link("example.com/feed.xml").is_err());
/// ```
pub fn validate_feed_link(link: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(link.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost),
    }
}
