use http::Method;

use crate::error::ProxyError;
use crate::fixture::HeaderList;

/// A fully read inbound request, independent of the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

impl ProxyRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderList::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    /// Empty bodies are treated as no body at all.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = (!body.is_empty()).then_some(body);
        self
    }
}

/// Absolute URL for a request target.
///
/// Proxy-style absolute-form targets are used unchanged. Origin-form targets (`/path?q`) are
/// joined with the `Host` header.
pub fn effective_url(target: &str, host: Option<&str>) -> Result<String, ProxyError> {
    if target.starts_with('/') {
        let host = host
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProxyError::MalformedUrl {
                url: target.to_string(),
                source: url::ParseError::RelativeUrlWithoutBase,
            })?;
        return Ok(format!("http://{host}{target}"));
    }
    url::Url::parse(target).map_err(|source| ProxyError::MalformedUrl {
        url: target.to_string(),
        source,
    })?;
    Ok(target.to_string())
}
