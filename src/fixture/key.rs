use std::fmt;

use http::Method;
use md5::{Digest, Md5};

/// Identifies a logical request: `METHOD-URL`, or `METHOD-URL-DIGEST` when a body was sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: String,
    url: String,
    body_digest: Option<String>,
}

impl CacheKey {
    /// An empty body counts as no body.
    pub fn build(method: &Method, url: &str, body: Option<&[u8]>) -> Self {
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.to_string(),
            body_digest: body.filter(|bytes| !bytes.is_empty()).map(body_digest),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body_digest(&self) -> Option<&str> {
        self.body_digest.as_deref()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.method, self.url)?;
        if let Some(digest) = &self.body_digest {
            write!(f, "-{digest}")?;
        }
        Ok(())
    }
}

/// MD5 keeps digests compatible with fixture sets recorded by earlier tooling.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}
