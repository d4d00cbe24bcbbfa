use url::Url;

use crate::error::ProxyError;

use super::CacheKey;

pub const FIXTURE_EXTENSION: &str = "yaml";

/// Canonical URI form of `raw`: IDNA host, percent-encoded non-ASCII, normalized scheme and
/// host case.
pub fn canonical_url(raw: &str) -> Result<String, ProxyError> {
    let parsed = Url::parse(raw).map_err(|source| ProxyError::MalformedUrl {
        url: raw.to_string(),
        source,
    })?;
    Ok(parsed.into())
}

/// File name under the fixture directory for `key`.
///
/// Everything outside `A-Z a-z 0-9 - _ . ~` is percent-encoded, including `/`, so the name
/// never contains a path separator.
pub fn to_file_name(key: &CacheKey) -> Result<String, ProxyError> {
    let url = canonical_url(key.url())?;
    let mut name = String::with_capacity(key.method().len() + url.len() + 34);
    name.push_str(key.method());
    name.push('-');
    name.push_str(&url);
    if let Some(digest) = key.body_digest() {
        name.push('-');
        name.push_str(digest);
    }
    Ok(format!(
        "{}.{FIXTURE_EXTENSION}",
        urlencoding::encode(&name)
    ))
}
