use anyhow::{Result, anyhow, bail};
use http::header::HeaderName;

use crate::fixture::HeaderList;
use crate::proxy::headers::RequestHeaderSanitizer;

/// Collects request header lines in arrival order while validating framing headers.
pub(crate) struct Http1HeaderAccumulator {
    sanitizer: RequestHeaderSanitizer,
    headers: HeaderList,
}

impl Http1HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            sanitizer: RequestHeaderSanitizer::new(max_bytes),
            headers: HeaderList::new(),
        }
    }

    /// Returns `false` once the blank line ending the header section is consumed.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        let line_len = line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.sanitizer.reserve(line_len)?;
            return Ok(false);
        }
        if trimmed.starts_with([' ', '\t']) {
            bail!("obsolete header line folding is not supported");
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        self.sanitizer.record(name, value, line_len)?;
        self.headers.push(name, value);
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.sanitizer.host()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.sanitizer.content_length()
    }

    pub fn is_chunked(&self) -> bool {
        self.sanitizer.is_chunked()
    }

    pub fn into_headers(self) -> HeaderList {
        self.headers
    }

    pub fn expect_continue(&self) -> Result<bool> {
        let mut seen = false;
        for (name, value) in self.headers.iter() {
            if !name.eq_ignore_ascii_case("expect") {
                continue;
            }
            if seen {
                bail!("multiple Expect headers are not supported");
            }
            if !value.eq_ignore_ascii_case("100-continue") {
                bail!("unsupported Expect header value '{value}'");
            }
            seen = true;
        }
        Ok(seen)
    }

    pub fn total_bytes(&self) -> usize {
        self.sanitizer.total_bytes()
    }

    pub fn has_connection_token(&self, token: &str) -> bool {
        self.sanitizer.connection_tokens().contains(token)
    }

    pub fn wants_connection_close(&self) -> bool {
        self.has_connection_token("close")
    }

    pub fn wants_keep_alive(&self) -> bool {
        self.has_connection_token("keep-alive")
    }
}
