use std::collections::HashSet;

use anyhow::{Context, Result, bail, ensure};

use crate::fixture::HeaderList;
use crate::proxy::http::limits::HeaderTooLarge;

/// Request headers allowed to reach the upstream.
pub const OUTGOING_ALLOW_LIST: &[&str] = &[
    "Accept",
    "Content-Type",
    "X-Amz-Date",
    "X-Amz-Security-Token",
    "User-Agent",
    "Content-Length",
    "Authorization",
];

/// Upstream response headers that get recorded and replayed.
pub const INCOMING_ALLOW_LIST: &[&str] = &["Content-Type", "Location", "Server"];

/// Keeps the entries whose name appears verbatim in `allow_list`, in their original order.
pub fn filter(headers: &HeaderList, allow_list: &[&str]) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| allow_list.contains(name))
        .collect()
}

pub fn outgoing(headers: &HeaderList) -> HeaderList {
    filter(headers, OUTGOING_ALLOW_LIST)
}

pub fn incoming(headers: &HeaderList) -> HeaderList {
    filter(headers, INCOMING_ALLOW_LIST)
}

/// Headers that describe a single connection or its framing. The proxy writes these itself and
/// never copies them from a record.
pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "content-length"
            | "upgrade"
            | "trailer"
            | "te"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    Other,
}

pub fn classify_request_header(name: &str) -> HeaderDisposition {
    match name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" => HeaderDisposition::ContentLength,
        "transfer-encoding" => HeaderDisposition::TransferEncoding,
        _ => HeaderDisposition::Other,
    }
}

const HEADER_OVERHEAD: usize = 4; // ': ' plus CRLF

/// Tracks the framing-relevant headers of an inbound request and enforces the header byte
/// budget. Every header still ends up in the request's [`HeaderList`]; this only validates.
#[derive(Debug, Clone)]
pub struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    connection_tokens: HashSet<String>,
    transfer_encoding_seen: bool,
}

impl RequestHeaderSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
            connection_tokens: HashSet::new(),
            transfer_encoding_seen: false,
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .filter(|consumed| *consumed <= self.max_bytes)
            .ok_or(HeaderTooLarge {
                section: "header section",
                limit: self.max_bytes,
            })?;
        Ok(())
    }

    pub fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<()> {
        self.reserve(byte_len)?;

        let name_lower = name.to_ascii_lowercase();
        match classify_request_header(&name_lower) {
            HeaderDisposition::Connection => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.connection_tokens.insert(token.to_ascii_lowercase());
                    }
                }
            }
            HeaderDisposition::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                ensure!(!value.is_empty(), "Host header must not be empty");
                self.host = Some(value.to_string());
            }
            HeaderDisposition::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                match self.content_length {
                    Some(existing) if existing != length => {
                        bail!("conflicting Content-Length headers")
                    }
                    _ => self.content_length = Some(length),
                }
            }
            HeaderDisposition::TransferEncoding => {
                if self.transfer_encoding_seen {
                    bail!("duplicate Transfer-Encoding header");
                }
                self.transfer_encoding_seen = true;
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                let chunked = value
                    .rsplit(',')
                    .next()
                    .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false);
                ensure!(chunked, "unsupported Transfer-Encoding '{value}'");
                self.chunked = true;
            }
            HeaderDisposition::Other => {}
        }
        Ok(())
    }

    pub fn record_name_value(&mut self, name: &str, value: &str) -> Result<()> {
        let byte_len = name
            .len()
            .checked_add(value.len())
            .and_then(|len| len.checked_add(HEADER_OVERHEAD))
            .ok_or(HeaderTooLarge {
                section: "header section",
                limit: self.max_bytes,
            })?;
        self.record(name, value, byte_len)
    }

    /// Host header value with its original casing.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn connection_tokens(&self) -> &HashSet<String> {
        &self.connection_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, &str)]) -> HeaderList {
        entries.iter().copied().collect()
    }

    #[test]
    fn outgoing_drops_cookies_and_keeps_accept() {
        let filtered = outgoing(&list(&[("Accept", "*/*"), ("Cookie", "secret=1")]));
        assert_eq!(filtered, list(&[("Accept", "*/*")]));
    }

    #[test]
    fn filter_preserves_order_and_duplicates() {
        let headers = list(&[
            ("User-Agent", "curl/8"),
            ("X-Trace", "abc"),
            ("Accept", "text/html"),
            ("Authorization", "Bearer t"),
            ("Accept", "application/json"),
        ]);
        let filtered = outgoing(&headers);
        assert_eq!(
            filtered,
            list(&[
                ("User-Agent", "curl/8"),
                ("Accept", "text/html"),
                ("Authorization", "Bearer t"),
                ("Accept", "application/json"),
            ])
        );
    }

    #[test]
    fn names_are_matched_case_sensitively() {
        let filtered = incoming(&list(&[
            ("content-type", "text/plain"),
            ("Content-Type", "text/html"),
            ("SERVER", "x"),
            ("Location", "/next"),
            ("Set-Cookie", "a=1"),
        ]));
        assert_eq!(
            filtered,
            list(&[("Content-Type", "text/html"), ("Location", "/next")])
        );
    }

    #[test]
    fn empty_input_filters_to_empty() {
        assert!(outgoing(&HeaderList::new()).is_empty());
        assert!(incoming(&HeaderList::new()).is_empty());
    }

    #[test]
    fn hop_by_hop_detection_ignores_case() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("content-length"));
        assert!(is_hop_by_hop("Connection"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Location"));
    }

    #[test]
    fn rejects_duplicate_host() {
        let mut sanitizer = RequestHeaderSanitizer::new(256);
        sanitizer.record("Host", "example.com", 16).unwrap();
        let err = sanitizer
            .record("Host", "other.example.com", 32)
            .expect_err("expected duplicate host to error");
        assert!(
            err.to_string().contains("duplicate Host"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn repeated_identical_content_length_is_accepted() {
        let mut sanitizer = RequestHeaderSanitizer::new(256);
        sanitizer.record_name_value("Content-Length", "5").unwrap();
        sanitizer.record_name_value("Content-Length", "5").unwrap();
        assert_eq!(sanitizer.content_length(), Some(5));
        let err = sanitizer
            .record_name_value("Content-Length", "6")
            .expect_err("conflicting lengths");
        assert!(err.to_string().contains("conflicting Content-Length"));
    }

    #[test]
    fn rejects_conflicting_content_length_and_transfer_encoding() {
        let mut sanitizer = RequestHeaderSanitizer::new(256);
        sanitizer.record("Transfer-Encoding", "chunked", 32).unwrap();
        assert!(sanitizer.is_chunked());
        let err = sanitizer
            .record("Content-Length", "10", 24)
            .expect_err("expected conflict to error");
        assert!(
            err.to_string()
                .contains("must not include both Content-Length and Transfer-Encoding"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn rejects_exceeding_max_bytes() {
        let mut sanitizer = RequestHeaderSanitizer::new(16);
        let err = sanitizer
            .record("User-Agent", "toolong", 32)
            .expect_err("expected oversize header to error");
        assert!(
            err.to_string()
                .contains("header section exceeds configured limit"),
            "unexpected error: {err:?}"
        );
        assert!(err.downcast_ref::<HeaderTooLarge>().is_some());
    }

    #[test]
    fn tracks_connection_tokens() {
        let mut sanitizer = RequestHeaderSanitizer::new(128);
        sanitizer
            .record("Connection", "keep-alive, Close", 32)
            .unwrap();
        assert!(sanitizer.connection_tokens().contains("close"));
        assert!(sanitizer.connection_tokens().contains("keep-alive"));
    }
}
