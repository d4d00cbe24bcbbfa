use std::fmt;
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// Which side of the proxy produced a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOrigin {
    Request,
    Upstream,
}

impl fmt::Display for BodyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyOrigin::Request => f.write_str("request"),
            BodyOrigin::Upstream => f.write_str("upstream response"),
        }
    }
}

/// Failures that end a single proxied request. None of them outlive the request that hit them.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed URL '{url}': {source}")]
    MalformedUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("fixture store I/O failed for {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fixture {} is corrupt: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("upstream {url} unavailable: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    #[error("{origin} body is not valid UTF-8")]
    InvalidBodyEncoding { origin: BodyOrigin },

    #[error("request body exceeds configured limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl ProxyError {
    /// Status returned to the original caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedUrl { .. } => StatusCode::BAD_REQUEST,
            ProxyError::StoreIo { .. } | ProxyError::CorruptRecord { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidBodyEncoding {
                origin: BodyOrigin::Request,
            } => StatusCode::BAD_REQUEST,
            ProxyError::InvalidBodyEncoding {
                origin: BodyOrigin::Upstream,
            } => StatusCode::BAD_GATEWAY,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Stable label used in access logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedUrl { .. } => "malformed_url",
            ProxyError::StoreIo { .. } => "store_io",
            ProxyError::CorruptRecord { .. } => "corrupt_record",
            ProxyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ProxyError::InvalidBodyEncoding { .. } => "invalid_body_encoding",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_side_failures_map_to_4xx() {
        let malformed = ProxyError::MalformedUrl {
            url: "not a url".to_string(),
            source: url::ParseError::RelativeUrlWithoutBase,
        };
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let request_body = ProxyError::InvalidBodyEncoding {
            origin: BodyOrigin::Request,
        };
        assert_eq!(request_body.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            request_body.to_string(),
            "request body is not valid UTF-8"
        );

        let too_large = ProxyError::BodyTooLarge { limit: 16 };
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn store_and_upstream_failures_map_to_5xx() {
        let io = ProxyError::StoreIo {
            path: PathBuf::from("fixtures/x.yaml"),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(io.kind(), "store_io");

        let corrupt = ProxyError::CorruptRecord {
            path: PathBuf::from("fixtures/x.yaml"),
            reason: "missing field `code`".to_string(),
        };
        assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(corrupt.to_string().contains("missing field `code`"));

        let upstream = ProxyError::UpstreamUnavailable {
            url: "http://example.test/".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);

        let upstream_body = ProxyError::InvalidBodyEncoding {
            origin: BodyOrigin::Upstream,
        };
        assert_eq!(upstream_body.status(), StatusCode::BAD_GATEWAY);
    }
}
