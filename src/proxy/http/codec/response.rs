use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::{HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::fixture::HeaderList;
use crate::proxy::headers::is_hop_by_hop;
use crate::proxy::http::limits::{HeaderBudget, LineTooLong};

use super::line::{read_lenient_line_with_timeout, read_line_with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionDirective {
    KeepAlive,
    Close,
}

impl ConnectionDirective {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionDirective::KeepAlive => "keep-alive",
            ConnectionDirective::Close => "close",
        }
    }
}

pub(crate) struct Http1ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Statuses that never carry a message body.
pub(crate) fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Encodes the head of a replayed record. Framing and connection headers from the record are
/// dropped and replaced with the proxy's own; anything that is not a legal header is skipped.
pub(crate) fn encode_record_head(
    status: StatusCode,
    headers: &HeaderList,
    body_len: usize,
    connection: ConnectionDirective,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(status_line(status).as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if HeaderName::from_bytes(name.as_bytes()).is_err()
            || HeaderValue::from_str(value).is_err()
        {
            warn!(header = name, "skipping recorded header that is not valid HTTP");
            continue;
        }
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if !status_forbids_body(status) {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(body_len.to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Connection: ");
    buffer.extend_from_slice(connection.as_str().as_bytes());
    buffer.extend_from_slice(b"\r\n\r\n");
    buffer
}

pub(crate) fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut status_line = String::new();
    let mut budget = HeaderBudget::new(max_header_bytes, "upstream response head")?;

    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget.record(bytes)?;
    let trimmed = status_line.trim_end_matches(['\r', '\n']);
    let (_, status, _) = parse_http1_status_line(trimmed)?;

    let mut headers = HeaderList::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;

    let mut header_line = String::new();
    loop {
        let limit = budget.remaining().max(1);
        // Header values may carry obs-text; only the status line has to be UTF-8.
        let read =
            read_lenient_line_with_timeout(reader, &mut header_line, timeout_dur, peer, limit)
                .await
                .map_err(|err| {
                    if err.downcast_ref::<LineTooLong>().is_some() {
                        budget.exceeded().into()
                    } else {
                        err
                    }
                })?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget.record(read)?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            match content_length {
                Some(existing) if existing != parsed => {
                    bail!("conflicting Content-Length headers from upstream")
                }
                _ => content_length = Some(parsed),
            }
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        headers.push(name, value);
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }
    if transfer_encoding_present && !chunked {
        bail!("unsupported upstream Transfer-Encoding");
    }

    Ok(Http1ResponseHead {
        status,
        headers,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}
