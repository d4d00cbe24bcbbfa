use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::proxy::http::limits::{HeaderTooLarge, LineTooLong};

use super::headers::Http1HeaderAccumulator;
use super::line::read_line_with_deadline;

pub(crate) struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Http1HeaderAccumulator,
    pub request_line_bytes: usize,
    pub header_bytes: usize,
}

impl Http1RequestHead {
    /// Whether the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_10 => self.headers.wants_keep_alive(),
            _ => !self.headers.wants_connection_close(),
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.request_line_bytes + self.header_bytes
    }
}

/// Reads the next request head. `Ok(None)` means the client went away (or stayed idle past
/// `idle_timeout`) before starting a request.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let mut request_line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await
            .map_err(|err| line_overflow(err, "request line", max_header_bytes))?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line from {peer}");
    }

    let (method, target, version) = parse_request_line(trimmed)?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .filter(|left| *left > 0)
        .ok_or(HeaderTooLarge {
            section: "request head",
            limit: max_header_bytes,
        })?;
    let mut headers = Http1HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read = read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining)
            .await
            .map_err(|err| line_overflow(err, "request head", max_header_bytes))?;
        if read == 0 {
            bail!("connection closed while reading headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }
    let header_bytes = headers.total_bytes();

    Ok(Some(Http1RequestHead {
        method,
        target,
        version,
        headers,
        request_line_bytes,
        header_bytes,
    }))
}

fn line_overflow(err: anyhow::Error, section: &'static str, limit: usize) -> anyhow::Error {
    if err.downcast_ref::<LineTooLong>().is_some() {
        HeaderTooLarge { section, limit }.into()
    } else {
        err
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    Ok((method, target.to_string(), version))
}
