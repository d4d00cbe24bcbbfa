use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::util::timeout_with_context;

use super::codec::{Http1ResponseHead, read_line_with_timeout, status_forbids_body};
use super::limits::BodySizeTracker;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub(crate) fn determine_response_body_plan(
    method: &Method,
    head: &Http1ResponseHead,
) -> ResponseBodyPlan {
    if *method == Method::HEAD || status_forbids_body(head.status) {
        return ResponseBodyPlan::Empty;
    }
    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }
    match head.content_length {
        Some(0) => ResponseBodyPlan::Empty,
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    }
}

/// Reads exactly `length` bytes.
pub async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: u64,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut tracker = BodySizeTracker::new(max_body_size);
    let mut body = Vec::new();
    let mut remaining = length;
    let mut buffer = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            timeout_dur,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("connection closed early while reading body from {peer}");
        }
        tracker.record(read)?;
        body.extend_from_slice(&buffer[..read]);
        remaining -= read as u64;
    }
    Ok(body)
}

/// Decodes a chunked body, discarding chunk extensions and trailers.
pub async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut tracker = BodySizeTracker::new(max_body_size);
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let size_bytes =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    timeout_dur,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 || line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        tracker.record(chunk_size)?;
        let start = body.len();
        body.resize(start + chunk_size, 0);
        timeout_with_context(
            timeout_dur,
            reader.read_exact(&mut body[start..]),
            format!("reading chunk data from {peer}"),
        )
        .await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(
            timeout_dur,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }

    Ok(body)
}

pub async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut tracker = BodySizeTracker::new(max_body_size);
    let mut body = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = timeout_with_context(
            timeout_dur,
            reader.read(&mut buffer),
            format!("reading response body from upstream {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        tracker.record(read)?;
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body)
}

pub async fn read_response_body<S>(
    reader: &mut BufReader<S>,
    plan: ResponseBodyPlan,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    match plan {
        ResponseBodyPlan::Empty => Ok(Vec::new()),
        ResponseBodyPlan::Fixed(length) => {
            read_fixed_body(reader, length, timeout_dur, peer, max_body_size).await
        }
        ResponseBodyPlan::Chunked => {
            read_chunked_body(reader, timeout_dur, peer, max_body_size).await
        }
        ResponseBodyPlan::UntilClose => {
            read_until_close(reader, timeout_dur, peer, max_body_size).await
        }
    }
}

/// Status whose upstream response should be skipped while waiting for the final one.
pub(crate) fn is_interim(status: StatusCode) -> bool {
    status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS
}
