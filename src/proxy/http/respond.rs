use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::fixture::ExchangeRecord;
use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

use super::codec::{ConnectionDirective, encode_record_head, status_forbids_body, status_line};

/// Sends a short plain-text response, then closes the connection and logs the request.
pub async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, status, body, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    log_builder
        .status(status)
        .bytes(bytes_in, bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "{}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status_line(status),
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    flush_with_timeout(stream, timeout_dur, "flushing response").await?;
    Ok(written)
}

/// Replays a record to the client. `head_only` suppresses the body but keeps its length.
/// Statuses that forbid a body never get one, whatever the record holds.
pub async fn write_record<S>(
    stream: &mut S,
    record: &ExchangeRecord,
    head_only: bool,
    connection: ConnectionDirective,
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let status = record.status();
    let body = record.body.as_bytes();
    let head = encode_record_head(status, &record.headers, body.len(), connection);
    write_all_with_timeout(stream, &head, timeout_dur, "writing response head").await?;
    let mut written = head.len();
    if !head_only && !body.is_empty() && !status_forbids_body(status) {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    flush_with_timeout(stream, timeout_dur, "flushing response").await?;
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}
