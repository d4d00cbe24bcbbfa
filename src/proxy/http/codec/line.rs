use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::proxy::http::limits::LineTooLong;
use crate::util::{remaining_until, timeout_with_context};

/// How the bytes of a completed line become text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineDecoding {
    /// UTF-8 only; anything else is an error.
    Strict,
    /// UTF-8 when valid, otherwise ISO-8859-1 so obs-text bytes survive.
    Latin1Fallback,
}

/// Reads one `\n`-terminated line, failing once `deadline` passes. Returns 0 on a clean EOF.
pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let context = format!("reading line from {peer}");
    read_line(reader, buf, peer, max_len, LineDecoding::Strict, || {
        remaining_until(deadline, &context)
    })
    .await
}

/// Reads one `\n`-terminated line, allowing `timeout_dur` for each read from the socket.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line(
        reader,
        buf,
        peer,
        max_len,
        LineDecoding::Strict,
        || Ok(timeout_dur),
    )
    .await
}

/// Like [`read_line_with_timeout`], but never fails on non-UTF-8 bytes. The returned length is
/// the number of bytes consumed from the socket.
pub(crate) async fn read_lenient_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line(
        reader,
        buf,
        peer,
        max_len,
        LineDecoding::Latin1Fallback,
        || Ok(timeout_dur),
    )
    .await
}

async fn read_line<S, F>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    peer: SocketAddr,
    max_len: usize,
    decoding: LineDecoding,
    mut next_timeout: F,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
    F: FnMut() -> Result<Duration>,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let wait = next_timeout()?;
        let available = timeout_with_context(wait, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            return Err(LineTooLong {
                peer,
                limit: max_len,
            }
            .into());
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let len = collected.len();
    *buf = match (String::from_utf8(collected), decoding) {
        (Ok(text), _) => text,
        (Err(err), LineDecoding::Latin1Fallback) => {
            err.into_bytes().into_iter().map(char::from).collect()
        }
        (Err(_), LineDecoding::Strict) => bail!("line from {peer} contained invalid bytes"),
    };
    Ok(len)
}
