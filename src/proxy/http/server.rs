use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::error::ProxyError;
use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::metrics;
use crate::proxy::AppContext;
use crate::proxy::request::{ProxyRequest, effective_url};
use crate::util::TimedOut;

use super::body::read_fixed_body;
use super::codec::{ConnectionDirective, Http1RequestHead, read_http1_request_head};
use super::limits::{BodyTooLarge, HeaderTooLarge};
use super::respond::{respond_with_access_log, shutdown_stream, write_record};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

enum ClientDisposition {
    Continue,
    Close,
}

struct InflightGuard;

impl InflightGuard {
    fn enter() -> Self {
        metrics::inc_inflight();
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        metrics::dec_inflight();
    }
}

/// Serves requests from one client connection until it closes or a response forces a close.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_http1_request_head(
            &mut reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                let status = status_for_head_error(&err);
                debug!(peer = %peer, error = %err, "rejecting malformed request");
                respond_with_access_log(
                    reader.get_mut(),
                    status,
                    format!("{err}\n").as_bytes(),
                    client_timeout,
                    0,
                    start.elapsed(),
                    AccessLogBuilder::new(peer).error_reason("malformed_request"),
                )
                .await?;
                break;
            }
        };

        let _inflight = InflightGuard::enter();
        match handle_request(&mut reader, peer, &app, head, start).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    Ok(())
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: Http1RequestHead,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_body = app.settings.max_request_body_size;
    let head_bytes = head.total_bytes() as u64;
    let keep_alive = head.keep_alive();
    let Http1RequestHead {
        method,
        target,
        headers,
        ..
    } = head;
    let log = AccessLogBuilder::new(peer)
        .method(method.as_str())
        .url(target.clone());

    let rejection = if method == Method::CONNECT {
        Some((
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT tunnelling is not supported\n".to_string(),
            "connect_unsupported",
        ))
    } else if headers.is_chunked() {
        Some((
            StatusCode::NOT_IMPLEMENTED,
            "chunked request bodies are not supported\n".to_string(),
            "chunked_request_body",
        ))
    } else if headers.content_length().unwrap_or(0) > max_body {
        let err = ProxyError::BodyTooLarge { limit: max_body };
        Some((err.status(), format!("{err}\n"), err.kind()))
    } else {
        None
    };
    if let Some((status, message, reason)) = rejection {
        respond_with_access_log(
            reader.get_mut(),
            status,
            message.as_bytes(),
            client_timeout,
            head_bytes,
            start.elapsed(),
            log.error_reason(reason),
        )
        .await?;
        return Ok(ClientDisposition::Close);
    }
    let expect_continue = match headers.expect_continue() {
        Ok(expect) => expect,
        Err(err) => {
            respond_with_access_log(
                reader.get_mut(),
                StatusCode::EXPECTATION_FAILED,
                format!("{err}\n").as_bytes(),
                client_timeout,
                head_bytes,
                start.elapsed(),
                log.error_reason("expectation_failed"),
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let content_length = headers.content_length().unwrap_or(0);
    let host = headers.host().map(str::to_string);
    let headers = headers.into_headers();

    let body = if content_length > 0 {
        if expect_continue {
            write_all_with_timeout(
                reader.get_mut(),
                CONTINUE_RESPONSE,
                client_timeout,
                "writing 100 Continue",
            )
            .await?;
        }
        match read_fixed_body(reader, content_length as u64, client_timeout, peer, max_body).await
        {
            Ok(body) => body,
            Err(err) => {
                let (status, reason) = if err.downcast_ref::<BodyTooLarge>().is_some() {
                    (StatusCode::PAYLOAD_TOO_LARGE, "body_too_large")
                } else {
                    (StatusCode::BAD_REQUEST, "request_body_read")
                };
                debug!(peer = %peer, error = %err, "failed to read request body");
                respond_with_access_log(
                    reader.get_mut(),
                    status,
                    format!("{err}\n").as_bytes(),
                    client_timeout,
                    head_bytes,
                    start.elapsed(),
                    log.error_reason(reason),
                )
                .await?;
                return Ok(ClientDisposition::Close);
            }
        }
    } else {
        Vec::new()
    };
    let bytes_in = head_bytes + body.len() as u64;

    let url = match effective_url(&target, host.as_deref()) {
        Ok(url) => url,
        Err(err) => {
            return fail(reader, err, client_timeout, bytes_in, start, log).await;
        }
    };
    let log = log.url(url.clone());

    let request = ProxyRequest::new(method.clone(), url)
        .with_headers(headers)
        .with_body(body);
    let exchange = match app.handler.handle(request).await {
        Ok(exchange) => exchange,
        Err(err) => {
            return fail(reader, err, client_timeout, bytes_in, start, log).await;
        }
    };

    let directive = if keep_alive {
        ConnectionDirective::KeepAlive
    } else {
        ConnectionDirective::Close
    };
    let bytes_out = write_record(
        reader.get_mut(),
        &exchange.record,
        method == Method::HEAD,
        directive,
        client_timeout,
    )
    .await?;

    let mut log = log
        .cache_lookup(exchange.lookup.as_str())
        .status(exchange.record.status())
        .bytes(bytes_in, bytes_out as u64)
        .elapsed(start.elapsed());
    if let Some(path) = &exchange.stored_at {
        log = log.cache_store("stored").fixture(path.display().to_string());
    }
    log.log();

    if keep_alive {
        Ok(ClientDisposition::Continue)
    } else {
        shutdown_stream(reader.get_mut(), client_timeout).await?;
        Ok(ClientDisposition::Close)
    }
}

async fn fail<S>(
    reader: &mut BufReader<S>,
    err: ProxyError,
    client_timeout: std::time::Duration,
    bytes_in: u64,
    start: Instant,
    log: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    respond_with_access_log(
        reader.get_mut(),
        err.status(),
        format!("{err}\n").as_bytes(),
        client_timeout,
        bytes_in,
        start.elapsed(),
        log.error_reason(err.kind()).error_detail(err.to_string()),
    )
    .await?;
    Ok(ClientDisposition::Close)
}

fn status_for_head_error(err: &anyhow::Error) -> StatusCode {
    for cause in err.chain() {
        if cause.is::<HeaderTooLarge>() {
            return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE;
        }
        if cause.is::<TimedOut>() {
            return StatusCode::REQUEST_TIMEOUT;
        }
    }
    StatusCode::BAD_REQUEST
}
