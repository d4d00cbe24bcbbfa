use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use http::{Method, StatusCode};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;
use url::{Host, Url};

use crate::error::ProxyError;
use crate::fixture::HeaderList;
use crate::io_util::{flush_with_timeout, shutdown_with_timeout, write_all_with_timeout};
use crate::settings::Settings;
use crate::util::timeout_with_context;

use super::http::body::{determine_response_body_plan, is_interim, read_response_body};
use super::http::codec::read_http1_response_head;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

/// Performs exactly one outbound exchange per call. Redirects are returned as-is.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Where and how to send a request, derived from its absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub host_header: String,
    pub path_and_query: String,
}

impl UpstreamTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid upstream URL '{raw}'"))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => bail!("unsupported upstream scheme '{other}'"),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => bail!("upstream URL '{raw}' has no host"),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("upstream URL '{raw}' has no port"))?;
        let authority = url.host_str().unwrap_or(host.as_str());
        let host_header = match url.port() {
            Some(explicit) => format!("{authority}:{explicit}"),
            None => authority.to_string(),
        };
        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        Ok(Self {
            scheme,
            host,
            port,
            host_header,
            path_and_query,
        })
    }
}

pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamLimits {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl UpstreamLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.upstream_connect_timeout(),
            io_timeout: settings.upstream_timeout(),
            max_header_bytes: settings.max_response_header_size,
            max_body_bytes: settings.max_response_body_size,
        }
    }
}

/// HTTP/1.1 client that opens a fresh connection for every call.
#[derive(Clone)]
pub struct UpstreamClient {
    tls: Arc<ClientConfig>,
    limits: UpstreamLimits,
}

impl UpstreamClient {
    pub fn new(tls: Arc<ClientConfig>, limits: UpstreamLimits) -> Self {
        Self { tls, limits }
    }

    async fn exchange(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let target = UpstreamTarget::parse(&request.url)?;
        let (tcp, peer) = self.connect(&target).await?;
        let mut stream = match target.scheme {
            Scheme::Http => UpstreamIo::Plain(tcp),
            Scheme::Https => {
                let server_name = ServerName::try_from(target.host.clone())
                    .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", target.host))?;
                let connector = TlsConnector::from(self.tls.clone());
                let tls = timeout(
                    self.limits.connect_timeout,
                    connector.connect(server_name, tcp),
                )
                .await
                .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
                .with_context(|| {
                    format!(
                        "failed to establish TLS with upstream {}:{}",
                        target.host, target.port
                    )
                })?;
                UpstreamIo::Tls(Box::new(tls))
            }
        };

        let head = build_request_head(&request.method, &target, &request.headers, request.body.as_deref());
        let io_timeout = self.limits.io_timeout;
        write_all_with_timeout(&mut stream, &head, io_timeout, "writing request head to upstream")
            .await?;
        if let Some(body) = &request.body {
            write_all_with_timeout(&mut stream, body, io_timeout, "writing request body to upstream")
                .await?;
        }
        flush_with_timeout(&mut stream, io_timeout, "flushing request to upstream").await?;

        let mut reader = BufReader::new(stream);
        let head = loop {
            let head = read_http1_response_head(
                &mut reader,
                io_timeout,
                peer,
                self.limits.max_header_bytes,
            )
            .await?;
            if is_interim(head.status) {
                debug!(status = head.status.as_u16(), "skipping interim upstream response");
                continue;
            }
            if head.status == StatusCode::SWITCHING_PROTOCOLS {
                bail!("upstream switched protocols unexpectedly");
            }
            break head;
        };
        let plan = determine_response_body_plan(&request.method, &head);
        let body = read_response_body(
            &mut reader,
            plan,
            io_timeout,
            peer,
            self.limits.max_body_bytes,
        )
        .await?;

        let mut stream = reader.into_inner();
        if let Err(err) = shutdown_with_timeout(&mut stream, io_timeout).await {
            debug!(peer = %peer, error = %err, "failed to shut down upstream stream");
        }

        Ok(UpstreamResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }

    async fn connect(&self, target: &UpstreamTarget) -> Result<(TcpStream, SocketAddr)> {
        let addrs: Vec<SocketAddr> = timeout_with_context(
            self.limits.connect_timeout,
            lookup_host((target.host.as_str(), target.port)),
            format!("resolving {}", target.host),
        )
        .await?
        .collect();
        connect_to_addrs(&addrs, self.limits.connect_timeout).await
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        self.exchange(&request)
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable {
                url: request.url.clone(),
                reason: format!("{err:#}"),
            })
    }
}

/// Attempt to connect to the supplied socket addresses in order.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow!(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

/// Request line plus headers. The caller's headers go out verbatim; `Host` and framing are
/// added here and the connection is always closed after one exchange.
pub fn build_request_head(
    method: &Method,
    target: &UpstreamTarget,
    headers: &HeaderList,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.path_and_query.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buffer.extend_from_slice(target.host_header.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if !headers.contains_ignore_case("content-length") {
        let length = body.map(|bytes| bytes.len()).unwrap_or(0);
        if length > 0 || !matches!(*method, Method::GET | Method::HEAD) {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
    }

    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_from_absolute_url() {
        let target = UpstreamTarget::parse("http://example.test/a/b?x=1#frag").unwrap();
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.host, "example.test");
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header, "example.test");
        assert_eq!(target.path_and_query, "/a/b?x=1");
    }

    #[test]
    fn target_keeps_explicit_port_and_ipv6_brackets() {
        let target = UpstreamTarget::parse("https://[fd00::1]:8443/data").unwrap();
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.host, "fd00::1");
        assert_eq!(target.port, 8443);
        assert_eq!(target.host_header, "[fd00::1]:8443");

        let target = UpstreamTarget::parse("https://example.test").unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(target.path_and_query, "/");
    }

    #[test]
    fn target_rejects_other_schemes() {
        let err = UpstreamTarget::parse("ftp://example.test/file").unwrap_err();
        assert!(err.to_string().contains("unsupported upstream scheme"));
    }

    #[test]
    fn request_head_carries_host_headers_and_length() {
        let target = UpstreamTarget::parse("http://example.test:8080/submit").unwrap();
        let headers: HeaderList = [("Content-Type", "application/x-www-form-urlencoded")]
            .into_iter()
            .collect();
        let head = build_request_head(&Method::POST, &target, &headers, Some(b"x=1"));
        assert_eq!(
            String::from_utf8(head).unwrap(),
            "POST /submit HTTP/1.1\r\nHost: example.test:8080\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 3\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn request_head_keeps_client_content_length() {
        let target = UpstreamTarget::parse("http://example.test/").unwrap();
        let headers: HeaderList = [("Content-Length", "3")].into_iter().collect();
        let head = build_request_head(&Method::PUT, &target, &headers, Some(b"abc"));
        let text = String::from_utf8(head).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn bodiless_get_has_no_length_but_post_does() {
        let target = UpstreamTarget::parse("http://example.test/").unwrap();
        let get = String::from_utf8(build_request_head(
            &Method::GET,
            &target,
            &HeaderList::new(),
            None,
        ))
        .unwrap();
        assert!(!get.contains("Content-Length"));
        let post = String::from_utf8(build_request_head(
            &Method::POST,
            &target,
            &HeaderList::new(),
            None,
        ))
        .unwrap();
        assert!(post.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn connect_reports_refused_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect_to_addrs(&[addr], Duration::from_secs(1))
            .await
            .expect_err("nothing is listening");
        assert!(err.to_string().contains("failed to connect"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tls = ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let client = UpstreamClient::new(
            Arc::new(tls),
            UpstreamLimits {
                connect_timeout: Duration::from_secs(1),
                io_timeout: Duration::from_secs(1),
                max_header_bytes: 1024,
                max_body_bytes: 1024,
            },
        );
        let err = client
            .call(UpstreamRequest {
                method: Method::GET,
                url: format!("http://{addr}/down"),
                headers: HeaderList::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { .. }), "{err:?}");
    }
}
