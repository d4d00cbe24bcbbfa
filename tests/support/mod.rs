#![allow(dead_code)]

pub mod harness;
pub mod upstream;

use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub use harness::ProxyHarness;
pub use upstream::TestUpstream;

/// A parsed response as the client saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl ClientResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = raw
            .split_once("\r\n\r\n")
            .ok_or_else(|| anyhow!("response has no header terminator: {raw:?}"))?;
        let status = head
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("missing status code in {head:?}"))?
            .parse()
            .context("invalid status code")?;
        Ok(Self {
            status,
            head: head.to_string(),
            body: body.to_string(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Sends one raw request on a fresh connection and reads until the proxy closes it.
pub async fn send_raw(addr: std::net::SocketAddr, request: &str) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .context("timed out waiting for proxy response")??;
    ClientResponse::parse(&String::from_utf8_lossy(&buf))
}

pub async fn get(proxy: &ProxyHarness, url: &str, extra_headers: &[(&str, &str)]) -> Result<ClientResponse> {
    request(proxy, "GET", url, extra_headers, None).await
}

pub async fn request(
    proxy: &ProxyHarness,
    method: &str,
    url: &str,
    extra_headers: &[(&str, &str)],
    body: Option<&str>,
) -> Result<ClientResponse> {
    let mut raw = format!("{method} {url} HTTP/1.1\r\nConnection: close\r\n");
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        raw.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    } else {
        raw.push_str("\r\n");
    }
    send_raw(proxy.addr, &raw).await
}
