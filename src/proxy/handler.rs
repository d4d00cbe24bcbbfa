use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{BodyOrigin, ProxyError};
use crate::fixture::{CacheKey, ExchangeRecord, FixtureStore};
use crate::metrics;

use super::headers;
use super::request::ProxyRequest;
use super::upstream::{Upstream, UpstreamRequest};

/// Whether a response came from disk or from a fresh upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
}

impl Lookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Hit => "hit",
            Lookup::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub key: CacheKey,
    pub record: ExchangeRecord,
    pub lookup: Lookup,
    /// Fixture written for this request, on a miss.
    pub stored_at: Option<PathBuf>,
}

/// Replays a recorded exchange when one exists, otherwise records a new one.
pub struct ProxyHandler {
    store: FixtureStore,
    upstream: Arc<dyn Upstream>,
}

impl ProxyHandler {
    pub fn new(store: FixtureStore, upstream: Arc<dyn Upstream>) -> Self {
        Self { store, upstream }
    }

    pub fn store(&self) -> &FixtureStore {
        &self.store
    }

    pub async fn handle(&self, request: ProxyRequest) -> Result<Exchange, ProxyError> {
        let key = CacheKey::build(&request.method, &request.url, request.body.as_deref());

        if self.store.exists(&key).await? {
            metrics::record_fixture_lookup(true);
            let record = self.store.read(&key).await?;
            debug!(key = %key, "replaying recorded exchange");
            return Ok(Exchange {
                key,
                record,
                lookup: Lookup::Hit,
                stored_at: None,
            });
        }
        metrics::record_fixture_lookup(false);

        let record = self.fetch(request).await?;
        let path = match self.store.write(&key, &record).await {
            Ok(path) => path,
            Err(err) => {
                metrics::record_fixture_store_error();
                return Err(err);
            }
        };
        metrics::record_fixture_store();
        info!(key = %key, path = %path.display(), status = record.code, "recorded exchange");

        Ok(Exchange {
            key,
            record,
            lookup: Lookup::Miss,
            stored_at: Some(path),
        })
    }

    async fn fetch(&self, request: ProxyRequest) -> Result<ExchangeRecord, ProxyError> {
        let request_body = match &request.body {
            Some(bytes) => Some(
                String::from_utf8(bytes.clone()).map_err(|_| ProxyError::InvalidBodyEncoding {
                    origin: BodyOrigin::Request,
                })?,
            ),
            None => None,
        };

        let upstream_request = UpstreamRequest {
            method: request.method,
            url: request.url,
            headers: headers::outgoing(&request.headers),
            body: request.body,
        };
        let response = match self.upstream.call(upstream_request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "upstream call failed");
                metrics::record_upstream_error(err.kind());
                return Err(err);
            }
        };

        let body = String::from_utf8(response.body).map_err(|_| {
            metrics::record_upstream_error("invalid_body_encoding");
            ProxyError::InvalidBodyEncoding {
                origin: BodyOrigin::Upstream,
            }
        })?;

        Ok(ExchangeRecord {
            code: response.status.as_u16(),
            body,
            headers: headers::incoming(&response.headers),
            request_body,
        })
    }
}
