pub mod cli;
pub mod error;
pub mod fixture;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::{info, warn};

use crate::fixture::FixtureStore;
use crate::proxy::handler::ProxyHandler;
use crate::proxy::upstream::{UpstreamClient, UpstreamLimits};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let app = build_app(settings).await?;
    tokio::select! {
        result = proxy::run(app) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            Ok(())
        }
    }
}

/// Wires the fixture store and upstream client into the shared connection context.
pub async fn build_app(settings: Arc<Settings>) -> Result<proxy::AppContext> {
    let store = FixtureStore::new(settings.fixtures_dir.clone());
    if let Err(err) = store.remove_temp_files().await {
        warn!(
            dir = %settings.fixtures_dir.display(),
            error = %err,
            "failed to clean up stale fixture temp files"
        );
    }

    let tls = build_tls_client_config()?;
    let upstream = UpstreamClient::new(tls, UpstreamLimits::from_settings(&settings));
    let handler = Arc::new(ProxyHandler::new(store, Arc::new(upstream)));
    Ok(proxy::AppContext::new(settings, handler))
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let native = native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load some system trust anchors");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(ignored, "ignored {ignored} invalid system trust anchors");
    }
    if added == 0 {
        // Plain http upstreams still work without anchors.
        warn!("no trust anchors loaded from system locations; https upstreams will fail verification");
    }

    let builder = builder.with_root_certificates(Arc::new(root_store));
    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
