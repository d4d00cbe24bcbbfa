use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use testypie::{build_app, cli::LogFormat, proxy::listener, settings::Settings};

/// A proxy bound to an ephemeral port with its own fixture directory.
pub struct ProxyHarness {
    _temp: TempDir,
    pub fixtures_dir: PathBuf,
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let temp = TempDir::new()?;
        let fixtures_dir = temp.path().join("fixtures");
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let mut settings = Settings {
            listen: addr,
            fixtures_dir: fixtures_dir.clone(),
            log: LogFormat::Text,
            client_timeout: 5,
            upstream_connect_timeout: 2,
            upstream_timeout: 5,
            ..Settings::default()
        };
        configure(&mut settings);
        settings.validate()?;

        let app = build_app(Arc::new(settings)).await?;
        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy listener failed");
            }
        });

        Ok(Self {
            _temp: temp,
            fixtures_dir,
            addr,
            handle,
        })
    }

    pub fn fixtures_dir(&self) -> &Path {
        &self.fixtures_dir
    }

    /// File names currently in the fixture directory, sorted.
    pub fn fixture_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.fixtures_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn read_fixture(&self, name: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.fixtures_dir.join(name))?)
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
