pub mod handler;
pub mod headers;
pub mod http;
pub mod listener;
pub mod request;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

use self::handler::ProxyHandler;

/// State shared by every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub handler: Arc<ProxyHandler>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, handler: Arc<ProxyHandler>) -> Self {
        Self { settings, handler }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
