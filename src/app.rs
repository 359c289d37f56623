use crate::{
    api::HttpCommandApi, catalog::CatalogService, channel::TransportChannel, config::ConfigStore,
    tracker::TaskTracker,
};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::{
    runtime::{Builder, Runtime},
    sync::mpsc,
};

pub const APP_ID: &str = "dev.mal.ModelAssetLauncher";

#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub config: Arc<ConfigStore>,
    pub catalog: Arc<CatalogService>,
    pub api: Arc<HttpCommandApi>,
    pub channel: Arc<TransportChannel>,
    pub tracker: Arc<TaskTracker>,
}

pub fn build_context() -> Result<AppContext> {
    let config = Arc::new(ConfigStore::new()?);
    build_context_with(config)
}

pub fn build_context_with(config: Arc<ConfigStore>) -> Result<AppContext> {
    let runtime = Arc::new(
        Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
    );

    let settings = config.settings();
    let backend_url = settings.backend_endpoint()?;
    let websocket_url = settings.websocket_endpoint()?;

    let catalog = Arc::new(CatalogService::new(Some(config.cache_path()))?);
    let api = Arc::new(
        HttpCommandApi::new(backend_url, settings.request_timeout())
            .context("failed to build backend client")?,
    );
    let tracker = Arc::new(TaskTracker::new(api.clone(), catalog.clone()));
    let channel = Arc::new(TransportChannel::new(
        runtime.handle().clone(),
        websocket_url,
        settings.reconnect_policy(),
    ));

    Ok(AppContext {
        runtime,
        config,
        catalog,
        api,
        channel,
        tracker,
    })
}

impl AppContext {
    /// Opens the task channel, starts feeding its events to the tracker and
    /// refreshes the UI catalog in the background. Returns `false` if the
    /// channel was already running.
    pub fn start(&self) -> bool {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.channel.connect(sender) {
            return false;
        }
        info!(
            "Tracking tasks from {} via {}",
            self.api.base_url(),
            self.channel.url()
        );

        let tracker = self.tracker.clone();
        self.runtime.spawn(async move {
            tracker.pump(receiver).await;
        });

        let catalog = self.catalog.clone();
        let api = self.api.clone();
        self.runtime.spawn(async move {
            if let Err(err) = catalog.refresh(&*api).await {
                warn!("Keeping local UI catalog: {err:#}");
            }
        });
        true
    }

    pub async fn shutdown(&self) {
        self.channel.disconnect().await;
    }
}
